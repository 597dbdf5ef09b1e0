//! Tag parsing error types

use thiserror::Error;

/// Errors raised while reading the tag region of a protected asset
#[derive(Debug, Error)]
pub enum FormatError {
    /// The asset does not start with the tag magic
    #[error("missing tag header")]
    MissingHeader,

    /// Tag major version the structured reader does not handle
    #[error("unsupported tag version 2.{0}")]
    UnsupportedVersion(u8),

    /// A frame id contained characters outside `A-Z0-9`
    #[error("invalid frame id {id:02X?} at offset {offset}")]
    InvalidFrameId {
        /// Absolute offset of the frame header
        offset: usize,
        /// The raw id bytes
        id: [u8; 4],
    },

    /// A frame declared more payload than the tag region holds
    #[error("frame {id} declares {size} bytes but only {available} remain")]
    FrameOverrun {
        /// Frame id
        id: String,
        /// Declared payload size
        size: usize,
        /// Bytes left in the tag region
        available: usize,
    },

    /// Neither extraction path produced an initialization vector
    #[error("no initialization vector found in tag frames")]
    MissingKeyMaterial,

    /// Binary parsing error
    #[error("binary parsing error: {0}")]
    BinRw(#[from] binrw::Error),
}

/// Result type for tag parsing
pub type FormatResult<T> = Result<T, FormatError>;
