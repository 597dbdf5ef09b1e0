//! Error types for the decryption stages

use thiserror::Error;

/// Errors raised by the cipher and transform stages
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key size
    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize {
        /// Expected key size in bytes
        expected: usize,
        /// Actual key size in bytes
        actual: usize,
    },

    /// Both the padded and the unpadded decrypt attempts failed
    #[error("block cipher failed on {segment_len}-byte segment")]
    CipherFailure {
        /// Length of the encrypted segment
        segment_len: usize,
    },

    /// The bytecode module could not be loaded or did not expose the
    /// expected exports
    #[error("transform module unavailable: {0}")]
    ModuleUnavailable(String),

    /// The bytecode module trapped, returned an invalid pointer or a negative
    /// length, or produced output that does not decode
    #[error("transform failed: {0}")]
    TransformFailure(String),
}

/// Result type for decryption stages
pub type CryptoResult<T> = Result<T, CryptoError>;
