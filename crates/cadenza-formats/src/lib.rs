//! Tag header parsing and key material resolution for protected audio assets.
//!
//! A protected asset starts with an ID3v2-style tag region. The frames in that
//! region carry the control data needed to decrypt the audio that follows:
//! the length of the encrypted segment, the initialization vector, the track
//! number and a "technology" marker that prefixes the decoded text.
//!
//! # Modules
//!
//! - [`header`]: tag header detection and synchsafe size decoding
//! - [`frames`]: strict, structured frame reader for tag versions 2.3 and 2.4
//! - [`scan`]: lenient byte walker covering tag versions 2.2, 2.3 and 2.4
//! - [`descriptor`]: merges both paths into a [`TagDescriptor`]
//!
//! # Example
//!
//! ```no_run
//! use cadenza_formats::{header_size, resolve_descriptor};
//!
//! # fn main() -> Result<(), cadenza_formats::FormatError> {
//! let raw = std::fs::read("chapter.xm").unwrap_or_default();
//! let header = header_size(&raw);
//! let descriptor = resolve_descriptor(&raw, header)?;
//! println!("segment is {} bytes", descriptor.segment_size);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod descriptor;
pub mod error;
pub mod frames;
pub mod header;
pub mod scan;
mod text;

pub use descriptor::{
    ExtractionRule, Field, IV_LEN, RULES, TagDescriptor, normalize_iv, resolve_descriptor,
};
pub use error::{FormatError, FormatResult};
pub use frames::{TextFrame, read_text_frames};
pub use header::{
    MAX_METADATA_PEEK, TAG_MAGIC, TAG_PREFIX_LEN, TagHeader, decode_synchsafe, encode_synchsafe,
    header_size, metadata_read_size,
};
pub use scan::scan_text_frames;
