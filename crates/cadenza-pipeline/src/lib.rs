//! Decryption pipeline for protected audio assets.
//!
//! [`DecryptionPipeline`] runs the stages strictly in order:
//!
//! ```text
//! Raw -> HeaderParsed -> DescriptorResolved -> CipherDecoded -> TransformDecoded -> Assembled
//! ```
//!
//! Any failure aborts with a [`DecryptError`] naming the stage; no partial
//! output is returned. On success the output is the decoded segment followed
//! by every byte of the asset after the encrypted window.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cadenza_crypto::{BytecodeTransform, ModuleSource, TransformExports};
//! use cadenza_pipeline::DecryptionPipeline;
//!
//! let transform = Arc::new(BytecodeTransform::new(
//!     ModuleSource::File("transform.wasm".into()),
//!     TransformExports::default(),
//! ));
//! let pipeline = DecryptionPipeline::new(transform);
//! let raw = std::fs::read("chapter.xm").unwrap_or_default();
//! match pipeline.decrypt(&raw) {
//!     Ok(audio) => println!("{} bytes", audio.len()),
//!     Err(e) => eprintln!("failed at {}: {e}", e.stage()),
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;
pub mod pipeline;

pub use error::{DecryptError, PipelineStage};
pub use pipeline::DecryptionPipeline;
