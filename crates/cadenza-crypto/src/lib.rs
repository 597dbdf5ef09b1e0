//! Decryption stages for protected audio assets.
//!
//! Two stages run back to back on the encrypted segment of an asset:
//!
//! 1. [`BlockCipherStage`]: AES-256-CBC with a fixed process-wide key. A
//!    padding failure is retried without padding validation after truncating
//!    to a block boundary.
//! 2. [`BytecodeTransform`]: hands the cipher output (UTF-8 text) to a
//!    sandboxed WebAssembly module, prefixes the module's output with the
//!    technology marker and base64-decodes the result.
//!
//! The WebAssembly module is compiled on first use and shared for the rest of
//! the process.

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cipher;
pub mod error;
pub mod transform;

pub use cipher::{BLOCK_SIZE, BlockCipherStage, FIXED_KEY};
pub use error::{CryptoError, CryptoResult};
pub use transform::{BytecodeTransform, ModuleSource, TransformExports};
