//! Audio delivery server.
//!
//! Serves catalog items over HTTP with byte-range support. Protected assets
//! are decoded on demand through the decryption pipeline and cached on disk;
//! plain assets are streamed directly from local disk or passed through from
//! a remote store.
//!
//! # Architecture
//!
//! - `config`: CLI and environment configuration
//! - `catalog`: content id to location, source and format
//! - `storage`: local and remote byte access with cancellation
//! - `range`: `Range` header resolution
//! - `delivery`: source selection, decode-on-miss, look-ahead pre-decoding
//! - `http`: axum router and handlers
//! - `server`: shared state and process orchestration
//!
//! # Example
//!
//! ```no_run
//! use cadenza_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let config = ServerConfig::from_args();
//!     config.validate()?;
//!
//!     let server = Server::new(config)?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod catalog;
pub mod config;
pub mod delivery;
pub mod error;
pub mod http;
pub mod range;
pub mod server;
pub mod storage;

pub use catalog::{Catalog, CatalogEntry, FormatKind, JsonCatalog, SourceKind};
pub use config::{LogFormat, ServerConfig};
pub use delivery::{DeliveryController, DeliverySource, PrecacheOutcome, StreamSession};
pub use error::{CatalogError, ConfigError, DeliveryError, ServerError, StorageError};
pub use range::{ByteRange, RangeRequest};
pub use server::{AppState, Server};
pub use storage::{LocalStorage, RemoteStorage, StorageBackend, StorageRouter};
