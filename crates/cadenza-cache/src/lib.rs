//! Bounded on-disk cache for decoded audio.
//!
//! Each entry is one file, `<content-id>.cache`, inside a single directory
//! the cache owns exclusively. Entries are written atomically and evicted
//! oldest-modified first once the cache exceeds its file-count or byte cap.
//! Eviction runs at most once per debounce window after a write.
//!
//! # Example
//!
//! ```no_run
//! use cadenza_cache::{ResultCache, ResultCacheConfig};
//!
//! # async fn demo() -> Result<(), cadenza_cache::CacheError> {
//! let cache = ResultCache::new(ResultCacheConfig::new("./data/cache"))?;
//! cache.write("chapter-1", b"ID3...").await?;
//! assert!(cache.has("chapter-1").await);
//! println!("{}", cache.sniff_content_type("chapter-1").await?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod cache;
pub mod config;
pub mod error;
pub mod eviction;
pub mod sniff;

pub use cache::{CacheInfo, MAX_CONTENT_ID_LEN, ResultCache};
pub use config::ResultCacheConfig;
pub use error::{CacheError, CacheResult};
pub use eviction::EvictionReport;
pub use sniff::{SNIFF_LEN, sniff_mime};
