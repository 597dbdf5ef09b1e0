//! Error types for cache operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Content id cannot be mapped to a file name
    #[error("invalid content id: {0:?}")]
    InvalidContentId(String),

    /// No entry for the content id
    #[error("not cached: {0}")]
    NotFound(String),

    /// Invalid cache configuration
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// Filesystem error on a specific path
    #[error("cache I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
