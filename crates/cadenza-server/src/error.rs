//! Error types for the delivery server.

use std::path::PathBuf;

use cadenza_cache::CacheError;
use cadenza_pipeline::DecryptError;
use thiserror::Error;

/// Catalog loading and validation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Failed to read the catalog file
    #[error("Failed to load catalog from {path}: {source}")]
    LoadFailed {
        /// Path to the catalog file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid JSON in the catalog file
    #[error("Invalid JSON in catalog file: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Two entries share an id
    #[error("Duplicate content id in catalog: {0}")]
    DuplicateId(String),

    /// An entry failed validation
    #[error("Invalid catalog entry {id}: {reason}")]
    InvalidEntry {
        /// Entry id
        id: String,
        /// Reason for validation failure
        reason: String,
    },
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required configuration value
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A value is out of range or malformed
    #[error("Invalid {field}: {reason}")]
    InvalidValue {
        /// Flag name
        field: String,
        /// Reason for invalidity
        reason: String,
    },
}

/// Storage collaborator errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Local filesystem error
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Remote request failed
    #[error("Request to {url} failed: {source}")]
    Request {
        /// Request URL
        url: String,
        /// Underlying error
        #[source]
        source: reqwest::Error,
    },

    /// Remote returned an unexpected status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Status code
        status: u16,
        /// Request URL
        url: String,
    },

    /// Remote did not report a size
    #[error("No content length reported for {url}")]
    MissingContentLength {
        /// Request URL
        url: String,
    },

    /// Location could not be turned into a URL
    #[error("Invalid remote location {location}: {reason}")]
    InvalidLocation {
        /// Catalog location
        location: String,
        /// Reason
        reason: String,
    },

    /// Remote item requested without a configured remote store
    #[error("No remote storage configured for {0}")]
    RemoteUnavailable(String),

    /// The request was cancelled by the client
    #[error("Cancelled")]
    Cancelled,
}

/// Errors surfaced by the delivery controller.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Unknown content id
    #[error("Content not found: {0}")]
    NotFound(String),

    /// The decryption pipeline failed
    #[error("Failed to decode {id}: {source}")]
    Decode {
        /// Content id
        id: String,
        /// Pipeline error
        #[source]
        source: DecryptError,
    },

    /// Reading the source failed
    #[error("Failed to read {id}: {source}")]
    Storage {
        /// Content id
        id: String,
        /// Storage error
        #[source]
        source: StorageError,
    },

    /// Cache I/O failed on the critical path
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// The client went away
    #[error("Request cancelled")]
    Cancelled,

    /// Background task panicked or was aborted
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Server runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind HTTP server
    #[error("Failed to bind HTTP server to {addr}: {source}")]
    HttpBindFailed {
        /// Address that failed to bind
        addr: std::net::SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Catalog error
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cache setup error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Remote storage client setup error
    #[error("Failed to build HTTP client: {0}")]
    HttpClientSetup(#[source] reqwest::Error),

    /// Server shutdown error
    #[error("Server shutdown error: {0}")]
    Shutdown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_error_messages() {
        let err = CatalogError::DuplicateId("ch-1".to_string());
        assert_eq!(err.to_string(), "Duplicate content id in catalog: ch-1");

        let err = CatalogError::InvalidEntry {
            id: "ch-2".to_string(),
            reason: "empty path".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid catalog entry ch-2: empty path");
    }

    #[test]
    fn test_server_error_conversion() {
        let err: ServerError = CatalogError::DuplicateId("x".to_string()).into();
        assert!(err.to_string().contains("Duplicate content id"));
    }
}
