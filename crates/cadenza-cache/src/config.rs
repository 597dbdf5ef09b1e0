//! Result cache configuration

use std::path::PathBuf;
use std::time::Duration;

/// Default cap on cached files
pub const DEFAULT_MAX_FILES: usize = 50;

/// Default cap on total cached bytes (2 GiB)
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default delay between a write and the eviction sweep it triggers
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);

/// Configuration for [`ResultCache`](crate::ResultCache)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCacheConfig {
    /// Directory holding cache files
    pub cache_dir: PathBuf,
    /// Maximum number of cached files
    pub max_files: usize,
    /// Maximum total size of cached files
    pub max_bytes: u64,
    /// Eviction debounce window
    pub debounce: Duration,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/cache"),
            max_files: DEFAULT_MAX_FILES,
            max_bytes: DEFAULT_MAX_BYTES,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl ResultCacheConfig {
    /// Configuration with default limits rooted at `cache_dir`
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Set maximum number of files
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Set maximum total size
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set eviction debounce window
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_files == 0 {
            return Err("max_files must be greater than 0".to_string());
        }
        if self.max_bytes == 0 {
            return Err("max_bytes must be greater than 0".to_string());
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err("cache_dir must not be empty".to_string());
        }
        Ok(())
    }
}
