//! Server configuration management.
//!
//! Configuration comes from CLI arguments, environment variables prefixed
//! `CADENZA_`, or built-in defaults.
//!
//! # Example
//!
//! ```no_run
//! use cadenza_server::ServerConfig;
//!
//! let config = ServerConfig::from_args();
//! config.validate().expect("Invalid configuration");
//!
//! println!("HTTP server will bind to: {}", config.http_bind);
//! println!("Cache directory: {}", config.cache_dir.display());
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use cadenza_cache::ResultCacheConfig;
use cadenza_crypto::TransformExports;
use clap::{ArgAction, Parser, ValueEnum};

use crate::error::ConfigError;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable
    Text,
    /// One JSON object per line
    Json,
}

/// Server configuration loaded from CLI args and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cadenza-server",
    about = "Audio delivery server with on-demand decoding of protected assets",
    version
)]
pub struct ServerConfig {
    /// HTTP bind address
    #[arg(long, env = "CADENZA_HTTP_BIND", default_value = "0.0.0.0:3000")]
    pub http_bind: SocketAddr,

    /// Path to the catalog JSON file
    #[arg(long, env = "CADENZA_CATALOG", default_value = "./catalog.json")]
    pub catalog: PathBuf,

    /// Directory for decoded output
    #[arg(long, env = "CADENZA_CACHE_DIR", default_value = "./data/cache")]
    pub cache_dir: PathBuf,

    /// Maximum number of cached files
    #[arg(long, env = "CADENZA_CACHE_MAX_FILES", default_value_t = 50)]
    pub cache_max_files: usize,

    /// Maximum total cache size in bytes
    #[arg(long, env = "CADENZA_CACHE_MAX_BYTES", default_value_t = 2_147_483_648)]
    pub cache_max_bytes: u64,

    /// Seconds between a cache write and the eviction sweep it triggers
    #[arg(long, env = "CADENZA_EVICTION_DEBOUNCE_SECS", default_value_t = 10)]
    pub eviction_debounce_secs: u64,

    /// WebAssembly module implementing the secondary transform
    #[arg(
        long,
        env = "CADENZA_TRANSFORM_MODULE",
        default_value = "./data/transform.wasm"
    )]
    pub transform_module: PathBuf,

    /// Export name of the module's allocator
    #[arg(
        long,
        env = "CADENZA_TRANSFORM_ALLOCATE_EXPORT",
        default_value = "allocate"
    )]
    pub transform_allocate_export: String,

    /// Export name of the transform entry point
    #[arg(long, env = "CADENZA_TRANSFORM_EXPORT", default_value = "transform")]
    pub transform_export: String,

    /// Export name of the module's linear memory
    #[arg(long, env = "CADENZA_TRANSFORM_MEMORY_EXPORT", default_value = "memory")]
    pub transform_memory_export: String,

    /// Export name of the module's stack-pointer adjuster, if it has one
    #[arg(long, env = "CADENZA_TRANSFORM_STACK_EXPORT")]
    pub transform_stack_export: Option<String>,

    /// Export name of the module's `free(ptr, len)`, if it has one
    #[arg(long, env = "CADENZA_TRANSFORM_FREE_EXPORT")]
    pub transform_free_export: Option<String>,

    /// Base URL that relative remote catalog locations resolve against
    #[arg(long, env = "CADENZA_REMOTE_BASE_URL")]
    pub remote_base_url: Option<String>,

    /// Basic-auth user for the remote store
    #[arg(long, env = "CADENZA_REMOTE_USERNAME")]
    pub remote_username: Option<String>,

    /// Basic-auth password for the remote store
    #[arg(long, env = "CADENZA_REMOTE_PASSWORD", hide_env_values = true)]
    pub remote_password: Option<String>,

    /// Remote request timeout in seconds
    #[arg(long, env = "CADENZA_REMOTE_TIMEOUT_SECS", default_value_t = 120)]
    pub remote_timeout_secs: u64,

    /// Pre-decode the next item in a group when a request does not say
    #[arg(
        long,
        env = "CADENZA_PRELOAD_NEXT",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub preload_next: bool,

    /// Log output format
    #[arg(long, env = "CADENZA_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Parse configuration from command-line arguments.
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Result cache settings
    #[must_use]
    pub fn cache_config(&self) -> ResultCacheConfig {
        ResultCacheConfig::new(&self.cache_dir)
            .with_max_files(self.cache_max_files)
            .with_max_bytes(self.cache_max_bytes)
            .with_debounce(Duration::from_secs(self.eviction_debounce_secs))
    }

    /// Transform module export names
    #[must_use]
    pub fn transform_exports(&self) -> TransformExports {
        TransformExports {
            allocate: self.transform_allocate_export.clone(),
            transform: self.transform_export.clone(),
            memory: self.transform_memory_export.clone(),
            stack_adjust: self.transform_stack_export.clone(),
            free: self.transform_free_export.clone(),
        }
    }

    /// Remote basic-auth credentials, if configured
    #[must_use]
    pub fn remote_auth(&self) -> Option<(String, String)> {
        match (&self.remote_username, &self.remote_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Catalog file doesn't exist
    /// - A cache cap is zero
    /// - Only one of the remote username/password is set
    /// - The remote base URL does not parse
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.catalog.exists() {
            return Err(ConfigError::MissingRequired(format!(
                "catalog file not found: {}",
                self.catalog.display()
            )));
        }

        self.cache_config()
            .validate()
            .map_err(|reason| ConfigError::InvalidValue {
                field: "cache".to_string(),
                reason,
            })?;

        match (&self.remote_username, &self.remote_password) {
            (Some(_), None) => {
                return Err(ConfigError::MissingRequired(
                    "remote username provided without password".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingRequired(
                    "remote password provided without username".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(base) = &self.remote_base_url {
            url::Url::parse(base).map_err(|e| ConfigError::InvalidValue {
                field: "remote-base-url".to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn parse(extra: &[&str]) -> ServerConfig {
        let mut args = vec!["cadenza-server"];
        args.extend_from_slice(extra);
        ServerConfig::parse_from(args)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.http_bind.port(), 3000);
        assert_eq!(config.cache_max_files, 50);
        assert_eq!(config.cache_max_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.eviction_debounce_secs, 10);
        assert!(config.preload_next);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.transform_exports(), TransformExports::default());
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--preload-next",
            "false",
            "--transform-export",
            "g",
            "--transform-stack-export",
            "a",
            "--transform-free-export",
            "dealloc",
            "--log-format",
            "json",
        ]);
        assert!(!config.preload_next);
        assert_eq!(config.log_format, LogFormat::Json);
        let exports = config.transform_exports();
        assert_eq!(exports.transform, "g");
        assert_eq!(exports.stack_adjust.as_deref(), Some("a"));
        assert_eq!(exports.free.as_deref(), Some("dealloc"));
    }

    #[test]
    fn test_validate_catalog_missing() {
        let config = parse(&["--catalog", "/definitely/not/here.json"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_validate_auth_pairing() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&["--catalog", path, "--remote-username", "u"]);
        assert!(config.validate().is_err());

        let config = parse(&[
            "--catalog",
            path,
            "--remote-username",
            "u",
            "--remote-password",
            "p",
        ]);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.remote_auth(),
            Some(("u".to_string(), "p".to_string()))
        );
    }

    #[test]
    fn test_validate_cache_caps() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let config = parse(&["--catalog", path, "--cache-max-files", "0"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_remote_url() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let config = parse(&["--catalog", path, "--remote-base-url", "not a url"]);
        assert!(config.validate().is_err());
    }
}
