//! Server state management and orchestration.
//!
//! Owns the catalog, result cache and delivery controller shared by every
//! HTTP handler, and runs startup housekeeping on the cache directory.

use crate::catalog::{Catalog, JsonCatalog};
use crate::config::ServerConfig;
use crate::delivery::DeliveryController;
use crate::error::ServerError;
use crate::storage::{LocalStorage, RemoteStorage, StorageRouter};
use cadenza_cache::ResultCache;
use cadenza_crypto::{BytecodeTransform, ModuleSource};
use cadenza_pipeline::DecryptionPipeline;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Shared application state for HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Delivery controller (owns catalog and cache handles)
    delivery: DeliveryController,

    /// Look-ahead default when a request does not say
    preload_default: bool,

    /// Server start time (for health)
    started_at: SystemTime,
}

impl AppState {
    /// Create new application state from configuration.
    ///
    /// The transform module is loaded lazily on first decode.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the catalog cannot be loaded or the cache
    /// directory cannot be created.
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let transform = Arc::new(BytecodeTransform::new(
            ModuleSource::File(config.transform_module.clone()),
            config.transform_exports(),
        ));
        Self::with_transform(config, transform)
    }

    /// Create application state with an already-built transform stage.
    ///
    /// # Errors
    ///
    /// Same as [`AppState::new`].
    pub fn with_transform(
        config: &ServerConfig,
        transform: Arc<BytecodeTransform>,
    ) -> Result<Self, ServerError> {
        tracing::info!("Loading catalog from {:?}", config.catalog);

        let catalog = JsonCatalog::from_file(&config.catalog)?;

        tracing::info!(
            "Loaded {} items in {} groups",
            catalog.len(),
            catalog.group_count()
        );

        let cache = ResultCache::new(config.cache_config())?;

        let base_url = config
            .remote_base_url
            .as_deref()
            .map(url::Url::parse)
            .transpose()
            .map_err(|e| crate::error::ConfigError::InvalidValue {
                field: "remote-base-url".to_string(),
                reason: e.to_string(),
            })?;
        let remote = RemoteStorage::new(
            base_url,
            config.remote_auth(),
            Duration::from_secs(config.remote_timeout_secs),
        )
        .map_err(ServerError::HttpClientSetup)?;
        let storage = StorageRouter::new(Arc::new(LocalStorage::new()), Arc::new(remote));

        let delivery = DeliveryController::new(
            Arc::new(catalog),
            cache,
            storage,
            DecryptionPipeline::new(transform),
        );

        Ok(Self {
            delivery,
            preload_default: config.preload_next,
            started_at: SystemTime::now(),
        })
    }

    /// Get reference to the delivery controller.
    #[must_use]
    pub const fn delivery(&self) -> &DeliveryController {
        &self.delivery
    }

    /// Get reference to the catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        self.delivery.catalog()
    }

    /// Get reference to the result cache.
    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        self.delivery.cache()
    }

    /// Look-ahead default for requests without a `preload` parameter.
    #[must_use]
    pub const fn preload_default(&self) -> bool {
        self.preload_default
    }

    /// Get server uptime in seconds.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
            .as_secs()
    }

    /// Drop cache entries for ids no longer in the catalog, then enforce
    /// the cache caps once.
    ///
    /// Failures are logged; a dirty cache never blocks startup.
    pub async fn tidy_cache(&self) {
        let valid = self.catalog().ids();
        match self.cache().remove_orphaned(&valid).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Removed {} orphaned cache entries", removed),
            Err(e) => tracing::warn!("Orphan cleanup failed: {e}"),
        }
        match self.cache().evict().await {
            Ok(report) => tracing::info!(
                files = report.remaining_files,
                bytes = report.remaining_bytes,
                removed = report.removed,
                "Cache ready"
            ),
            Err(e) => tracing::warn!("Initial eviction failed: {e}"),
        }
    }
}

/// Server orchestration.
pub struct Server {
    /// Shared application state
    state: Arc<AppState>,
    /// Server configuration
    config: ServerConfig,
}

impl Server {
    /// Create new server with configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the catalog cannot be loaded or the cache
    /// directory cannot be created.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let state = AppState::new(&config)?;

        Ok(Self {
            state: Arc::new(state),
            config,
        })
    }

    /// Run the server until interrupted.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the shutdown signal cannot be installed.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Starting Cadenza Server");
        tracing::info!("HTTP server binding to: {}", self.config.http_bind);
        tracing::info!("Cache directory: {:?}", self.config.cache_dir);

        self.state.tidy_cache().await;

        let http_state = self.state.clone();
        let http_bind = self.config.http_bind;

        let http_server = tokio::spawn(async move {
            if let Err(e) = crate::http::start_server(http_bind, http_state).await {
                tracing::error!("HTTP server failed: {e}");
            }
        });

        // Wait for shutdown signal
        tokio::signal::ctrl_c().await.map_err(|e| {
            ServerError::Shutdown(format!("Failed to listen for shutdown signal: {e}"))
        })?;

        tracing::info!("Shutdown signal received, stopping server");

        http_server.abort();

        Ok(())
    }

    #[cfg(test)]
    const fn state(&self) -> &Arc<AppState> {
        &self.state
    }
}
