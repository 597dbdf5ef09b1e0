//! Cadenza server binary entry point.
//!
//! Thin wrapper around the cadenza-server library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Validates configuration
//! 4. Starts the server

use anyhow::Result;
use cadenza_server::{LogFormat, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse first so --log-format can pick the formatter
    let config = ServerConfig::from_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    tracing::info!(
        "Configuration loaded: HTTP={}, catalog={:?}, cache={:?}",
        config.http_bind,
        config.catalog,
        config.cache_dir
    );

    config.validate()?;

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
