//! HTTP server implementation using axum.

use crate::error::ServerError;
use crate::server::AppState;
use axum::Router;
use axum::routing::{delete, get};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod handlers;

/// Create HTTP router with all endpoints.
///
/// No compression layer: compressed bodies would invalidate byte ranges.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/stream/{id}", get(handlers::stream_content))
        .route(
            "/api/cache",
            get(handlers::list_cache).delete(handlers::clear_cache),
        )
        .route(
            "/api/cache/{id}",
            delete(handlers::remove_cached).post(handlers::precache_content),
        )
        .route(
            "/api/groups/{group_id}/cache",
            delete(handlers::remove_group_cache),
        )
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start HTTP server.
///
/// # Errors
///
/// Returns `ServerError` if the server fails to bind or encounters a runtime error.
pub async fn start_server(bind_addr: SocketAddr, state: Arc<AppState>) -> Result<(), ServerError> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ServerError::HttpBindFailed {
            addr: bind_addr,
            source,
        })?;

    tracing::info!("HTTP server listening on {}", bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::Shutdown(format!("HTTP server error: {e}")))?;

    Ok(())
}
