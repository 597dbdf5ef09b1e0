//! HTTP request handlers for streaming and cache management.

use crate::delivery::PrecacheOutcome;
use crate::error::DeliveryError;
use crate::range::RangeRequest;
use crate::server::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use cadenza_cache::{CacheError, CacheInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Query parameters for the stream endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Pre-decode the next item in the group; server default when absent
    pub preload: Option<bool>,
}

/// Handle GET /api/stream/{id}.
///
/// Serves the item with byte-range support: 200 for the whole body, 206 for
/// a satisfiable `Range`, 416 otherwise.
///
/// # Errors
///
/// Returns `AppError` if the id is unknown, decoding fails or the source
/// cannot be read.
pub async fn stream_content(
    Path(id): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let preload = params.preload.unwrap_or_else(|| state.preload_default());

    tracing::debug!(
        "Handling stream request for {} (range: {:?}, preload: {})",
        id,
        range_header,
        preload
    );

    // Dropped with the response body, or with this future if the client
    // disconnects while the session is being prepared
    let cancel = CancellationToken::new();
    let session = state
        .delivery()
        .deliver(&id, range_header, preload, cancel)
        .await?;

    let total = session.total;
    let content_length = session.content_length();
    let content_type = session.content_type;

    let builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, content_type);

    let builder = match session.range {
        RangeRequest::Full => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, content_length),
        RangeRequest::Partial(range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_LENGTH, content_length)
            .header(header::CONTENT_RANGE, range.content_range(total)),
        RangeRequest::Unsatisfiable => builder
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(
                header::CONTENT_RANGE,
                RangeRequest::unsatisfied_content_range(total),
            ),
    };

    let body = session.into_body().map_or_else(Body::empty, Body::from_stream);

    builder
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build response: {e}")))
}

/// Cache listing response.
#[derive(Debug, Serialize)]
pub struct CacheListing {
    /// Number of entries
    pub count: usize,
    /// Sum of entry sizes
    pub total_bytes: u64,
    /// Entries, oldest first
    pub entries: Vec<CacheInfo>,
}

/// Handle GET /api/cache.
///
/// # Errors
///
/// Returns `AppError` if the cache directory cannot be read.
pub async fn list_cache(State(state): State<Arc<AppState>>) -> Result<Json<CacheListing>, AppError> {
    let entries = state.cache().list().await?;
    let total_bytes = entries.iter().map(|e| e.size).sum();

    Ok(Json(CacheListing {
        count: entries.len(),
        total_bytes,
        entries,
    }))
}

/// Removal count response.
#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    /// Entries removed
    pub removed: usize,
}

/// Handle DELETE /api/cache.
///
/// # Errors
///
/// Returns `AppError` if the cache directory cannot be read.
pub async fn clear_cache(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RemovedResponse>, AppError> {
    let removed = state.cache().clear().await?;
    tracing::info!("Cleared {} cache entries", removed);
    Ok(Json(RemovedResponse { removed }))
}

/// Handle DELETE /api/cache/{id}.
///
/// # Errors
///
/// Returns `AppError` for ids that cannot name a cache entry, or on I/O
/// failure.
pub async fn remove_cached(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RemovedResponse>, AppError> {
    let removed = state.cache().remove_one(&id).await?;
    Ok(Json(RemovedResponse {
        removed: usize::from(removed),
    }))
}

/// Pre-cache response.
#[derive(Debug, Serialize)]
pub struct PrecacheResponse {
    /// Content id
    pub id: String,
    /// What happened
    pub outcome: PrecacheOutcome,
}

/// Handle POST /api/cache/{id}.
///
/// Decodes (or fetches, for remote plain items) the item into the cache
/// without streaming it.
///
/// # Errors
///
/// Same as the stream endpoint.
pub async fn precache_content(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<PrecacheResponse>, AppError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let outcome = state.delivery().precache(&id, &cancel).await?;
    Ok(Json(PrecacheResponse { id, outcome }))
}

/// Handle DELETE /api/groups/{group_id}/cache.
///
/// Removes cached output for every member of the group.
pub async fn remove_group_cache(
    Path(group_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Json<RemovedResponse> {
    let removed = state.delivery().remove_group(&group_id).await;
    Json(RemovedResponse { removed })
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok"
    pub status: &'static str,
    /// Seconds since startup
    pub uptime_seconds: u64,
}

/// Handle GET /health.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Application-level error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Resource not found (404)
    NotFound(String),
    /// Malformed request (400)
    BadRequest(String),
    /// Decoding failed (500, short diagnostic)
    Decode(String),
    /// Upstream storage failed (502)
    Storage(String),
    /// Client went away; the response is never seen
    Cancelled,
    /// Anything else (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Decode(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            Self::Storage(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Cancelled => {
                tracing::debug!("Request cancelled by client");
                // nginx's "client closed request"
                let status = StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST);
                (status, "request cancelled".to_string())
            }
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, message).into_response()
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::NotFound(id) => Self::NotFound(format!("Content not found: {id}")),
            DeliveryError::Decode { id, source } => {
                tracing::error!(content_id = %id, stage = %source.stage(), "{source}");
                Self::Decode(source.diagnostic())
            }
            DeliveryError::Storage { id, source } => {
                tracing::error!(content_id = %id, "Storage read failed: {source}");
                Self::Storage(format!("upstream read failed for {id}"))
            }
            DeliveryError::Cache(err) => err.into(),
            DeliveryError::Cancelled => Self::Cancelled,
            DeliveryError::Internal(msg) => {
                tracing::error!("{msg}");
                Self::Internal(msg)
            }
        }
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidContentId(id) => Self::BadRequest(format!("Invalid content id: {id}")),
            CacheError::NotFound(id) => Self::NotFound(format!("Not cached: {id}")),
            err => {
                tracing::error!("Cache error: {err}");
                Self::Internal(err.to_string())
            }
        }
    }
}
