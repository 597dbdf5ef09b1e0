//! Delivery controller.
//!
//! Chooses how each request is served, in priority order:
//!
//! 1. cached decoded output
//! 2. local plain file, streamed directly
//! 3. protected item from any source: fetch, decode, cache, then serve the cache
//! 4. remote plain item, passed through with range translation
//!
//! Protected bytes are never served undecoded. Look-ahead pre-decoding of the
//! next item in a group runs as a detached task with its own cancellation
//! token, so a client disconnect never stops it.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use cadenza_cache::{CacheError, ResultCache, SNIFF_LEN, sniff_mime};
use cadenza_pipeline::DecryptionPipeline;
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use tokio::io::AsyncSeekExt;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::catalog::{Catalog, CatalogEntry, FormatKind, SourceKind};
use crate::error::{DeliveryError, StorageError};
use crate::range::{RangeRequest, resolve_range};
use crate::storage::{ByteStream, StorageBackend, StorageRouter, file_stream};

/// Where a response body comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverySource {
    /// Decoded output in the result cache
    Cache,
    /// Plain local file
    DirectLocal,
    /// Plain remote object
    RemoteStream,
}

/// One request's response plan.
///
/// Dropping the session, or the body taken from it, cancels the request's
/// token.
pub struct StreamSession {
    /// Requested content id
    pub content_id: String,
    /// Body source
    pub source: DeliverySource,
    /// Resolved range
    pub range: RangeRequest,
    /// Full length of the item
    pub total: u64,
    /// Sniffed MIME type
    pub content_type: &'static str,
    body: Option<ByteStream>,
    guard: DropGuard,
}

impl StreamSession {
    /// Take the body stream. `None` for unsatisfiable ranges.
    ///
    /// The returned stream owns the cancellation guard.
    #[must_use]
    pub fn into_body(self) -> Option<ByteStream> {
        let guard = self.guard;
        self.body
            .map(|inner| Box::pin(GuardedStream { inner, _guard: guard }) as ByteStream)
    }

    /// Bytes the body will carry.
    #[must_use]
    pub fn content_length(&self) -> u64 {
        match self.range {
            RangeRequest::Full => self.total,
            RangeRequest::Partial(range) => range.len(),
            RangeRequest::Unsatisfiable => 0,
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("content_id", &self.content_id)
            .field("source", &self.source)
            .field("range", &self.range)
            .field("total", &self.total)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Body stream that cancels its request when dropped.
struct GuardedStream {
    inner: ByteStream,
    _guard: DropGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Result of an explicit pre-cache request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecacheOutcome {
    /// Entry already present
    AlreadyCached,
    /// Entry written now
    Cached,
    /// Local plain items are served directly and never cached
    NotCacheable,
}

type InflightMap = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Removes a content id's in-flight lock once no caller holds a clone.
///
/// Must be dropped after the caller's own clone of the lock.
struct InflightGuard<'a> {
    map: &'a InflightMap,
    id: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

struct Inner {
    catalog: Arc<dyn Catalog>,
    cache: ResultCache,
    storage: StorageRouter,
    pipeline: DecryptionPipeline,
    inflight: InflightMap,
}

/// Turns content ids into response bodies.
#[derive(Clone)]
pub struct DeliveryController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeliveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryController")
            .field("cache", &self.inner.cache)
            .field("inflight", &self.inner.inflight.len())
            .finish_non_exhaustive()
    }
}

impl DeliveryController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cache: ResultCache,
        storage: StorageRouter,
        pipeline: DecryptionPipeline,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                cache,
                storage,
                pipeline,
                inflight: DashMap::new(),
            }),
        }
    }

    /// Result cache used by this controller
    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    /// Catalog used by this controller
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.inner.catalog
    }

    /// Plan the response for `id`.
    ///
    /// `cancel` is the request's token; it is cancelled when the returned
    /// session or its body is dropped. When `preload` is set, the next item
    /// in the group is scheduled for background decoding before returning.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` for unknown ids, `Decode` when the
    /// pipeline rejects the asset, `Storage` when the source cannot be read
    /// and `Cancelled` when the token fires first.
    pub async fn deliver(
        &self,
        id: &str,
        range_header: Option<&str>,
        preload: bool,
        cancel: CancellationToken,
    ) -> Result<StreamSession, DeliveryError> {
        let entry = self
            .inner
            .catalog
            .resolve(id)
            .ok_or_else(|| DeliveryError::NotFound(id.to_string()))?;

        let guard = cancel.clone().drop_guard();
        let session = self.open_session(&entry, range_header, &cancel, guard).await?;

        tracing::info!(
            content_id = id,
            source = ?session.source,
            range = ?session.range,
            total = session.total,
            "delivering"
        );

        if preload {
            self.schedule_preload(id);
        }

        Ok(session)
    }

    async fn open_session(
        &self,
        entry: &CatalogEntry,
        range_header: Option<&str>,
        cancel: &CancellationToken,
        guard: DropGuard,
    ) -> Result<StreamSession, DeliveryError> {
        match self.serve_cached(&entry.id, range_header, cancel).await {
            Ok(plan) => return Ok(plan.into_session(&entry.id, DeliverySource::Cache, guard)),
            Err(DeliveryError::Cache(CacheError::NotFound(_))) => {}
            Err(e) => return Err(e),
        }

        match (entry.source, entry.format_kind()) {
            (SourceKind::Local, FormatKind::Plain) => {
                let plan = self.serve_source(entry, range_header, cancel).await?;
                Ok(plan.into_session(&entry.id, DeliverySource::DirectLocal, guard))
            }
            (_, FormatKind::Protected) => {
                self.materialize(entry, cancel).await?;
                let plan = self.serve_cached(&entry.id, range_header, cancel).await?;
                Ok(plan.into_session(&entry.id, DeliverySource::Cache, guard))
            }
            (SourceKind::Remote, FormatKind::Plain) => {
                let plan = self.serve_source(entry, range_header, cancel).await?;
                Ok(plan.into_session(&entry.id, DeliverySource::RemoteStream, guard))
            }
        }
    }

    async fn serve_cached(
        &self,
        id: &str,
        range_header: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BodyPlan, DeliveryError> {
        let (mut file, total) = self.inner.cache.open(id).await?;
        let content_type = self.inner.cache.sniff_content_type(id).await?;
        let range = resolve_range(range_header, total);

        let body = match range {
            RangeRequest::Full => Some(file_stream(file, None, cancel)),
            RangeRequest::Partial(r) => {
                let path = self.inner.cache.path_of(id)?;
                file.seek(io::SeekFrom::Start(r.start))
                    .await
                    .map_err(|e| CacheError::Io { path, source: e })?;
                Some(file_stream(file, Some(r.len()), cancel))
            }
            RangeRequest::Unsatisfiable => None,
        };

        Ok(BodyPlan {
            range,
            total,
            content_type,
            body,
        })
    }

    async fn serve_source(
        &self,
        entry: &CatalogEntry,
        range_header: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BodyPlan, DeliveryError> {
        let backend = self.inner.storage.for_source(entry.source);
        let storage_err = |source: StorageError| storage_error(&entry.id, source);

        let total = backend
            .stat_size(&entry.path, cancel)
            .await
            .map_err(storage_err)?;
        let content_type = sniff_source(backend.as_ref(), &entry.path, total, cancel)
            .await
            .map_err(storage_err)?;
        let range = resolve_range(range_header, total);

        let body = match range {
            RangeRequest::Full => Some(
                backend
                    .open_stream(&entry.path, None, cancel)
                    .await
                    .map_err(storage_err)?,
            ),
            RangeRequest::Partial(r) => Some(
                backend
                    .open_stream(&entry.path, Some(r), cancel)
                    .await
                    .map_err(storage_err)?,
            ),
            RangeRequest::Unsatisfiable => None,
        };

        Ok(BodyPlan {
            range,
            total,
            content_type,
            body,
        })
    }

    /// Fetch `entry`, decode it if protected, and write it to the cache.
    ///
    /// Concurrent calls for the same id serialize; later callers find the
    /// entry cached and return without fetching. Returns whether this call
    /// wrote the entry.
    async fn materialize(
        &self,
        entry: &CatalogEntry,
        cancel: &CancellationToken,
    ) -> Result<bool, DeliveryError> {
        let _inflight = InflightGuard {
            map: &self.inner.inflight,
            id: &entry.id,
        };
        let lock = self
            .inner
            .inflight
            .entry(entry.id.clone())
            .or_default()
            .clone();
        let _held = lock.lock().await;
        if self.inner.cache.has(&entry.id).await {
            tracing::debug!(content_id = %entry.id, "already cached by a concurrent request");
            return Ok(false);
        }

        let backend = self.inner.storage.for_source(entry.source);
        let raw = backend
            .read_all(&entry.path, cancel)
            .await
            .map_err(|source| storage_error(&entry.id, source))?;

        let bytes = if entry.is_protected() {
            self.decode(&entry.id, raw).await?
        } else {
            raw
        };

        self.inner.cache.write(&entry.id, &bytes).await?;
        Ok(true)
    }

    async fn decode(&self, id: &str, raw: Vec<u8>) -> Result<Vec<u8>, DeliveryError> {
        let pipeline = self.inner.pipeline.clone();
        let raw_len = raw.len();
        let result = tokio::task::spawn_blocking(move || pipeline.decrypt(&raw))
            .await
            .map_err(|e| DeliveryError::Internal(format!("decode task failed: {e}")))?;

        match result {
            Ok(decoded) => {
                tracing::info!(
                    content_id = id,
                    raw_bytes = raw_len,
                    bytes = decoded.len(),
                    "decoded protected asset"
                );
                Ok(decoded)
            }
            Err(source) => {
                tracing::warn!(
                    content_id = id,
                    stage = %source.stage(),
                    error = %source,
                    "decode failed"
                );
                Err(DeliveryError::Decode {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Decode or fetch `id` into the cache now.
    ///
    /// # Errors
    ///
    /// Same as [`deliver`](Self::deliver).
    pub async fn precache(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<PrecacheOutcome, DeliveryError> {
        let entry = self
            .inner
            .catalog
            .resolve(id)
            .ok_or_else(|| DeliveryError::NotFound(id.to_string()))?;

        if entry.source == SourceKind::Local && !entry.is_protected() {
            return Ok(PrecacheOutcome::NotCacheable);
        }
        if self.inner.cache.has(id).await {
            return Ok(PrecacheOutcome::AlreadyCached);
        }

        if self.materialize(&entry, cancel).await? {
            Ok(PrecacheOutcome::Cached)
        } else {
            Ok(PrecacheOutcome::AlreadyCached)
        }
    }

    /// Schedule background decoding of the item after `id`.
    ///
    /// Detached: the caller holds no handle, and failures are only logged.
    pub fn schedule_preload(&self, id: &str) {
        let Some(next) = self.inner.catalog.next_in_sequence(id) else {
            return;
        };
        if next.source == SourceKind::Local && !next.is_protected() {
            return;
        }

        let controller = self.clone();
        let current = id.to_string();
        tokio::spawn(async move {
            if controller.inner.cache.has(&next.id).await {
                return;
            }
            tracing::debug!(content_id = %next.id, after = %current, "preloading next item");

            let cancel = CancellationToken::new();
            match controller.materialize(&next, &cancel).await {
                Ok(true) => tracing::info!(content_id = %next.id, "preloaded next item"),
                Ok(false) => {}
                Err(e) => tracing::warn!(content_id = %next.id, error = %e, "preload failed"),
            }
        });
    }

    /// Remove cached output for every member of `group_id`.
    pub async fn remove_group(&self, group_id: &str) -> usize {
        let members = self.inner.catalog.members_of(group_id);
        let ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
        self.inner.cache.remove_all_for(group_id, ids).await
    }
}

/// Body and headers for a session, before it is bound to a request guard.
struct BodyPlan {
    range: RangeRequest,
    total: u64,
    content_type: &'static str,
    body: Option<ByteStream>,
}

impl BodyPlan {
    fn into_session(self, id: &str, source: DeliverySource, guard: DropGuard) -> StreamSession {
        StreamSession {
            content_id: id.to_string(),
            source,
            range: self.range,
            total: self.total,
            content_type: self.content_type,
            body: self.body,
            guard,
        }
    }
}

fn storage_error(id: &str, source: StorageError) -> DeliveryError {
    match source {
        StorageError::Cancelled => DeliveryError::Cancelled,
        source => DeliveryError::Storage {
            id: id.to_string(),
            source,
        },
    }
}

async fn sniff_source(
    backend: &dyn StorageBackend,
    location: &str,
    total: u64,
    cancel: &CancellationToken,
) -> Result<&'static str, StorageError> {
    if total == 0 {
        return Ok(sniff_mime(&[]));
    }
    let end = (SNIFF_LEN as u64).min(total) - 1;
    let head = backend.read_range(location, 0, end, cancel).await?;
    Ok(sniff_mime(&head))
}
