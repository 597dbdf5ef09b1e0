//! Byte access to local files and the remote store.
//!
//! Every operation takes a [`CancellationToken`]; cancelling it aborts the
//! in-flight read with [`StorageError::Cancelled`], and streams opened
//! before cancellation end early.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::catalog::SourceKind;
use crate::error::StorageError;
use crate::range::ByteRange;

/// Boxed body stream handed to the HTTP layer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring provider for rustls once per process.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Another component may have installed one already
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Cancellable byte access to one kind of storage.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Total size of the object in bytes.
    async fn stat_size(&self, location: &str, cancel: &CancellationToken)
    -> Result<u64, StorageError>;

    /// Whole object.
    async fn read_all(&self, location: &str, cancel: &CancellationToken)
    -> Result<Vec<u8>, StorageError>;

    /// Bytes `start..=end`, clamped to the object's length.
    async fn read_range(
        &self,
        location: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes, StorageError>;

    /// Stream the object, or a range of it.
    async fn open_stream(
        &self,
        location: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, StorageError>;
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

/// Local filesystem storage.
#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    /// Create local storage.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn io_error(location: &str, source: io::Error) -> StorageError {
        StorageError::Io {
            path: PathBuf::from(location),
            source,
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn stat_size(
        &self,
        location: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        cancellable(cancel, async {
            tokio::fs::metadata(location)
                .await
                .map(|meta| meta.len())
                .map_err(|e| Self::io_error(location, e))
        })
        .await
    }

    async fn read_all(
        &self,
        location: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, StorageError> {
        cancellable(cancel, async {
            tokio::fs::read(location)
                .await
                .map_err(|e| Self::io_error(location, e))
        })
        .await
    }

    async fn read_range(
        &self,
        location: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes, StorageError> {
        cancellable(cancel, async {
            let mut file = tokio::fs::File::open(location)
                .await
                .map_err(|e| Self::io_error(location, e))?;
            file.seek(io::SeekFrom::Start(start))
                .await
                .map_err(|e| Self::io_error(location, e))?;
            let mut buf = Vec::new();
            file.take(end.saturating_sub(start).saturating_add(1))
                .read_to_end(&mut buf)
                .await
                .map_err(|e| Self::io_error(location, e))?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn open_stream(
        &self,
        location: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, StorageError> {
        let file = cancellable(cancel, async {
            let mut file = tokio::fs::File::open(location)
                .await
                .map_err(|e| Self::io_error(location, e))?;
            if let Some(range) = range {
                file.seek(io::SeekFrom::Start(range.start))
                    .await
                    .map_err(|e| Self::io_error(location, e))?;
            }
            Ok(file)
        })
        .await?;

        Ok(file_stream(file, range.map(|r| r.len()), cancel))
    }
}

/// Stream an already-positioned file, optionally limited to `limit` bytes.
pub(crate) fn file_stream(
    file: tokio::fs::File,
    limit: Option<u64>,
    cancel: &CancellationToken,
) -> ByteStream {
    let stop = cancel.clone().cancelled_owned();
    match limit {
        Some(limit) => Box::pin(ReaderStream::new(file.take(limit)).take_until(stop)),
        None => Box::pin(ReaderStream::new(file).take_until(stop)),
    }
}

/// Remote HTTP storage.
///
/// Relative catalog locations resolve against the base URL; absolute URLs
/// are used as-is. Basic auth is attached to every request when configured.
#[derive(Debug, Clone)]
pub struct RemoteStorage {
    client: Client,
    base_url: Option<Url>,
    auth: Option<(String, String)>,
}

impl RemoteStorage {
    /// Create remote storage.
    ///
    /// `timeout` bounds connection setup and each read, not the whole
    /// transfer, so long streams are not cut off.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the client cannot be built.
    pub fn new(
        base_url: Option<Url>,
        auth: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        ensure_crypto_provider();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("cadenza-server/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    /// Resolve a catalog location to a URL.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::RemoteUnavailable` for a relative location
    /// without a base URL, or `InvalidLocation` if it does not parse.
    pub fn resolve_url(&self, location: &str) -> Result<Url, StorageError> {
        match Url::parse(location) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self
                    .base_url
                    .as_ref()
                    .ok_or_else(|| StorageError::RemoteUnavailable(location.to_string()))?;
                base.join(location)
                    .map_err(|e| StorageError::InvalidLocation {
                        location: location.to_string(),
                        reason: e.to_string(),
                    })
            }
            Err(e) => Err(StorageError::InvalidLocation {
                location: location.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Response, StorageError> {
        let request = self.with_auth(request);
        cancellable(cancel, async {
            request.send().await.map_err(|source| StorageError::Request {
                url: url.to_string(),
                source,
            })
        })
        .await
    }

    async fn body(
        response: Response,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Bytes, StorageError> {
        cancellable(cancel, async {
            response.bytes().await.map_err(|source| StorageError::Request {
                url: url.to_string(),
                source,
            })
        })
        .await
    }

    fn check_status(response: &Response, url: &Url) -> Result<(), StorageError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StorageError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total from a `Content-Range: bytes a-b/total` header.
fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok())
}

#[async_trait]
impl StorageBackend for RemoteStorage {
    async fn stat_size(
        &self,
        location: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        let url = self.resolve_url(location)?;

        let head = self.send(self.client.head(url.clone()), &url, cancel).await?;
        if head.status().is_success()
            && let Some(len) = header_content_length(&head)
        {
            return Ok(len);
        }

        // Some stores reject HEAD or omit the length; probe with a one-byte range
        tracing::debug!("HEAD gave no size for {}, probing with a range request", url);
        let probe = self
            .send(
                self.client.get(url.clone()).header(RANGE, "bytes=0-0"),
                &url,
                cancel,
            )
            .await?;
        Self::check_status(&probe, &url)?;

        let total = if probe.status() == StatusCode::PARTIAL_CONTENT {
            content_range_total(&probe)
        } else {
            header_content_length(&probe)
        };
        total.ok_or_else(|| StorageError::MissingContentLength {
            url: url.to_string(),
        })
    }

    async fn read_all(
        &self,
        location: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, StorageError> {
        let url = self.resolve_url(location)?;
        let response = self.send(self.client.get(url.clone()), &url, cancel).await?;
        Self::check_status(&response, &url)?;
        let body = Self::body(response, &url, cancel).await?;
        Ok(body.to_vec())
    }

    async fn read_range(
        &self,
        location: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes, StorageError> {
        let url = self.resolve_url(location)?;
        let range = ByteRange { start, end };
        let response = self
            .send(
                self.client
                    .get(url.clone())
                    .header(RANGE, range.to_header_value()),
                &url,
                cancel,
            )
            .await?;
        Self::check_status(&response, &url)?;

        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let body = Self::body(response, &url, cancel).await?;
        if partial {
            return Ok(body);
        }

        // Range ignored; slice the full body
        let len = body.len();
        let from = usize::try_from(start).unwrap_or(usize::MAX).min(len);
        let to = usize::try_from(end)
            .unwrap_or(usize::MAX)
            .saturating_add(1)
            .min(len);
        Ok(body.slice(from..to.max(from)))
    }

    async fn open_stream(
        &self,
        location: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, StorageError> {
        let url = self.resolve_url(location)?;
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(RANGE, range.to_header_value());
        }

        let response = self.send(request, &url, cancel).await?;
        Self::check_status(&response, &url)?;

        let skip_and_limit = match range {
            Some(range) if response.status() != StatusCode::PARTIAL_CONTENT => {
                Some((range.start, range.len()))
            }
            _ => None,
        };

        let stream = response.bytes_stream().map_err(io::Error::other);
        let stream: ByteStream = match skip_and_limit {
            Some((skip, limit)) => Box::pin(slice_stream(stream, skip, limit)),
            None => Box::pin(stream),
        };
        Ok(Box::pin(stream.take_until(cancel.clone().cancelled_owned())))
    }
}

/// Drop the first `skip` bytes of a stream and end it after `limit` more.
fn slice_stream<S>(stream: S, skip: u64, limit: u64) -> impl Stream<Item = Result<Bytes, io::Error>>
where
    S: Stream<Item = Result<Bytes, io::Error>>,
{
    stream
        .scan((skip, limit), |(skip, limit), chunk| {
            let item = match chunk {
                Err(e) => Some(Err(e)),
                Ok(_) if *limit == 0 => None,
                Ok(mut chunk) => {
                    let len = chunk.len() as u64;
                    if *skip >= len {
                        *skip -= len;
                        Some(Ok(Bytes::new()))
                    } else {
                        let from = usize::try_from(*skip).unwrap_or(0);
                        *skip = 0;
                        chunk = chunk.slice(from..);
                        let take = usize::try_from(*limit).unwrap_or(usize::MAX).min(chunk.len());
                        *limit -= take as u64;
                        Some(Ok(chunk.slice(..take)))
                    }
                }
            };
            futures::future::ready(item)
        })
        .try_filter(|chunk| futures::future::ready(!chunk.is_empty()))
}

/// Picks the backend for a catalog source.
#[derive(Clone)]
pub struct StorageRouter {
    local: Arc<dyn StorageBackend>,
    remote: Arc<dyn StorageBackend>,
}

impl StorageRouter {
    /// Create a router over the given backends.
    #[must_use]
    pub fn new(local: Arc<dyn StorageBackend>, remote: Arc<dyn StorageBackend>) -> Self {
        Self { local, remote }
    }

    /// Backend serving `source`.
    #[must_use]
    pub fn for_source(&self, source: SourceKind) -> &Arc<dyn StorageBackend> {
        match source {
            SourceKind::Local => &self.local,
            SourceKind::Remote => &self.remote,
        }
    }
}

impl std::fmt::Debug for StorageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRouter").finish_non_exhaustive()
    }
}
