//! Result cache
//!
//! Files are written to a unique `.tmp` name and renamed into place, so
//! readers never see a partial entry and concurrent writers of the same id do
//! not interfere. Listing and eviction only consider `.cache` files and
//! tolerate files that vanish mid-scan. Temp files abandoned by a previous
//! process are reclaimed by orphan removal.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::config::ResultCacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::eviction::{EvictionReport, SweepEntry, sweep};
use crate::sniff::{SNIFF_LEN, sniff_mime};

const CACHE_EXT: &str = "cache";

/// Longest content id, in bytes, that may name a cache entry
pub const MAX_CONTENT_ID_LEN: usize = 200;
const TEMP_EXT: &str = "tmp";

/// Metadata for one cached entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    /// Content id
    pub content_id: String,
    /// Backing file
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Last modification time, used as the LRU clock
    pub modified: SystemTime,
}

#[derive(Debug)]
struct Inner {
    config: ResultCacheConfig,
    eviction_pending: AtomicBool,
    temp_counter: AtomicU64,
}

/// Bounded on-disk cache of decoded outputs keyed by content id.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

fn validate_id(id: &str) -> CacheResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_CONTENT_ID_LEN
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidContentId(id.to_string()))
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

/// Whether `path` is a temp file left behind by another process.
///
/// Temp names carry the writer's pid, so this process's in-flight writes
/// are never matched.
fn is_stale_temp(path: &Path) -> bool {
    if !has_extension(path, TEMP_EXT) {
        return false;
    }
    let writer = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.rsplit_once('.'))
        .and_then(|(_, tag)| tag.split_once('-'))
        .and_then(|(pid, _)| pid.parse::<u32>().ok());
    writer != Some(std::process::id())
}

async fn remove_tolerant(path: PathBuf) -> std::io::Result<()> {
    match fs::remove_file(&path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl ResultCache {
    /// Open the cache, creating its directory if needed.
    pub fn new(config: ResultCacheConfig) -> CacheResult<Self> {
        config
            .validate()
            .map_err(CacheError::InvalidConfiguration)?;
        std::fs::create_dir_all(&config.cache_dir)
            .map_err(|e| CacheError::io(&config.cache_dir, e))?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                eviction_pending: AtomicBool::new(false),
                temp_counter: AtomicU64::new(0),
            }),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ResultCacheConfig {
        &self.inner.config
    }

    /// Backing file for `id`, whether or not it exists.
    pub fn path_of(&self, id: &str) -> CacheResult<PathBuf> {
        validate_id(id)?;
        Ok(self
            .inner
            .config
            .cache_dir
            .join(format!("{id}.{CACHE_EXT}")))
    }

    /// Whether an entry for `id` exists. Invalid ids are never cached.
    pub async fn has(&self, id: &str) -> bool {
        match self.path_of(id) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Persist `bytes` for `id` and schedule a debounced eviction sweep.
    pub async fn write(&self, id: &str, bytes: &[u8]) -> CacheResult<PathBuf> {
        let path = self.path_of(id)?;
        let seq = self.inner.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .inner
            .config
            .cache_dir
            .join(format!("{id}.{}-{seq}.{TEMP_EXT}", std::process::id()));

        if let Err(e) = fs::write(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::io(temp, e));
        }
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::io(path, e));
        }

        tracing::debug!(content_id = id, bytes = bytes.len(), "cached decoded output");
        self.schedule_eviction();
        Ok(path)
    }

    /// Open the entry for reading, returning the file and its length.
    pub async fn open(&self, id: &str) -> CacheResult<(fs::File, u64)> {
        let path = self.path_of(id)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::NotFound(id.to_string()));
            }
            Err(e) => return Err(CacheError::io(path, e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| CacheError::io(&path, e))?
            .len();
        Ok((file, len))
    }

    /// MIME type of the cached entry, from its first 32 bytes.
    pub async fn sniff_content_type(&self, id: &str) -> CacheResult<&'static str> {
        let (file, _) = self.open(id).await?;
        let mut head = Vec::with_capacity(SNIFF_LEN);
        file.take(SNIFF_LEN as u64)
            .read_to_end(&mut head)
            .await
            .map_err(|e| CacheError::io(self.path_of(id).unwrap_or_default(), e))?;
        Ok(sniff_mime(&head))
    }

    /// Metadata for `id`, if cached
    pub async fn info(&self, id: &str) -> CacheResult<Option<CacheInfo>> {
        let path = self.path_of(id)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(CacheInfo {
                content_id: id.to_string(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// All cached entries, oldest first
    pub async fn list(&self) -> CacheResult<Vec<CacheInfo>> {
        let dir = &self.inner.config.cache_dir;
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(dir, e))?
        {
            let path = entry.path();
            if !has_extension(&path, CACHE_EXT) {
                continue;
            }
            let Some(content_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Removed by a concurrent sweep or delete
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            out.push(CacheInfo {
                content_id: content_id.to_string(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }

        out.sort_by_key(|info| info.modified);
        Ok(out)
    }

    /// Enforce the file-count and byte caps now.
    pub async fn evict(&self) -> CacheResult<EvictionReport> {
        let entries = self
            .list()
            .await?
            .into_iter()
            .map(|info| SweepEntry {
                path: info.path,
                size: info.size,
                modified: info.modified,
            })
            .collect();

        let report = sweep(
            entries,
            self.inner.config.max_files,
            self.inner.config.max_bytes,
            remove_tolerant,
        )
        .await;

        if report.removed > 0 || report.failures > 0 {
            tracing::info!(
                removed = report.removed,
                bytes_freed = report.bytes_freed,
                remaining_files = report.remaining_files,
                remaining_bytes = report.remaining_bytes,
                failures = report.failures,
                "cache eviction sweep"
            );
        }
        Ok(report)
    }

    /// Start the debounce window unless one is already running.
    fn schedule_eviction(&self) {
        if self.inner.eviction_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let cache = self.clone();
        let delay = self.inner.config.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cache.inner.eviction_pending.store(false, Ordering::Release);
            if let Err(e) = cache.evict().await {
                tracing::warn!(error = %e, "cache eviction sweep failed");
            }
        });
    }

    /// Delete the entry for `id`. Returns whether a file was removed.
    pub async fn remove_one(&self, id: &str) -> CacheResult<bool> {
        let path = self.path_of(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(content_id = id, "removed cache entry");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Delete every entry belonging to `owner_id`.
    ///
    /// Individual failures are logged and skipped. Returns the number of
    /// entries removed.
    pub async fn remove_all_for<I, S>(&self, owner_id: &str, member_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for id in member_ids {
            match self.remove_one(id.as_ref()).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        owner = owner_id,
                        content_id = id.as_ref(),
                        error = %e,
                        "failed to remove cache entry"
                    );
                }
            }
        }
        tracing::info!(owner = owner_id, removed, "removed cache entries for owner");
        removed
    }

    /// Delete entries whose id is not in `valid_ids`, along with temp files
    /// abandoned by earlier processes.
    pub async fn remove_orphaned(&self, valid_ids: &HashSet<String>) -> CacheResult<usize> {
        let mut doomed: Vec<PathBuf> = self
            .list()
            .await?
            .into_iter()
            .filter(|info| !valid_ids.contains(&info.content_id))
            .map(|info| info.path)
            .collect();
        doomed.extend(self.stale_temps().await?);

        let mut removed = 0;
        for path in doomed {
            match remove_tolerant(path.clone()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to remove orphaned cache file"
                    );
                }
            }
        }
        Ok(removed)
    }

    async fn stale_temps(&self) -> CacheResult<Vec<PathBuf>> {
        let dir = &self.inner.config.cache_dir;
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(dir, e))?
        {
            let path = entry.path();
            if is_stale_temp(&path) {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Delete every cache and temporary file.
    pub async fn clear(&self) -> CacheResult<usize> {
        let dir = &self.inner.config.cache_dir;
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(dir, e))?
        {
            let path = entry.path();
            if !has_extension(&path, CACHE_EXT) && !has_extension(&path, TEMP_EXT) {
                continue;
            }
            match remove_tolerant(path.clone()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to clear cache file");
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir) -> ResultCache {
        ResultCache::new(ResultCacheConfig::new(dir.path())).expect("Operation should succeed")
    }

    fn set_age(path: &Path, age_secs: u64) {
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .expect("Operation should succeed");
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .expect("Operation should succeed");
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = TempDir::new().expect("Operation should succeed");
        let cache = cache_in(&dir);
        let bytes = b"fLaC payload bytes".to_vec();

        assert!(!cache.has("track-1").await);
        let path = cache.write("track-1", &bytes).await.expect("Operation should succeed");
        assert!(cache.has("track-1").await);
        assert_eq!(path, cache.path_of("track-1").unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        assert_eq!(
            cache.sniff_content_type("track-1").await.unwrap(),
            "audio/flac"
        );

        // No temp files left behind
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["track-1.cache"]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        for id in ["", "..", "a/b", "a\\b", "x\0y"] {
            assert!(matches!(
                cache.write(id, b"x").await,
                Err(CacheError::InvalidContentId(_))
            ));
            assert!(!cache.has(id).await);
        }
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        assert!(matches!(
            cache.open("nope").await,
            Err(CacheError::NotFound(id)) if id == "nope"
        ));
        assert!(cache.info("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_enforces_caps() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(
            ResultCacheConfig::new(dir.path())
                .with_max_files(3)
                .with_max_bytes(250)
                .with_debounce(Duration::from_secs(3600)),
        )
        .unwrap();

        for (i, age) in [(0, 50), (1, 40), (2, 30), (3, 20), (4, 10)] {
            let path = cache.write(&format!("c{i}"), &[0u8; 100]).await.unwrap();
            set_age(&path, age);
        }

        let report = cache.evict().await.unwrap();
        assert_eq!(report.scanned, 5);
        assert_eq!(report.removed, 3);
        assert_eq!(report.remaining_files, 2);
        assert_eq!(report.remaining_bytes, 200);

        let ids: Vec<_> = cache
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.content_id)
            .collect();
        assert_eq!(ids, vec!["c3", "c4"]);
    }

    #[tokio::test]
    async fn test_evict_keeps_single_oversize_file() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(ResultCacheConfig::new(dir.path()).with_max_bytes(10)).unwrap();
        cache.write("big", &[1u8; 64]).await.unwrap();

        let report = cache.evict().await.unwrap();
        assert_eq!(report.removed, 0);
        assert!(cache.has("big").await);
    }

    #[tokio::test]
    async fn test_eviction_is_debounced() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(
            ResultCacheConfig::new(dir.path())
                .with_max_files(2)
                .with_debounce(Duration::from_millis(100)),
        )
        .unwrap();

        for i in 0..5 {
            cache.write(&format!("d{i}"), b"x").await.unwrap();
        }
        assert_eq!(cache.list().await.unwrap().len(), 5);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_operations() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        for id in ["g1-a", "g1-b", "g2-a"] {
            cache.write(id, b"data").await.unwrap();
        }
        // An in-flight write of this process survives orphan removal
        let live_temp = format!("inflight.{}-0.tmp", std::process::id());
        std::fs::write(dir.path().join(&live_temp), b"partial").unwrap();

        assert!(cache.remove_one("g2-a").await.unwrap());
        assert!(!cache.remove_one("g2-a").await.unwrap());

        let removed = cache.remove_all_for("g1", ["g1-a", "g1-b", "g1-missing"]).await;
        assert_eq!(removed, 2);
        assert!(cache.list().await.unwrap().is_empty());

        cache.write("keep", b"1").await.unwrap();
        cache.write("orphan", b"2").await.unwrap();
        let valid: HashSet<String> = ["keep".to_string()].into_iter().collect();
        assert_eq!(cache.remove_orphaned(&valid).await.unwrap(), 1);
        assert!(cache.has("keep").await);
        assert!(dir.path().join(&live_temp).exists());

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_remove_orphaned_reclaims_abandoned_temps() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        cache.write("ch1", b"done").await.unwrap();

        let other_pid = std::process::id().wrapping_add(1);
        let abandoned = dir.path().join(format!("ch1.{other_pid}-0.tmp"));
        std::fs::write(&abandoned, vec![0u8; 4096]).unwrap();
        let garbled = dir.path().join("ch2.tmp");
        std::fs::write(&garbled, b"x").unwrap();

        let valid: HashSet<String> = ["ch1".to_string()].into_iter().collect();
        assert_eq!(cache.remove_orphaned(&valid).await.unwrap(), 2);
        assert!(!abandoned.exists());
        assert!(!garbled.exists());
        assert!(cache.has("ch1").await);

        // Nothing left to reclaim
        assert_eq!(cache.remove_orphaned(&HashSet::new()).await.unwrap(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_is_stale_temp() {
        let own = format!("a.{}-3.tmp", std::process::id());
        assert!(!is_stale_temp(Path::new(&own)));
        assert!(is_stale_temp(Path::new("a.0-3.tmp")));
        assert!(is_stale_temp(Path::new("a.tmp")));
        assert!(!is_stale_temp(Path::new("a.0-3.cache")));
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_id() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let payload = vec![7u8; 256 * 1024];

        let (a, b) = tokio::join!(cache.write("same", &payload), cache.write("same", &payload));
        a.unwrap();
        b.unwrap();
        assert_eq!(std::fs::read(cache.path_of("same").unwrap()).unwrap(), payload);
    }
}
