//! Eviction sweep
//!
//! Entries are considered oldest-modified first. The count cap is enforced
//! first, then the byte cap. A lone entry larger than the byte cap is kept.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

/// A cache file as seen by the sweep
#[derive(Debug, Clone)]
pub(crate) struct SweepEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Outcome of one eviction sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Entries found at the start of the sweep
    pub scanned: usize,
    /// Entries deleted
    pub removed: usize,
    /// Bytes released
    pub bytes_freed: u64,
    /// Entries left afterwards
    pub remaining_files: usize,
    /// Bytes left afterwards
    pub remaining_bytes: u64,
    /// Deletions that failed
    pub failures: usize,
}

/// Run the sweep over `entries`, deleting through `delete`.
///
/// `delete` returns `Ok(())` when the file is gone, including when it had
/// already disappeared. Failed deletions are counted and skipped.
pub(crate) async fn sweep<F, Fut>(
    mut entries: Vec<SweepEntry>,
    max_files: usize,
    max_bytes: u64,
    mut delete: F,
) -> EvictionReport
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    entries.sort_by_key(|e| e.modified);

    let mut report = EvictionReport {
        scanned: entries.len(),
        remaining_files: entries.len(),
        remaining_bytes: entries.iter().map(|e| e.size).sum(),
        ..EvictionReport::default()
    };

    let over_count = entries.len().saturating_sub(max_files);

    for (index, entry) in entries.into_iter().enumerate() {
        let over_bytes = report.remaining_bytes > max_bytes && report.remaining_files > 1;
        if index >= over_count && !over_bytes {
            continue;
        }

        match delete(entry.path.clone()).await {
            Ok(()) => {
                tracing::debug!(
                    path = %entry.path.display(),
                    size = entry.size,
                    "evicted cache entry"
                );
                report.removed += 1;
                report.bytes_freed += entry.size;
                report.remaining_files -= 1;
                report.remaining_bytes -= entry.size;
            }
            Err(e) => {
                tracing::warn!(
                    path = %entry.path.display(),
                    error = %e,
                    "failed to evict cache entry"
                );
                report.failures += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn entry(name: &str, size: u64, age_secs: u64) -> SweepEntry {
        SweepEntry {
            path: PathBuf::from(name),
            size,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
        }
    }

    async fn run(
        entries: Vec<SweepEntry>,
        max_files: usize,
        max_bytes: u64,
    ) -> (EvictionReport, Vec<String>) {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        let report = sweep(entries, max_files, max_bytes, move |path| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(path.display().to_string());
                Ok(())
            }
        })
        .await;
        let deleted = deleted.lock().unwrap().clone();
        (report, deleted)
    }

    #[tokio::test]
    async fn test_count_cap_removes_oldest() {
        let entries = vec![entry("new", 1, 1), entry("old", 1, 30), entry("mid", 1, 10)];
        let (report, deleted) = run(entries, 2, 100).await;
        assert_eq!(deleted, vec!["old"]);
        assert_eq!(report.remaining_files, 2);
    }

    #[tokio::test]
    async fn test_size_cap_after_count_cap() {
        let entries = vec![
            entry("a", 40, 50),
            entry("b", 40, 40),
            entry("c", 40, 30),
            entry("d", 40, 20),
        ];
        let (report, deleted) = run(entries, 3, 90).await;
        assert_eq!(deleted, vec!["a", "b"]);
        assert_eq!(report.remaining_files, 2);
        assert_eq!(report.remaining_bytes, 80);
        assert_eq!(report.bytes_freed, 80);
    }

    #[tokio::test]
    async fn test_single_oversize_entry_is_kept() {
        let entries = vec![entry("small", 10, 20), entry("huge", 500, 1)];
        let (report, deleted) = run(entries, 10, 100).await;
        assert_eq!(deleted, vec!["small"]);
        assert_eq!(report.remaining_files, 1);
        assert_eq!(report.remaining_bytes, 500);
    }

    #[tokio::test]
    async fn test_within_limits_is_noop() {
        let entries = vec![entry("a", 10, 2), entry("b", 10, 1)];
        let (report, deleted) = run(entries, 5, 100).await;
        assert!(deleted.is_empty());
        assert_eq!(report.removed, 0);
        assert_eq!(report.scanned, 2);
    }

    #[tokio::test]
    async fn test_failed_deletion_does_not_abort() {
        let entries = vec![entry("stuck", 50, 30), entry("b", 50, 20), entry("c", 50, 10)];
        let report = sweep(entries, 1, 1000, |path| async move {
            if path == PathBuf::from("stuck") {
                Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            } else {
                Ok(())
            }
        })
        .await;
        assert_eq!(report.failures, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.remaining_files, 2);
    }
}
