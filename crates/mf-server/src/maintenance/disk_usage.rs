//! Cached disk usage of the uploads and streams roots.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use mf_core::stats::DiskUsageSnapshot;

pub struct DiskUsageMonitor {
    uploads_dir: PathBuf,
    streams_dir: PathBuf,
    batch_size: usize,
    snapshot: RwLock<DiskUsageSnapshot>,
    in_progress: AtomicBool,
    this: Weak<DiskUsageMonitor>,
}

/// Clears the in-progress flag even if the scan future is dropped.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DiskUsageMonitor {
    pub fn new(uploads_dir: PathBuf, streams_dir: PathBuf, batch_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            uploads_dir,
            streams_dir,
            batch_size: batch_size.max(1),
            snapshot: RwLock::new(DiskUsageSnapshot::default()),
            in_progress: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// The cached snapshot, with `is_calculating` reflecting a running scan.
    pub fn snapshot(&self) -> DiskUsageSnapshot {
        let mut snapshot = self.snapshot.read().clone();
        snapshot.is_calculating = self.is_calculating();
        snapshot
    }

    pub fn is_calculating(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Scan both roots and replace the cached snapshot.
    ///
    /// Returns `false` without scanning when another scan is in flight.
    pub async fn refresh(&self) -> bool {
        if !self.try_claim() {
            tracing::debug!("Disk usage scan already running; skipping");
            return false;
        }
        self.scan_claimed().await;
        true
    }

    fn try_claim(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run a scan whose in-progress flag the caller already set.
    async fn scan_claimed(&self) {
        let _guard = ScanGuard(&self.in_progress);

        let started = std::time::Instant::now();
        let (uploads_bytes, streams_bytes) = tokio::join!(
            dir_size(&self.uploads_dir, self.batch_size),
            dir_size(&self.streams_dir, self.batch_size),
        );

        let snapshot = DiskUsageSnapshot {
            uploads_bytes,
            streams_bytes,
            total_bytes: uploads_bytes + streams_bytes,
            last_updated: Some(Utc::now()),
            is_calculating: false,
        };
        tracing::debug!(
            uploads_bytes,
            streams_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Disk usage updated"
        );
        *self.snapshot.write() = snapshot;
    }

    /// Start a refresh in the background. Returns `false` if one is already
    /// running.
    pub fn trigger_refresh(&self) -> bool {
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        if !self.try_claim() {
            return false;
        }
        tokio::spawn(async move {
            this.scan_claimed().await;
        });
        true
    }

    /// Refresh immediately, then every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "Disk usage monitor started");
        loop {
            self.refresh().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Disk usage monitor stopped");
    }
}

/// Recursive size of every regular file under `root`.
///
/// Entries of one directory are stat'ed `batch` at a time. Files that vanish
/// mid-scan and unreadable directories are skipped.
pub async fn dir_size(root: &Path, batch: usize) -> u64 {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "Cannot read directory");
                continue;
            }
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => paths.push(entry.path()),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "Directory listing interrupted");
                    break;
                }
            }
        }

        let stats: Vec<_> = futures::stream::iter(paths)
            .map(|path| async move {
                let meta = tokio::fs::symlink_metadata(&path).await;
                (path, meta)
            })
            .buffer_unordered(batch.max(1))
            .collect()
            .await;

        for (path, meta) in stats {
            match meta {
                Ok(m) if m.is_dir() => pending.push(path),
                Ok(m) if m.is_file() => total += m.len(),
                Ok(_) => {}
                Err(e) => tracing::trace!(path = %path.display(), error = %e, "Stat failed"),
            }
        }
    }

    total
}
