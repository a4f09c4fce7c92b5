//! Orphan cleanup.
//!
//! The periodic sweep removes (a) stale upload files, (b) per-video output
//! directories that never produced a media file and (c) leftover write-probe
//! files. Nothing younger than the orphan threshold is touched.
//!
//! Targeted cleanup removes one video's output after a failed transcode. It
//! never returns an error; failures are counted and logged.
//!
//! The storage write probe behind `/health` also lives here, since the sweep
//! is what removes probes a crash left behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use mf_core::config::MaintenanceConfig;
use mf_core::{is_media_file, VideoId};

/// Outcome of one cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupResult {
    pub deleted_files: u64,
    pub deleted_directories: u64,
    pub errors: u64,
    pub bytes_freed: u64,
}

impl CleanupResult {
    fn merge(&mut self, other: CleanupResult) {
        self.deleted_files += other.deleted_files;
        self.deleted_directories += other.deleted_directories;
        self.errors += other.errors;
        self.bytes_freed += other.bytes_freed;
    }

    pub fn is_empty(&self) -> bool {
        self.deleted_files == 0 && self.deleted_directories == 0 && self.errors == 0
    }
}

/// Whether each storage root accepted a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageProbe {
    pub uploads_writable: bool,
    pub streams_writable: bool,
}

pub struct CleanupService {
    uploads_dir: PathBuf,
    streams_dir: PathBuf,
    orphan_threshold: Duration,
    write_probe_prefix: String,
    in_progress: AtomicBool,
    probe_seq: AtomicU64,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CleanupService {
    pub fn new(
        uploads_dir: PathBuf,
        streams_dir: PathBuf,
        orphan_threshold: Duration,
        write_probe_prefix: impl Into<String>,
    ) -> Self {
        Self {
            uploads_dir,
            streams_dir,
            orphan_threshold,
            write_probe_prefix: write_probe_prefix.into(),
            in_progress: AtomicBool::new(false),
            probe_seq: AtomicU64::new(0),
        }
    }

    pub fn from_config(
        uploads_dir: PathBuf,
        streams_dir: PathBuf,
        config: &MaintenanceConfig,
    ) -> Self {
        Self::new(
            uploads_dir,
            streams_dir,
            config.orphan_threshold(),
            config.write_probe_prefix.clone(),
        )
    }

    pub fn streams_dir(&self) -> &Path {
        &self.streams_dir
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// One periodic sweep. Returns `None` if a sweep is already running.
    pub async fn run_cleanup(&self) -> Option<CleanupResult> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Cleanup already running; skipping tick");
            return None;
        }
        let _guard = RunGuard(&self.in_progress);

        let mut result = CleanupResult::default();
        result.merge(self.sweep_orphan_uploads().await);
        result.merge(self.sweep_write_probes().await);
        result.merge(self.sweep_empty_outputs().await);

        if result.is_empty() {
            tracing::debug!("Cleanup found nothing to remove");
        } else {
            tracing::info!(
                deleted_files = result.deleted_files,
                deleted_directories = result.deleted_directories,
                errors = result.errors,
                bytes_freed = result.bytes_freed,
                "Cleanup finished"
            );
        }
        Some(result)
    }

    /// Remove everything a failed transcode of `video_id` left behind.
    pub async fn cleanup_video(&self, video_id: VideoId, upload: Option<&Path>) -> CleanupResult {
        self.cleanup_video_dir(&self.streams_dir.join(video_id.to_string()), upload)
            .await
    }

    /// Delete every file under `dir`, the directory itself and `upload`.
    pub async fn cleanup_video_dir(&self, dir: &Path, upload: Option<&Path>) -> CleanupResult {
        let mut result = remove_tree(dir).await;
        if let Some(upload) = upload {
            remove_file(upload, &mut result).await;
        }
        tracing::debug!(
            dir = %dir.display(),
            deleted_files = result.deleted_files,
            errors = result.errors,
            "Targeted cleanup finished"
        );
        result
    }

    // -- Sweeps -------------------------------------------------------------

    /// Upload files past the threshold and past twice the threshold.
    async fn sweep_orphan_uploads(&self) -> CleanupResult {
        let mut result = CleanupResult::default();
        let threshold = self.orphan_threshold;
        let hard_threshold = threshold * 2;

        for (path, meta) in list_dir(&self.uploads_dir).await {
            if !meta.is_file() {
                continue;
            }
            let Some(age) = age_of(&meta) else {
                continue;
            };
            if age > threshold && age > hard_threshold {
                tracing::info!(path = %path.display(), age_secs = age.as_secs(), "Removing orphan upload");
                remove_file(&path, &mut result).await;
            }
        }
        result
    }

    async fn sweep_write_probes(&self) -> CleanupResult {
        let mut result = CleanupResult::default();
        for root in [&self.uploads_dir, &self.streams_dir] {
            for (path, meta) in list_dir(root).await {
                if !meta.is_file() || !self.is_write_probe(&path) {
                    continue;
                }
                if age_of(&meta).is_some_and(|age| age > self.orphan_threshold) {
                    remove_file(&path, &mut result).await;
                }
            }
        }
        result
    }

    /// Output directories without any media file.
    async fn sweep_empty_outputs(&self) -> CleanupResult {
        let mut result = CleanupResult::default();
        for (dir, meta) in list_dir(&self.streams_dir).await {
            if !meta.is_dir() {
                continue;
            }
            if !age_of(&meta).is_some_and(|age| age > self.orphan_threshold) {
                continue;
            }
            let has_media = list_dir(&dir)
                .await
                .iter()
                .any(|(path, m)| m.is_file() && is_media_file(path));
            if has_media {
                continue;
            }
            tracing::info!(dir = %dir.display(), "Removing output directory without media");
            result.merge(remove_tree(&dir).await);
        }
        result
    }

    /// Write and delete a small file in each storage root.
    pub async fn probe_storage(&self) -> StorageProbe {
        StorageProbe {
            uploads_writable: self.write_probe(&self.uploads_dir).await,
            streams_writable: self.write_probe(&self.streams_dir).await,
        }
    }

    async fn write_probe(&self, dir: &Path) -> bool {
        let seq = self.probe_seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}{}-{seq}", self.write_probe_prefix, std::process::id()));

        if let Err(e) = tokio::fs::write(&path, b"ok").await {
            tracing::warn!(dir = %dir.display(), error = %e, "Storage write probe failed");
            return false;
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove write probe");
        }
        true
    }

    fn is_write_probe(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&self.write_probe_prefix))
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers (best-effort)
// ---------------------------------------------------------------------------

fn age_of(meta: &std::fs::Metadata) -> Option<Duration> {
    let modified = meta.modified().ok()?;
    // Clock skew (mtime in the future) counts as brand new.
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

async fn list_dir(dir: &Path) -> Vec<(PathBuf, std::fs::Metadata)> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(dir = %dir.display(), error = %e, "Cannot list directory");
            }
            return out;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if let Ok(meta) = tokio::fs::symlink_metadata(&path).await {
            out.push((path, meta));
        }
    }
    out
}

async fn remove_file(path: &Path, result: &mut CleanupResult) {
    let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            result.deleted_files += 1;
            result.bytes_freed += size;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            result.errors += 1;
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete file");
        }
    }
}

/// Delete every file below `root`, then the directories bottom-up.
async fn remove_tree(root: &Path) -> CleanupResult {
    let mut result = CleanupResult::default();
    let mut pending = vec![root.to_path_buf()];
    let mut dirs = Vec::new();

    while let Some(dir) = pending.pop() {
        if tokio::fs::symlink_metadata(&dir).await.is_err() {
            continue;
        }
        for (path, meta) in list_dir(&dir).await {
            if meta.is_dir() {
                pending.push(path);
            } else {
                remove_file(&path, &mut result).await;
            }
        }
        dirs.push(dir);
    }

    for dir in dirs.into_iter().rev() {
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => result.deleted_directories += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                result.errors += 1;
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove directory");
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, FileTimes};

    fn age(path: &Path, secs: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs);
        let file = File::options().write(true).open(path).or_else(|_| File::open(path)).unwrap();
        file.set_times(FileTimes::new().set_modified(when).set_accessed(when)).unwrap();
    }

    fn age_dir(path: &Path, secs: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs);
        File::open(path)
            .unwrap()
            .set_times(FileTimes::new().set_modified(when).set_accessed(when))
            .unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        uploads: PathBuf,
        streams: PathBuf,
        service: CleanupService,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let streams = dir.path().join("streams");
        fs::create_dir_all(&uploads).unwrap();
        fs::create_dir_all(&streams).unwrap();
        let service = CleanupService::new(
            uploads.clone(),
            streams.clone(),
            Duration::from_secs(3600),
            ".write-probe-",
        );
        Fixture {
            _dir: dir,
            uploads,
            streams,
            service,
        }
    }

    #[tokio::test]
    async fn orphan_uploads_need_twice_the_threshold() {
        let f = fixture();
        let fresh = f.uploads.join("fresh.upload");
        let middle = f.uploads.join("middle.upload");
        let old = f.uploads.join("old.upload");
        for p in [&fresh, &middle, &old] {
            fs::write(p, b"data").unwrap();
        }
        age(&middle, 5400);
        age(&old, 7300);

        let result = f.service.run_cleanup().await.unwrap();
        assert!(fresh.exists());
        assert!(middle.exists());
        assert!(!old.exists());
        assert_eq!(result.deleted_files, 1);
        assert_eq!(result.bytes_freed, 4);
    }

    #[tokio::test]
    async fn directories_in_uploads_are_ignored() {
        let f = fixture();
        let nested = f.uploads.join("sub");
        fs::create_dir_all(&nested).unwrap();
        age_dir(&nested, 10_000);
        f.service.run_cleanup().await.unwrap();
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn output_dirs_without_media_are_removed_when_old() {
        let f = fixture();
        let empty_old = f.streams.join("empty-old");
        let empty_new = f.streams.join("empty-new");
        let with_media = f.streams.join("with-media");
        for d in [&empty_old, &empty_new, &with_media] {
            fs::create_dir_all(d).unwrap();
        }
        fs::write(empty_old.join("partial.log"), b"x").unwrap();
        fs::write(empty_old.join("720p.mp4.part"), b"x").unwrap();
        fs::write(with_media.join("720p.mp4"), b"x").unwrap();
        age_dir(&empty_old, 4000);
        age_dir(&with_media, 4000);

        let result = f.service.run_cleanup().await.unwrap();
        assert!(!empty_old.exists());
        assert!(empty_new.exists());
        assert!(with_media.exists());
        assert_eq!(result.deleted_directories, 1);
        assert_eq!(result.deleted_files, 2);
    }

    #[tokio::test]
    async fn storage_probe_writes_and_removes() {
        let f = fixture();
        let probe = f.service.probe_storage().await;
        assert!(probe.uploads_writable);
        assert!(probe.streams_writable);
        assert_eq!(fs::read_dir(&f.uploads).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&f.streams).unwrap().count(), 0);

        fs::remove_dir(&f.streams).unwrap();
        let probe = f.service.probe_storage().await;
        assert!(probe.uploads_writable);
        assert!(!probe.streams_writable);
    }

    #[tokio::test]
    async fn stale_write_probes_are_removed() {
        let f = fixture();
        let stale = f.streams.join(".write-probe-123");
        let fresh = f.uploads.join(".write-probe-456");
        fs::write(&stale, b"").unwrap();
        fs::write(&fresh, b"").unwrap();
        age(&stale, 4000);

        f.service.run_cleanup().await.unwrap();
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn overlapping_run_is_skipped() {
        let f = fixture();
        f.service.in_progress.store(true, Ordering::Release);
        assert!(f.service.run_cleanup().await.is_none());
    }

    #[tokio::test]
    async fn targeted_cleanup_removes_dir_and_upload() {
        let f = fixture();
        let video_id = VideoId::new();
        let dir = f.streams.join(video_id.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("360p.mp4"), vec![0u8; 10]).unwrap();
        fs::write(dir.join("480p.mp4"), vec![0u8; 5]).unwrap();
        let upload = f.uploads.join("u.upload");
        fs::write(&upload, vec![0u8; 7]).unwrap();

        let result = f.service.cleanup_video(video_id, Some(&upload)).await;
        assert!(!dir.exists());
        assert!(!upload.exists());
        assert_eq!(result.deleted_files, 3);
        assert_eq!(result.deleted_directories, 1);
        assert_eq!(result.bytes_freed, 22);
        assert_eq!(result.errors, 0);
    }

    #[tokio::test]
    async fn targeted_cleanup_of_missing_dir_is_quiet() {
        let f = fixture();
        let result = f.service.cleanup_video(VideoId::new(), None).await;
        assert_eq!(result, CleanupResult::default());
    }
}
