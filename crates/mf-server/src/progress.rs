//! In-memory, reconnect-durable progress store.
//!
//! Records are keyed by upload id and overwritten on every publish. Each
//! publish is fanned out on the [`EventBus`] (job-scoped and global).
//! Terminal records are deleted after a grace period, shorter for success
//! than for failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use mf_core::events::{EventBus, EventPayload, JobRecord};
use mf_core::progress::{
    ProgressSnapshot, TranscodeProgress, TranscodeStage, UploadProgress, UploadStage,
};
use mf_core::{UploadId, VideoId};

/// A stored record plus the publish sequence it was written at.
struct Entry<T> {
    record: T,
    seq: u64,
}

pub struct ProgressRegistry {
    uploads: RwLock<HashMap<UploadId, Entry<UploadProgress>>>,
    transcodes: RwLock<HashMap<UploadId, Entry<TranscodeProgress>>>,
    seq: AtomicU64,
    event_bus: Arc<EventBus>,
    success_grace: Duration,
    failure_grace: Duration,
    /// Handle to ourselves for scheduling grace-period removal.
    this: Weak<ProgressRegistry>,
}

impl ProgressRegistry {
    pub fn new(event_bus: Arc<EventBus>, success_grace: Duration, failure_grace: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            uploads: RwLock::new(HashMap::new()),
            transcodes: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            event_bus,
            success_grace,
            failure_grace,
            this: this.clone(),
        })
    }

    pub fn from_config(event_bus: Arc<EventBus>, config: &mf_core::config::ProgressConfig) -> Arc<Self> {
        Self::new(event_bus, config.success_grace(), config.failure_grace())
    }

    // -- Uploads ------------------------------------------------------------

    pub fn publish_upload_progress(&self, record: UploadProgress) {
        let upload_id = record.upload_id;
        let stage = record.stage;
        let seq = self.next_seq();

        self.uploads.write().insert(
            upload_id,
            Entry {
                record: record.clone(),
                seq,
            },
        );

        let payload = match stage {
            UploadStage::Uploading => EventPayload::UploadProgress(record),
            UploadStage::Completed => EventPayload::UploadCompleted(record),
            UploadStage::Failed => EventPayload::UploadFailed(record),
        };
        self.event_bus.publish_job(upload_id, payload);

        match stage {
            UploadStage::Uploading => {}
            UploadStage::Completed => self.schedule_upload_removal(upload_id, seq, self.success_grace),
            UploadStage::Failed => self.schedule_upload_removal(upload_id, seq, self.failure_grace),
        }
    }

    // -- Transcodes ---------------------------------------------------------

    /// Create the `idle` record for a new transcode and announce it.
    pub fn start_transcode(
        &self,
        upload_id: UploadId,
        video_id: VideoId,
        video_name: &str,
    ) -> TranscodeProgress {
        let record = TranscodeProgress::started(upload_id, video_id, video_name);
        let seq = self.next_seq();
        self.transcodes.write().insert(
            upload_id,
            Entry {
                record: record.clone(),
                seq,
            },
        );
        self.event_bus
            .publish_job(upload_id, EventPayload::TranscodeStarted(record.clone()));
        record
    }

    /// Overwrite the transcode record.
    ///
    /// Within one video the overall percent never goes backwards; a lower
    /// value is raised to the stored one before publishing.
    pub fn publish_transcode_progress(&self, mut record: TranscodeProgress) {
        let upload_id = record.upload_id;
        let seq = self.next_seq();

        {
            let mut transcodes = self.transcodes.write();
            if let Some(prev) = transcodes.get(&upload_id) {
                if prev.record.video_id == record.video_id
                    && record.overall_percent < prev.record.overall_percent
                {
                    record.overall_percent = prev.record.overall_percent;
                }
            }
            transcodes.insert(
                upload_id,
                Entry {
                    record: record.clone(),
                    seq,
                },
            );
        }

        let stage = record.stage.clone();
        let payload = match stage {
            TranscodeStage::Completed => EventPayload::TranscodeCompleted(record),
            TranscodeStage::Failed => EventPayload::TranscodeFailed(record),
            TranscodeStage::Idle | TranscodeStage::Transcoding(_) => {
                EventPayload::TranscodeProgress(record)
            }
        };
        self.event_bus.publish_job(upload_id, payload);

        match stage {
            TranscodeStage::Completed => {
                self.schedule_transcode_removal(upload_id, seq, self.success_grace)
            }
            TranscodeStage::Failed => {
                self.schedule_transcode_removal(upload_id, seq, self.failure_grace)
            }
            _ => {}
        }
    }

    // -- Queries ------------------------------------------------------------

    /// Every live record.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut uploads: Vec<_> = self.uploads.read().values().map(|e| e.record.clone()).collect();
        let mut transcodes: Vec<_> = self
            .transcodes
            .read()
            .values()
            .map(|e| e.record.clone())
            .collect();
        uploads.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        transcodes.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        ProgressSnapshot { uploads, transcodes }
    }

    /// Current records of one job.
    pub fn get(&self, upload_id: UploadId) -> JobRecord {
        JobRecord {
            upload: self.uploads.read().get(&upload_id).map(|e| e.record.clone()),
            transcode: self
                .transcodes
                .read()
                .get(&upload_id)
                .map(|e| e.record.clone()),
        }
    }

    pub fn upload(&self, upload_id: UploadId) -> Option<UploadProgress> {
        self.uploads.read().get(&upload_id).map(|e| e.record.clone())
    }

    pub fn transcode(&self, upload_id: UploadId) -> Option<TranscodeProgress> {
        self.transcodes.read().get(&upload_id).map(|e| e.record.clone())
    }

    // -- Internals ----------------------------------------------------------

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn schedule_upload_removal(&self, upload_id: UploadId, seq: u64, grace: Duration) {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = this.upgrade() {
                let mut uploads = registry.uploads.write();
                // A newer publish for the same id keeps the entry alive.
                if uploads.get(&upload_id).is_some_and(|e| e.seq == seq) {
                    uploads.remove(&upload_id);
                    tracing::trace!(upload_id = %upload_id, "Upload progress expired");
                }
            }
        });
    }

    fn schedule_transcode_removal(&self, upload_id: UploadId, seq: u64, grace: Duration) {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = this.upgrade() {
                let mut transcodes = registry.transcodes.write();
                if transcodes.get(&upload_id).is_some_and(|e| e.seq == seq) {
                    transcodes.remove(&upload_id);
                    tracing::trace!(upload_id = %upload_id, "Transcode progress expired");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(success: u64, failure: u64) -> (Arc<EventBus>, Arc<ProgressRegistry>) {
        let bus = Arc::new(EventBus::default());
        let reg = ProgressRegistry::new(
            Arc::clone(&bus),
            Duration::from_millis(success),
            Duration::from_millis(failure),
        );
        (bus, reg)
    }

    #[tokio::test]
    async fn publish_overwrites_and_fans_out() {
        let (bus, reg) = registry(1000, 1000);
        let mut rx = bus.subscribe();
        let upload_id = UploadId::new();

        let mut rec = reg.start_transcode(upload_id, VideoId::new(), "clip");
        rec.stage = TranscodeStage::Transcoding("360p".into());
        rec.overall_percent = 10;
        reg.publish_transcode_progress(rec.clone());

        let stored = reg.transcode(upload_id).unwrap();
        assert_eq!(stored.overall_percent, 10);
        assert_eq!(reg.snapshot().transcodes.len(), 1);

        // started + progress, each scoped and global
        let mut names = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            names.push(ev.payload.name());
        }
        assert_eq!(
            names,
            vec!["transcode_started", "transcode_started", "transcode_progress", "transcode_progress"]
        );
    }

    #[tokio::test]
    async fn overall_percent_never_decreases() {
        let (_bus, reg) = registry(1000, 1000);
        let upload_id = UploadId::new();
        let mut rec = reg.start_transcode(upload_id, VideoId::new(), "clip");

        rec.overall_percent = 40;
        reg.publish_transcode_progress(rec.clone());
        rec.overall_percent = 30;
        reg.publish_transcode_progress(rec.clone());

        assert_eq!(reg.transcode(upload_id).unwrap().overall_percent, 40);
    }

    #[tokio::test]
    async fn terminal_records_expire_after_grace() {
        let (_bus, reg) = registry(50, 150);
        let ok_id = UploadId::new();
        let fail_id = UploadId::new();

        let ok = reg.start_transcode(ok_id, VideoId::new(), "ok");
        reg.publish_transcode_progress(ok.completed());
        let bad = reg.start_transcode(fail_id, VideoId::new(), "bad");
        reg.publish_transcode_progress(bad.failed("encoder crashed"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reg.transcode(ok_id).is_none());
        assert!(reg.transcode(fail_id).is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(reg.transcode(fail_id).is_none());
    }

    #[tokio::test]
    async fn newer_publish_survives_old_grace_timer() {
        let (_bus, reg) = registry(50, 50);
        let upload_id = UploadId::new();
        let rec = reg.start_transcode(upload_id, VideoId::new(), "clip");
        reg.publish_transcode_progress(rec.failed("first attempt"));

        // Retry under the same upload id before the grace period ends.
        reg.start_transcode(upload_id, VideoId::new(), "clip");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reg.transcode(upload_id).is_some());
    }

    #[tokio::test]
    async fn upload_events_follow_stage() {
        let (bus, reg) = registry(1000, 1000);
        let mut rx = bus.subscribe();
        let upload_id = UploadId::new();

        let mut up = UploadProgress::new(upload_id, "clip", Some(10));
        up.advance(5);
        reg.publish_upload_progress(up.clone());
        up.complete();
        reg.publish_upload_progress(up);

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.payload.name())
            .collect();
        assert_eq!(
            names,
            vec!["upload_progress", "upload_progress", "upload_completed", "upload_completed"]
        );

        let job = reg.get(upload_id);
        assert_eq!(job.upload.unwrap().percent, 100);
        assert!(job.transcode.is_none());
    }
}
