//! Multi-preset transcode orchestration.
//!
//! One transcode validates the input, probes it, then encodes every preset
//! in ascending resolution order, one at a time. Each preset is written to
//! `{preset}.mp4.part` and only renamed to `{preset}.mp4` once the encoder
//! succeeded. Progress is relayed into the [`ProgressRegistry`]; on failure
//! the partial output (and the upload it came from) is removed. The
//! lifecycle job is released on every exit path by a [`JobGuard`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;

use mf_av::{EncodeRequest, Encoder, MetadataProber};
use mf_core::config::TranscodeConfig;
use mf_core::progress::{overall_percent, stage_percent, TranscodeProgress, TranscodeStage};
use mf_core::{
    order_presets, Preset, RenditionOutput, TranscodeError, UploadId, VideoId, VideoMetadata,
    VideoRecord,
};

use crate::catalog::VideoCatalog;
use crate::lifecycle::{JobGuard, JobLifecycleManager, JobType};
use crate::maintenance::CleanupService;
use crate::progress::ProgressRegistry;
use crate::stats::StatisticsAggregator;

/// Input of one transcode.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub input_path: PathBuf,
    /// `{streams_dir}/{video_id}`.
    pub output_dir: PathBuf,
    pub video_id: VideoId,
    pub upload_id: UploadId,
    pub video_name: String,
    /// The input is an ingested upload and is deleted once consumed.
    pub source_is_upload: bool,
}

impl TranscodeRequest {
    /// Transcode a freshly ingested upload into a new video.
    pub fn for_upload(
        input_path: PathBuf,
        streams_dir: &Path,
        upload_id: UploadId,
        video_name: impl Into<String>,
    ) -> Self {
        let video_id = VideoId::new();
        Self {
            input_path,
            output_dir: streams_dir.join(video_id.to_string()),
            video_id,
            upload_id,
            video_name: video_name.into(),
            source_is_upload: true,
        }
    }

    /// Transcode an existing server-side file; the source is left alone.
    pub fn for_file(input_path: PathBuf, streams_dir: &Path, video_name: impl Into<String>) -> Self {
        let video_id = VideoId::new();
        Self {
            input_path,
            output_dir: streams_dir.join(video_id.to_string()),
            video_id,
            upload_id: UploadId::new(),
            video_name: video_name.into(),
            source_is_upload: false,
        }
    }

    pub fn job_key(&self) -> String {
        format!("transcode:{}", self.video_id)
    }
}

pub struct TranscodeOrchestrator {
    encoder: Arc<dyn Encoder>,
    prober: Arc<dyn MetadataProber>,
    config: TranscodeConfig,
    progress: Arc<ProgressRegistry>,
    lifecycle: Arc<JobLifecycleManager>,
    stats: Arc<StatisticsAggregator>,
    cleanup: Arc<CleanupService>,
    catalog: Arc<dyn VideoCatalog>,
}

impl TranscodeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        encoder: Arc<dyn Encoder>,
        prober: Arc<dyn MetadataProber>,
        config: TranscodeConfig,
        progress: Arc<ProgressRegistry>,
        lifecycle: Arc<JobLifecycleManager>,
        stats: Arc<StatisticsAggregator>,
        cleanup: Arc<CleanupService>,
        catalog: Arc<dyn VideoCatalog>,
    ) -> Self {
        Self {
            encoder,
            prober,
            config,
            progress,
            lifecycle,
            stats,
            cleanup,
            catalog,
        }
    }

    /// Probe `input` for duration, resolution, codecs, bitrate and fps.
    pub async fn extract_metadata(&self, input: &Path) -> Result<VideoMetadata, TranscodeError> {
        self.prober.probe(input).await.map_err(|e| {
            TranscodeError::metadata_extraction(format!(
                "{} failed on {}: {e}",
                self.prober.name(),
                input.display()
            ))
        })
    }

    /// Run a transcode to completion on the current task.
    pub async fn transcode(&self, request: TranscodeRequest) -> mf_core::Result<VideoRecord> {
        let _job = self.lifecycle.track(
            request.job_key(),
            JobType::Transcode,
            format!("transcode {}", request.video_name),
        )?;
        self.execute(&request).await
    }

    /// Register the job now and run the transcode in the background.
    ///
    /// The job is visible to the lifecycle manager before this returns, so a
    /// shutdown that starts right after submission still waits for it.
    pub fn submit(
        self: &Arc<Self>,
        request: TranscodeRequest,
    ) -> mf_core::Result<JoinHandle<mf_core::Result<VideoRecord>>> {
        let job: JobGuard = self.lifecycle.track(
            request.job_key(),
            JobType::Transcode,
            format!("transcode {}", request.video_name),
        )?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _job = job;
            this.execute(&request).await
        }))
    }

    async fn execute(&self, request: &TranscodeRequest) -> mf_core::Result<VideoRecord> {
        let started = Instant::now();
        tracing::info!(
            video_id = %request.video_id,
            upload_id = %request.upload_id,
            input = %request.input_path.display(),
            "Transcode started"
        );
        self.stats.transcode_started();
        let mut record =
            self.progress
                .start_transcode(request.upload_id, request.video_id, &request.video_name);

        match self.run(request, &mut record).await {
            Ok(video) => {
                self.progress.publish_transcode_progress(record.completed());
                self.stats.transcode_completed();
                self.catalog.register(video.clone());

                if request.source_is_upload {
                    if let Err(e) = tokio::fs::remove_file(&request.input_path).await {
                        tracing::debug!(
                            path = %request.input_path.display(),
                            error = %e,
                            "Could not remove consumed upload"
                        );
                    }
                }

                tracing::info!(
                    video_id = %request.video_id,
                    renditions = video.renditions.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transcode completed"
                );
                Ok(video)
            }
            Err(err) => {
                tracing::error!(
                    video_id = %request.video_id,
                    code = err.code.as_str(),
                    stage = %err.stage,
                    error = %err.message,
                    "Transcode failed"
                );
                self.progress
                    .publish_transcode_progress(record.failed(err.message.clone()));

                let upload = request
                    .source_is_upload
                    .then_some(request.input_path.as_path());
                self.cleanup
                    .cleanup_video_dir(&request.output_dir, upload)
                    .await;
                self.stats.transcode_failed();
                Err(err.into())
            }
        }
    }

    async fn run(
        &self,
        request: &TranscodeRequest,
        record: &mut TranscodeProgress,
    ) -> Result<VideoRecord, TranscodeError> {
        match tokio::fs::metadata(&request.input_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(TranscodeError::file_validation(format!(
                    "input is not a regular file: {}",
                    request.input_path.display()
                )))
            }
            Err(e) => {
                return Err(TranscodeError::file_validation(format!(
                    "input file not accessible: {}: {e}",
                    request.input_path.display()
                )))
            }
        }

        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| {
                TranscodeError::file_validation(format!(
                    "cannot create output directory {}: {e}",
                    request.output_dir.display()
                ))
            })?;

        let metadata = self.extract_metadata(&request.input_path).await?;
        if !metadata.has_duration() {
            tracing::debug!(
                video_id = %request.video_id,
                "Source duration unknown; using encoder percentages"
            );
        }

        let mut presets = self.config.presets.clone();
        order_presets(&mut presets);
        let total = presets.len();
        let mut renditions = Vec::with_capacity(total);

        for (index, preset) in presets.iter().enumerate() {
            let output = request.output_dir.join(preset.file_name());
            let partial = request.output_dir.join(preset.partial_file_name());

            record.stage = TranscodeStage::Transcoding(preset.name.clone());
            record.stage_percent = 0.0;
            record.overall_percent = record.overall_percent.max(overall_percent(index, total, 0.0));
            record.fps = None;
            record.updated_at = Utc::now();
            self.progress.publish_transcode_progress(record.clone());

            self.stats.preset_started(&preset.name);
            let preset_started = Instant::now();

            let encoded = match self
                .encode_preset(request, &metadata, preset, index, total, record, &partial)
                .await
            {
                Ok(()) => tokio::fs::rename(&partial, &output)
                    .await
                    .map_err(mf_core::Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = encoded {
                self.stats.preset_failed(&preset.name);
                tracing::error!(
                    video_id = %request.video_id,
                    preset = %preset.name,
                    resolution = %preset.resolution(),
                    error = %e,
                    "Preset encode failed"
                );
                return Err(TranscodeError::preset(&preset.name, e.to_string()));
            }

            self.stats
                .preset_completed(&preset.name, preset_started.elapsed());
            let size_bytes = tokio::fs::metadata(&output)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            tracing::info!(
                video_id = %request.video_id,
                preset = %preset.name,
                resolution = %preset.resolution(),
                size_bytes,
                "Preset completed"
            );
            renditions.push(RenditionOutput {
                preset: preset.name.clone(),
                path: output,
                width: preset.width,
                height: preset.height,
                size_bytes,
            });
        }

        Ok(VideoRecord {
            video_id: request.video_id,
            name: request.video_name.clone(),
            metadata: Some(metadata),
            renditions,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn encode_preset(
        &self,
        request: &TranscodeRequest,
        metadata: &VideoMetadata,
        preset: &Preset,
        index: usize,
        total: usize,
        record: &mut TranscodeProgress,
        output: &Path,
    ) -> mf_core::Result<()> {
        let encode = EncodeRequest::new(
            request.input_path.clone(),
            output.to_path_buf(),
            preset.clone(),
            &self.config,
        );
        let mut handle = self.encoder.start(encode)?;

        while let Some(tick) = handle.next_tick().await {
            let stage = stage_percent(tick.current_secs(), metadata.duration_secs, tick.percent);
            record.stage_percent = stage;
            record.overall_percent = record
                .overall_percent
                .max(overall_percent(index, total, stage));
            record.fps = tick.fps;
            record.updated_at = Utc::now();
            self.progress.publish_transcode_progress(record.clone());
        }

        handle.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DiskVideoCatalog;
    use crate::maintenance::DiskUsageMonitor;
    use async_trait::async_trait;
    use mf_av::{EncodeHandle, EncodeTick};
    use mf_core::events::{EventBus, EventPayload};
    use mf_core::TranscodeErrorCode;
    use std::time::Duration;

    struct FakeProber {
        duration: f64,
        fail: bool,
    }

    #[async_trait]
    impl MetadataProber for FakeProber {
        fn name(&self) -> &'static str {
            "fake-probe"
        }

        async fn probe(&self, _path: &Path) -> mf_core::Result<VideoMetadata> {
            if self.fail {
                return Err(mf_core::Error::Probe("unreadable".into()));
            }
            Ok(VideoMetadata {
                duration_secs: self.duration,
                width: 1920,
                height: 1080,
                ..Default::default()
            })
        }
    }

    struct FakeEncoder {
        fail_on: Option<&'static str>,
    }

    impl Encoder for FakeEncoder {
        fn name(&self) -> &'static str {
            "fake-encoder"
        }

        fn start(&self, request: EncodeRequest) -> mf_core::Result<EncodeHandle> {
            let (reporter, handle) = EncodeHandle::channel();
            let fail = self.fail_on == Some(request.preset.name.as_str());
            tokio::spawn(async move {
                for (mark, native) in [("00:00:02.50", 25.0), ("00:00:05.00", 50.0), ("00:00:10.00", 100.0)] {
                    reporter
                        .tick(EncodeTick {
                            timemark: mark.into(),
                            fps: Some(30.0),
                            percent: Some(native),
                        })
                        .await;
                }
                let _ = tokio::fs::write(&request.output, b"rendition").await;
                if fail {
                    reporter.finish(Err(mf_core::Error::tool("ffmpeg", "exit status 1")));
                } else {
                    reporter.finish(Ok(()));
                }
            });
            Ok(handle)
        }
    }

    /// Opens its output up front like ffmpeg does, then holds each preset
    /// until released.
    struct GatedEncoder {
        release: Arc<tokio::sync::Notify>,
    }

    impl Encoder for GatedEncoder {
        fn name(&self) -> &'static str {
            "gated-encoder"
        }

        fn start(&self, request: EncodeRequest) -> mf_core::Result<EncodeHandle> {
            let (reporter, handle) = EncodeHandle::channel();
            let release = Arc::clone(&self.release);
            tokio::spawn(async move {
                let _ = tokio::fs::write(&request.output, b"half").await;
                reporter
                    .tick(EncodeTick {
                        timemark: "00:00:05.00".into(),
                        fps: Some(30.0),
                        percent: None,
                    })
                    .await;
                release.notified().await;
                let _ = tokio::fs::write(&request.output, b"complete").await;
                reporter.finish(Ok(()));
            });
            Ok(handle)
        }
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..250 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    struct Harness {
        _dir: tempfile::TempDir,
        streams: PathBuf,
        uploads: PathBuf,
        bus: Arc<EventBus>,
        lifecycle: Arc<JobLifecycleManager>,
        progress: Arc<ProgressRegistry>,
        stats: Arc<StatisticsAggregator>,
        catalog: Arc<DiskVideoCatalog>,
        orchestrator: Arc<TranscodeOrchestrator>,
    }

    fn harness(encoder: impl Encoder + 'static, prober: FakeProber) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let streams = dir.path().join("streams");
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();

        let bus = Arc::new(EventBus::new(1024));
        let lifecycle = Arc::new(JobLifecycleManager::new(
            Arc::clone(&bus),
            Duration::from_secs(5),
            Duration::from_millis(50),
        ));
        let progress =
            ProgressRegistry::new(Arc::clone(&bus), Duration::from_secs(30), Duration::from_secs(60));
        let disk = DiskUsageMonitor::new(uploads.clone(), streams.clone(), 8);
        let stats = Arc::new(StatisticsAggregator::new(disk, Duration::from_secs(60)));
        let cleanup = Arc::new(CleanupService::new(
            uploads.clone(),
            streams.clone(),
            Duration::from_secs(3600),
            ".write-probe-",
        ));
        let prober: Arc<dyn MetadataProber> = Arc::new(prober);
        let catalog = Arc::new(DiskVideoCatalog::new(streams.clone(), vec![], Arc::clone(&prober)));
        let config = TranscodeConfig {
            presets: vec![
                Preset::new("720p", 1280, 720, 2800, 2996, 4200),
                Preset::new("360p", 640, 360, 800, 856, 1200),
            ],
            ..Default::default()
        };
        let orchestrator = Arc::new(TranscodeOrchestrator::new(
            Arc::new(encoder),
            prober,
            config,
            Arc::clone(&progress),
            Arc::clone(&lifecycle),
            Arc::clone(&stats),
            cleanup,
            Arc::clone(&catalog) as Arc<dyn VideoCatalog>,
        ));

        Harness {
            _dir: dir,
            streams,
            uploads,
            bus,
            lifecycle,
            progress,
            stats,
            catalog,
            orchestrator,
        }
    }

    fn upload(h: &Harness) -> TranscodeRequest {
        let input = h.uploads.join("in.upload");
        std::fs::write(&input, b"source").unwrap();
        TranscodeRequest::for_upload(input, &h.streams, UploadId::new(), "clip")
    }

    fn overall_history(rx: &mut tokio::sync::broadcast::Receiver<mf_core::events::Event>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.scope != mf_core::events::EventScope::Global {
                continue;
            }
            if let EventPayload::TranscodeProgress(r)
            | EventPayload::TranscodeCompleted(r)
            | EventPayload::TranscodeFailed(r) = event.payload
            {
                out.push(r.overall_percent);
            }
        }
        out
    }

    #[tokio::test]
    async fn success_produces_every_preset_in_order() {
        let h = harness(FakeEncoder { fail_on: None }, FakeProber { duration: 10.0, fail: false });
        let mut rx = h.bus.subscribe();
        let request = upload(&h);
        let input = request.input_path.clone();
        let upload_id = request.upload_id;

        let video = h.orchestrator.transcode(request).await.unwrap();

        let names: Vec<_> = video.renditions.iter().map(|r| r.preset.as_str()).collect();
        assert_eq!(names, vec!["360p", "720p"]);
        for r in &video.renditions {
            assert!(r.path.exists());
            assert_eq!(r.size_bytes, 9);
        }
        assert!(!input.exists(), "consumed upload is removed");
        assert_eq!(h.lifecycle.active_count(), 0);
        assert!(h.catalog.get(video.video_id).is_some());

        let history = overall_history(&mut rx);
        assert!(history.windows(2).all(|w| w[0] <= w[1]), "{history:?}");
        assert_eq!(*history.last().unwrap(), 100);
        assert!(history.contains(&50));

        let rec = h.progress.transcode(upload_id).unwrap();
        assert_eq!(rec.stage, TranscodeStage::Completed);
        let stats = h.stats.snapshot();
        assert_eq!(stats.transcodes.completed, 1);
        assert_eq!(stats.transcodes.by_preset["360p"].completed, 1);
    }

    #[tokio::test]
    async fn zero_duration_uses_native_percent() {
        let h = harness(FakeEncoder { fail_on: None }, FakeProber { duration: 0.0, fail: false });
        let mut rx = h.bus.subscribe();
        h.orchestrator.transcode(upload(&h)).await.unwrap();

        // Halfway through the first of two presets: 25 native -> 13 overall.
        let history = overall_history(&mut rx);
        assert!(history.contains(&13), "{history:?}");
    }

    #[tokio::test]
    async fn missing_input_is_file_validation() {
        let h = harness(FakeEncoder { fail_on: None }, FakeProber { duration: 10.0, fail: false });
        let request =
            TranscodeRequest::for_file(h.uploads.join("nope.mp4"), &h.streams, "missing");
        let upload_id = request.upload_id;

        let err = h.orchestrator.transcode(request).await.unwrap_err();
        match err {
            mf_core::Error::Transcode(e) => {
                assert_eq!(e.code, TranscodeErrorCode::FileValidationFailed);
                assert_eq!(e.stage, "file_validation");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(h.lifecycle.active_count(), 0);
        assert_eq!(h.progress.transcode(upload_id).unwrap().stage, TranscodeStage::Failed);
    }

    #[tokio::test]
    async fn probe_failure_is_metadata_extraction() {
        let h = harness(FakeEncoder { fail_on: None }, FakeProber { duration: 0.0, fail: true });
        let request = upload(&h);
        let output_dir = request.output_dir.clone();

        let err = h.orchestrator.transcode(request).await.unwrap_err();
        assert!(matches!(
            err,
            mf_core::Error::Transcode(ref e) if e.code == TranscodeErrorCode::MetadataExtractionFailed
        ));
        assert_eq!(h.lifecycle.active_count(), 0);
        assert!(!output_dir.exists());
    }

    #[tokio::test]
    async fn mid_preset_failure_removes_outputs_and_upload() {
        let h = harness(FakeEncoder { fail_on: Some("720p") }, FakeProber { duration: 10.0, fail: false });
        let request = upload(&h);
        let output_dir = request.output_dir.clone();
        let input = request.input_path.clone();

        let err = h.orchestrator.transcode(request).await.unwrap_err();
        match err {
            mf_core::Error::Transcode(e) => {
                assert_eq!(e.code, TranscodeErrorCode::TranscodeFailed);
                assert_eq!(e.stage, "transcoding_720p");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!output_dir.join("360p.mp4").exists());
        assert!(!output_dir.exists());
        assert!(!input.exists());
        assert_eq!(h.lifecycle.active_count(), 0);
        assert_eq!(h.stats.snapshot().transcodes.by_preset["720p"].failed, 1);
    }

    #[tokio::test]
    async fn file_source_is_kept_on_failure() {
        let h = harness(FakeEncoder { fail_on: Some("360p") }, FakeProber { duration: 10.0, fail: false });
        let input = h.uploads.join("library.mp4");
        std::fs::write(&input, b"source").unwrap();
        let request = TranscodeRequest::for_file(input.clone(), &h.streams, "library");

        assert!(h.orchestrator.transcode(request).await.is_err());
        assert!(input.exists());
    }

    #[tokio::test]
    async fn submit_registers_before_returning() {
        let h = harness(FakeEncoder { fail_on: None }, FakeProber { duration: 10.0, fail: false });
        let request = upload(&h);
        let key = request.job_key();

        let handle = h.orchestrator.submit(request).unwrap();
        assert!(h.lifecycle.active_jobs().iter().any(|j| j.id == key));
        handle.await.unwrap().unwrap();
        assert_eq!(h.lifecycle.active_count(), 0);
    }

    #[tokio::test]
    async fn rendition_appears_only_after_its_preset_completes() {
        let release = Arc::new(tokio::sync::Notify::new());
        let h = harness(
            GatedEncoder { release: Arc::clone(&release) },
            FakeProber { duration: 10.0, fail: false },
        );
        let request = upload(&h);
        let output_dir = request.output_dir.clone();
        let upload_id = request.upload_id;
        let handle = h.orchestrator.submit(request).unwrap();

        let in_stage = |name: &'static str| {
            let progress = Arc::clone(&h.progress);
            move || {
                progress.transcode(upload_id).is_some_and(|r| {
                    r.stage == TranscodeStage::Transcoding(name.into()) && r.overall_percent > 0
                })
            }
        };

        assert!(eventually(in_stage("360p")).await);
        assert!(output_dir.join("360p.mp4.part").exists());
        assert!(!output_dir.join("360p.mp4").exists());

        // A restart mid-encode must not pick up the unfinished file.
        let restarted = DiskVideoCatalog::new(
            h.streams.clone(),
            mf_core::default_presets(),
            Arc::new(FakeProber { duration: 10.0, fail: false }),
        );
        assert_eq!(restarted.rebuild().await.unwrap(), 0);

        release.notify_one();
        assert!(eventually(in_stage("720p")).await);
        assert!(output_dir.join("360p.mp4").exists());
        assert!(!output_dir.join("360p.mp4.part").exists());
        assert!(!output_dir.join("720p.mp4").exists());

        release.notify_one();
        let video = handle.await.unwrap().unwrap();
        for r in &video.renditions {
            assert_eq!(std::fs::read(&r.path).unwrap(), b"complete");
        }
        assert!(!output_dir.join("720p.mp4.part").exists());
    }
}
