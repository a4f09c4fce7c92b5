//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which builds a temp-dir backed config and a full
//! [`AppContext`] wired to a scripted encoder and prober, so no ffmpeg is
//! needed. [`TestHarness::with_server`] runs the real serve loop on a random
//! port for HTTP and WebSocket tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use mf_av::{EncodeHandle, EncodeRequest, EncodeTick, Encoder, MetadataProber};
use mf_core::config::Config;
use mf_core::{Preset, VideoId, VideoMetadata};
use mf_server::context::AppContext;
use mf_server::router::build_router;

/// Encoder that writes a small placeholder file per preset after emitting a
/// few ticks. Behaviour is adjustable per test.
#[derive(Default)]
pub struct ScriptedEncoder {
    /// Delay between ticks.
    pub tick_delay: Mutex<Duration>,
    /// Preset name whose encode reports failure.
    pub fail_on: Mutex<Option<String>>,
    /// Presets started so far, in order.
    pub started: Mutex<Vec<String>>,
}

impl Encoder for ScriptedEncoder {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start(&self, request: EncodeRequest) -> mf_core::Result<EncodeHandle> {
        let (reporter, handle) = EncodeHandle::channel();
        let delay = *self.tick_delay.lock();
        let fail = self.fail_on.lock().as_deref() == Some(request.preset.name.as_str());
        self.started.lock().push(request.preset.name.clone());

        tokio::spawn(async move {
            for mark in ["00:00:02.50", "00:00:05.00", "00:00:10.00"] {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                reporter
                    .tick(EncodeTick {
                        timemark: mark.into(),
                        fps: Some(24.0),
                        percent: None,
                    })
                    .await;
            }
            let _ = tokio::fs::write(&request.output, b"rendition bytes").await;
            if fail {
                reporter.finish(Err(mf_core::Error::tool("ffmpeg", "exit status 1")));
            } else {
                reporter.finish(Ok(()));
            }
        });
        Ok(handle)
    }
}

/// Prober reporting a fixed 10 second 1080p source.
pub struct FixedProber;

#[async_trait]
impl MetadataProber for FixedProber {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn probe(&self, _path: &Path) -> mf_core::Result<VideoMetadata> {
        Ok(VideoMetadata {
            duration_secs: 10.0,
            width: 1920,
            height: 1080,
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
            ..Default::default()
        })
    }
}

/// Test harness wrapping a fully-constructed [`AppContext`] rooted in a
/// temporary directory.
pub struct TestHarness {
    pub ctx: AppContext,
    pub encoder: Arc<ScriptedEncoder>,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    /// Harness with test-sized timings and two presets.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        Self::with_config(test_config(dir.path()), dir)
    }

    /// Harness with a custom configuration. `dir` is kept alive with it.
    pub fn with_config(config: Config, dir: tempfile::TempDir) -> Self {
        std::fs::create_dir_all(&config.storage.uploads_dir).expect("uploads dir");
        std::fs::create_dir_all(&config.storage.streams_dir).expect("streams dir");

        let encoder = Arc::new(ScriptedEncoder::default());
        let ctx = AppContext::new(config, encoder.clone(), Arc::new(FixedProber));
        Self { ctx, encoder, dir }
    }

    /// Router for `tower::ServiceExt::oneshot` tests.
    pub fn router(&self) -> axum::Router {
        build_router(self.ctx.clone())
    }

    /// Start the full serve loop on a random port. The returned handle
    /// resolves once shutdown has completed.
    pub async fn with_server() -> (Self, SocketAddr, JoinHandle<mf_core::Result<()>>) {
        let harness = Self::new();
        let (addr, handle) = harness.serve().await;
        (harness, addr, handle)
    }

    pub async fn serve(&self) -> (SocketAddr, JoinHandle<mf_core::Result<()>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");
        let handle = tokio::spawn(mf_server::serve_on(self.ctx.clone(), listener));
        (addr, handle)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.ctx.config.storage.uploads_dir.clone()
    }

    pub fn streams_dir(&self) -> PathBuf {
        self.ctx.config.storage.streams_dir.clone()
    }

    /// Write `len` bytes of a repeating pattern as `{streams}/{video}/{name}`.
    pub fn write_rendition(&self, video_id: VideoId, name: &str, len: usize) -> PathBuf {
        let dir = self.streams_dir().join(video_id.to_string());
        std::fs::create_dir_all(&dir).expect("video dir");
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).expect("write rendition");
        path
    }

    /// Write a source file outside the storage roots.
    pub fn write_source(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"source video").expect("write source");
        path
    }

    /// Poll `check` every 20ms for up to 5s.
    pub async fn wait_for(&self, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..250 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }
}

/// Config rooted at `root` with fast shutdown polling and two presets.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.storage.uploads_dir = root.join("uploads");
    config.storage.streams_dir = root.join("streams");
    config.transcode.presets = vec![
        Preset::new("720p", 1280, 720, 2800, 2996, 4200),
        Preset::new("360p", 640, 360, 800, 856, 1200),
    ];
    config.shutdown.drain_timeout_secs = 5;
    config.shutdown.poll_interval_ms = 50;
    config
}
