//! Passive counters fed by every other service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use mf_core::events::{EventBus, EventPayload};
use mf_core::stats::{running_average, StatsSnapshot, StreamStats, TranscodeStats, UploadStats};

use crate::maintenance::DiskUsageMonitor;

#[derive(Default)]
struct Counters {
    uploads: UploadStats,
    transcodes: TranscodeStats,
    streams: StreamStats,
}

pub struct StatisticsAggregator {
    counters: Mutex<Counters>,
    disk: Arc<DiskUsageMonitor>,
    disk_refresh_cap: Duration,
    last_disk_refresh: Mutex<Option<Instant>>,
    started: Instant,
}

impl StatisticsAggregator {
    pub fn new(disk: Arc<DiskUsageMonitor>, disk_refresh_cap: Duration) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            disk,
            disk_refresh_cap,
            last_disk_refresh: Mutex::new(None),
            started: Instant::now(),
        }
    }

    // -- Uploads ------------------------------------------------------------

    pub fn upload_started(&self) {
        let mut c = self.counters.lock();
        c.uploads.active += 1;
        c.uploads.total += 1;
        c.uploads.peak_concurrent = c.uploads.peak_concurrent.max(c.uploads.active);
    }

    pub fn upload_completed(&self, duration: Duration) {
        let mut c = self.counters.lock();
        c.uploads.active = c.uploads.active.saturating_sub(1);
        c.uploads.completed += 1;
        c.uploads.average_duration_secs = running_average(
            c.uploads.average_duration_secs,
            c.uploads.completed,
            duration.as_secs_f64(),
        );
    }

    pub fn upload_failed(&self) {
        let mut c = self.counters.lock();
        c.uploads.active = c.uploads.active.saturating_sub(1);
        c.uploads.failed += 1;
    }

    // -- Transcodes ---------------------------------------------------------

    pub fn transcode_started(&self) {
        let mut c = self.counters.lock();
        c.transcodes.active += 1;
        c.transcodes.total += 1;
    }

    pub fn transcode_completed(&self) {
        let mut c = self.counters.lock();
        c.transcodes.active = c.transcodes.active.saturating_sub(1);
        c.transcodes.completed += 1;
    }

    pub fn transcode_failed(&self) {
        let mut c = self.counters.lock();
        c.transcodes.active = c.transcodes.active.saturating_sub(1);
        c.transcodes.failed += 1;
    }

    pub fn preset_started(&self, preset: &str) {
        let mut c = self.counters.lock();
        c.transcodes.by_preset.entry(preset.to_string()).or_default().total += 1;
    }

    pub fn preset_completed(&self, preset: &str, duration: Duration) {
        let mut c = self.counters.lock();
        let entry = c.transcodes.by_preset.entry(preset.to_string()).or_default();
        entry.completed += 1;
        entry.samples += 1;
        entry.average_duration_secs =
            running_average(entry.average_duration_secs, entry.samples, duration.as_secs_f64());
    }

    pub fn preset_failed(&self, preset: &str) {
        let mut c = self.counters.lock();
        c.transcodes.by_preset.entry(preset.to_string()).or_default().failed += 1;
    }

    // -- Streams ------------------------------------------------------------

    pub fn stream_started(&self) {
        let mut c = self.counters.lock();
        c.streams.active += 1;
        c.streams.total += 1;
        c.streams.peak_concurrent = c.streams.peak_concurrent.max(c.streams.active);
    }

    pub fn stream_bytes(&self, bytes: u64) {
        self.counters.lock().streams.bytes_served += bytes;
    }

    pub fn stream_ended(&self) {
        let mut c = self.counters.lock();
        c.streams.active = c.streams.active.saturating_sub(1);
    }

    // -- Queries ------------------------------------------------------------

    /// Current counters plus the cached disk usage.
    ///
    /// Also kicks off a background disk refresh, at most once per refresh
    /// cap.
    pub fn get_stats(&self) -> StatsSnapshot {
        self.maybe_refresh_disk();
        self.snapshot()
    }

    /// Counters without touching the disk monitor.
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.counters.lock();
        StatsSnapshot {
            uploads: c.uploads.clone(),
            transcodes: c.transcodes.clone(),
            streams: c.streams.clone(),
            disk: self.disk.snapshot(),
            uptime_secs: self.started.elapsed().as_secs(),
            generated_at: Utc::now(),
        }
    }

    fn maybe_refresh_disk(&self) {
        let mut last = self.last_disk_refresh.lock();
        let due = match *last {
            Some(at) => at.elapsed() >= self.disk_refresh_cap,
            None => true,
        };
        if due && self.disk.trigger_refresh() {
            *last = Some(Instant::now());
        }
    }

    /// Publish a `stats_update` event every `interval` until cancelled.
    pub async fn run_broadcast(
        self: Arc<Self>,
        event_bus: Arc<EventBus>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        tracing::debug!(interval_secs = interval.as_secs(), "Stats broadcaster started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
            if event_bus.receiver_count() > 0 {
                event_bus.publish_global(EventPayload::StatsUpdate(self.snapshot()));
            }
        }
        tracing::debug!("Stats broadcaster stopped");
    }
}
