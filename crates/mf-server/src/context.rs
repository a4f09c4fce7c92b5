//! Service-oriented application context.
//!
//! [`AppContext`] is the composition root. It owns every service as an
//! `Arc` and is shared with route handlers through axum state.

use std::sync::Arc;
use std::time::Duration;

use mf_av::{Encoder, MetadataProber};
use mf_core::config::Config;
use mf_core::events::EventBus;

use crate::catalog::{DiskVideoCatalog, VideoCatalog};
use crate::lifecycle::JobLifecycleManager;
use crate::maintenance::{CleanupService, DiskUsageMonitor};
use crate::progress::ProgressRegistry;
use crate::sessions::SessionManager;
use crate::stats::StatisticsAggregator;
use crate::transcode::TranscodeOrchestrator;

/// Broadcast buffer per realtime subscriber.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Application context shared by all request handlers (via Axum state).
///
/// This is cheaply cloneable because it only holds `Arc`s.
#[derive(Clone)]
pub struct AppContext {
    /// Immutable application configuration snapshot.
    pub config: Arc<Config>,
    /// Broadcast event bus for the realtime channel.
    pub event_bus: Arc<EventBus>,
    pub lifecycle: Arc<JobLifecycleManager>,
    pub progress: Arc<ProgressRegistry>,
    pub stats: Arc<StatisticsAggregator>,
    pub disk_usage: Arc<DiskUsageMonitor>,
    pub cleanup: Arc<CleanupService>,
    pub sessions: SessionManager,
    pub catalog: Arc<dyn VideoCatalog>,
    pub orchestrator: Arc<TranscodeOrchestrator>,
}

impl AppContext {
    /// Build every service from `config`, using the given encoder and prober.
    pub fn new(config: Config, encoder: Arc<dyn Encoder>, prober: Arc<dyn MetadataProber>) -> Self {
        let storage = &config.storage;

        let event_bus = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
        let lifecycle = Arc::new(JobLifecycleManager::from_config(
            Arc::clone(&event_bus),
            &config.shutdown,
        ));
        let progress = ProgressRegistry::from_config(Arc::clone(&event_bus), &config.progress);
        let disk_usage = DiskUsageMonitor::new(
            storage.uploads_dir.clone(),
            storage.streams_dir.clone(),
            config.maintenance.disk_usage_batch_size,
        );
        let stats = Arc::new(StatisticsAggregator::new(
            Arc::clone(&disk_usage),
            Duration::from_secs(config.stats.disk_refresh_min_interval_secs),
        ));
        let cleanup = Arc::new(CleanupService::from_config(
            storage.uploads_dir.clone(),
            storage.streams_dir.clone(),
            &config.maintenance,
        ));
        let catalog: Arc<dyn VideoCatalog> = Arc::new(DiskVideoCatalog::new(
            storage.streams_dir.clone(),
            config.transcode.presets.clone(),
            Arc::clone(&prober),
        ));
        let orchestrator = Arc::new(TranscodeOrchestrator::new(
            encoder,
            prober,
            config.transcode.clone(),
            Arc::clone(&progress),
            Arc::clone(&lifecycle),
            Arc::clone(&stats),
            Arc::clone(&cleanup),
            Arc::clone(&catalog),
        ));

        Self {
            config: Arc::new(config),
            event_bus,
            lifecycle,
            progress,
            stats,
            disk_usage,
            cleanup,
            sessions: SessionManager::new(),
            catalog,
            orchestrator,
        }
    }

    /// Create the storage roots if they do not exist yet.
    pub async fn ensure_storage(&self) -> mf_core::Result<()> {
        for dir in [&self.config.storage.uploads_dir, &self.config.storage.streams_dir] {
            if !dir.exists() {
                tokio::fs::create_dir_all(dir).await?;
                tracing::info!("Created directory {}", dir.display());
            }
        }
        Ok(())
    }
}
