//! Periodic background maintenance: orphan cleanup and disk usage.

mod cleanup;
mod disk_usage;

pub use cleanup::{CleanupResult, CleanupService, StorageProbe};
pub use disk_usage::{dir_size, DiskUsageMonitor};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::lifecycle::{JobLifecycleManager, JobType};

/// Run the cleanup sweep after `initial_delay`, then every `interval`.
///
/// Each sweep is registered as a `cleanup` job so shutdown waits for it.
pub async fn run_cleanup_scheduler(
    service: Arc<CleanupService>,
    lifecycle: Arc<JobLifecycleManager>,
    initial_delay: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        initial_delay_secs = initial_delay.as_secs(),
        "Cleanup scheduler started"
    );

    let mut wait = initial_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => break,
        }
        wait = interval;

        if !lifecycle.is_accepting_requests() {
            break;
        }
        let Ok(_job) = lifecycle.track("cleanup:periodic", JobType::Cleanup, "periodic orphan cleanup")
        else {
            tracing::debug!("Previous cleanup still running; skipping this tick");
            continue;
        };
        service.run_cleanup().await;
    }

    tracing::info!("Cleanup scheduler stopped");
}
