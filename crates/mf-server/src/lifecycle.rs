//! Job lifecycle and graceful shutdown.
//!
//! Every long-running unit of work (upload, transcode, cleanup) registers an
//! [`ActiveJobHandle`] here. On shutdown the manager moves to `Draining`,
//! stops new work, waits (bounded) for the registered jobs to finish, runs
//! the cleanup callbacks in order and finally closes the realtime
//! transport.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mf_core::events::{EventBus, NotificationLevel};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Upload,
    Transcode,
    Cleanup,
}

/// A registered unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJobHandle {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub start_time: DateTime<Utc>,
    pub description: String,
}

/// What happened during [`JobLifecycleManager::initiate_shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownOutcome {
    /// `true` when every job finished before the timeout.
    pub drained: bool,
    /// Jobs still registered when the timeout hit.
    pub abandoned: Vec<ActiveJobHandle>,
    pub waited: Duration,
    pub cleanup_failures: usize,
}

type CleanupCallback = Box<dyn FnOnce() -> BoxFuture<'static, mf_core::Result<()>> + Send>;

// ---------------------------------------------------------------------------
// JobLifecycleManager
// ---------------------------------------------------------------------------

pub struct JobLifecycleManager {
    state: RwLock<LifecycleState>,
    jobs: Mutex<HashMap<String, ActiveJobHandle>>,
    cleanup_callbacks: Mutex<Vec<(String, CleanupCallback)>>,
    job_finished: Notify,
    drain_timeout: Duration,
    poll_interval: Duration,
    event_bus: Arc<EventBus>,
    /// Cancelled when draining starts: stop accepting, stop background loops.
    drain_token: CancellationToken,
    /// Cancelled once shutdown has finished: close realtime connections.
    close_token: CancellationToken,
}

impl JobLifecycleManager {
    pub fn new(event_bus: Arc<EventBus>, drain_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            state: RwLock::new(LifecycleState::Running),
            jobs: Mutex::new(HashMap::new()),
            cleanup_callbacks: Mutex::new(Vec::new()),
            job_finished: Notify::new(),
            drain_timeout,
            poll_interval,
            event_bus,
            drain_token: CancellationToken::new(),
            close_token: CancellationToken::new(),
        }
    }

    pub fn from_config(event_bus: Arc<EventBus>, config: &mf_core::config::ShutdownConfig) -> Self {
        Self::new(event_bus, config.drain_timeout(), config.poll_interval())
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn is_accepting_requests(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn drain_token(&self) -> CancellationToken {
        self.drain_token.clone()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close_token.clone()
    }

    /// Register a job.
    ///
    /// An id that is already registered is refused, so one running job can
    /// never be unregistered on behalf of another.
    pub fn register(
        &self,
        id: impl Into<String>,
        job_type: JobType,
        description: impl Into<String>,
    ) -> mf_core::Result<()> {
        let id = id.into();
        let mut jobs = self.jobs.lock();
        match jobs.entry(id) {
            Entry::Occupied(existing) => {
                tracing::warn!(job_id = %existing.key(), job_type = ?job_type, "Job id already active");
                Err(mf_core::Error::Validation(format!(
                    "job {} is already active",
                    existing.key()
                )))
            }
            Entry::Vacant(slot) => {
                tracing::debug!(job_id = %slot.key(), job_type = ?job_type, "Job registered");
                let handle = ActiveJobHandle {
                    id: slot.key().clone(),
                    job_type,
                    start_time: Utc::now(),
                    description: description.into(),
                };
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Remove a job. Returns the handle if it was registered.
    pub fn unregister(&self, id: &str) -> Option<ActiveJobHandle> {
        let removed = self.jobs.lock().remove(id);
        match &removed {
            Some(handle) => {
                let elapsed = (Utc::now() - handle.start_time).num_milliseconds();
                tracing::debug!(job_id = %id, elapsed_ms = elapsed, "Job unregistered");
                self.job_finished.notify_one();
            }
            None => tracing::warn!(job_id = %id, "Unregister of unknown job"),
        }
        removed
    }

    /// Register a job and return a guard that unregisters it on drop.
    pub fn track(
        self: &Arc<Self>,
        id: impl Into<String>,
        job_type: JobType,
        description: impl Into<String>,
    ) -> mf_core::Result<JobGuard> {
        let id = id.into();
        self.register(id.clone(), job_type, description)?;
        Ok(JobGuard {
            manager: Arc::clone(self),
            id,
        })
    }

    pub fn active_jobs(&self) -> Vec<ActiveJobHandle> {
        let mut jobs: Vec<_> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Add a callback run once, in registration order, after draining.
    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = mf_core::Result<()>> + Send + 'static,
    {
        let boxed: CleanupCallback = Box::new(move || Box::pin(callback()));
        self.cleanup_callbacks.lock().push((name.into(), boxed));
    }

    /// Drain and stop.
    ///
    /// Returns [`mf_core::Error::Unavailable`] when a shutdown is already in
    /// progress; the caller decides whether that means a forced exit.
    pub async fn initiate_shutdown(&self) -> mf_core::Result<ShutdownOutcome> {
        {
            let mut state = self.state.write();
            if *state != LifecycleState::Running {
                return Err(mf_core::Error::Unavailable(
                    "shutdown already in progress".into(),
                ));
            }
            *state = LifecycleState::Draining;
        }

        let started = Instant::now();
        tracing::info!(
            active_jobs = self.active_count(),
            timeout_secs = self.drain_timeout.as_secs(),
            "Draining: refusing new work"
        );
        self.drain_token.cancel();
        self.event_bus.notify(
            NotificationLevel::Warning,
            "Server is shutting down; new uploads are refused",
        );

        let abandoned = self.wait_for_jobs(started).await;
        let drained = abandoned.is_empty();
        if drained {
            tracing::info!(waited_ms = started.elapsed().as_millis() as u64, "All jobs finished");
        } else {
            for job in &abandoned {
                tracing::warn!(
                    job_id = %job.id,
                    job_type = ?job.job_type,
                    description = %job.description,
                    "Abandoning job at shutdown timeout"
                );
            }
        }

        let callbacks = std::mem::take(&mut *self.cleanup_callbacks.lock());
        let mut cleanup_failures = 0;
        for (name, callback) in callbacks {
            tracing::debug!(callback = %name, "Running shutdown callback");
            if let Err(e) = callback().await {
                cleanup_failures += 1;
                tracing::error!(callback = %name, error = %e, "Shutdown callback failed");
            }
        }

        *self.state.write() = LifecycleState::Stopped;
        self.close_token.cancel();

        Ok(ShutdownOutcome {
            drained,
            abandoned,
            waited: started.elapsed(),
            cleanup_failures,
        })
    }

    /// Poll until no jobs remain or the drain timeout is reached.
    async fn wait_for_jobs(&self, started: Instant) -> Vec<ActiveJobHandle> {
        loop {
            let remaining = self.active_count();
            if remaining == 0 {
                return Vec::new();
            }

            let elapsed = started.elapsed();
            if elapsed >= self.drain_timeout {
                return self.active_jobs();
            }

            tracing::info!(remaining, "Waiting for active jobs");
            let wait = self.poll_interval.min(self.drain_timeout - elapsed);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.job_finished.notified() => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JobGuard
// ---------------------------------------------------------------------------

/// Unregisters its job exactly once, on drop.
pub struct JobGuard {
    manager: Arc<JobLifecycleManager>,
    id: String,
}

impl JobGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}
