//! Realtime event model and the in-process broadcast bus.
//!
//! Every event is tagged with an [`EventScope`]. Job-related events are
//! published twice: once scoped to the job's upload id (for observers that
//! subscribed to that job) and once globally (for dashboards watching
//! everything).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::progress::{ProgressSnapshot, TranscodeProgress, UploadProgress};
use crate::stats::StatsSnapshot;
use crate::UploadId;

// ---------------------------------------------------------------------------
// EventScope
// ---------------------------------------------------------------------------

/// Audience of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    /// Every connected observer.
    Global,
    /// Only observers subscribed to this upload id.
    Job(UploadId),
}

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Current records of one job, replayed to a fresh subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub upload: Option<UploadProgress>,
    pub transcode: Option<TranscodeProgress>,
}

impl JobRecord {
    pub fn is_empty(&self) -> bool {
        self.upload.is_none() && self.transcode.is_none()
    }
}

/// What happened. Serialized as `{"event": <name>, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    ProgressSnapshot(ProgressSnapshot),
    JobRecord(JobRecord),

    // -- Uploads -------------------------------------------------------------
    UploadProgress(UploadProgress),
    UploadCompleted(UploadProgress),
    UploadFailed(UploadProgress),

    // -- Transcodes ----------------------------------------------------------
    TranscodeStarted(TranscodeProgress),
    TranscodeProgress(TranscodeProgress),
    TranscodeCompleted(TranscodeProgress),
    TranscodeFailed(TranscodeProgress),

    // -- System --------------------------------------------------------------
    SystemNotification {
        level: NotificationLevel,
        message: String,
    },
    StatsUpdate(StatsSnapshot),
}

impl EventPayload {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProgressSnapshot(_) => "progress_snapshot",
            Self::JobRecord(_) => "job_record",
            Self::UploadProgress(_) => "upload_progress",
            Self::UploadCompleted(_) => "upload_completed",
            Self::UploadFailed(_) => "upload_failed",
            Self::TranscodeStarted(_) => "transcode_started",
            Self::TranscodeProgress(_) => "transcode_progress",
            Self::TranscodeCompleted(_) => "transcode_completed",
            Self::TranscodeFailed(_) => "transcode_failed",
            Self::SystemNotification { .. } => "system_notification",
            Self::StatsUpdate(_) => "stats_update",
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped, scoped event ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub scope: EventScope,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(scope: EventScope, payload: EventPayload) -> Self {
        Self {
            scope,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn global(payload: EventPayload) -> Self {
        Self::new(EventScope::Global, payload)
    }

    /// Whether an observer with the given subscriptions should see this.
    pub fn is_visible_to(&self, subscriptions: &std::collections::HashSet<UploadId>) -> bool {
        match self.scope {
            EventScope::Global => true,
            EventScope::Job(id) => subscriptions.contains(&id),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel fanning events out to every realtime connection.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-receiver backlog before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish a job event: once scoped to `upload_id`, once globally.
    pub fn publish_job(&self, upload_id: UploadId, payload: EventPayload) {
        self.send(Event::new(EventScope::Job(upload_id), payload.clone()));
        self.send(Event::global(payload));
    }

    /// Publish an event to every observer.
    pub fn publish_global(&self, payload: EventPayload) {
        self.send(Event::global(payload));
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.publish_global(EventPayload::SystemNotification {
            level,
            message: message.into(),
        });
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, event: Event) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VideoId;
    use std::collections::HashSet;

    fn transcode_record(upload_id: UploadId) -> TranscodeProgress {
        TranscodeProgress::started(upload_id, VideoId::new(), "clip")
    }

    #[test]
    fn job_events_are_published_scoped_and_global() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let upload_id = UploadId::new();

        bus.publish_job(
            upload_id,
            EventPayload::TranscodeStarted(transcode_record(upload_id)),
        );

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.scope, EventScope::Job(upload_id));
        assert_eq!(second.scope, EventScope::Global);
        assert_eq!(first.payload, second.payload);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn scoped_events_only_visible_to_subscribers() {
        let upload_id = UploadId::new();
        let event = Event::new(
            EventScope::Job(upload_id),
            EventPayload::TranscodeProgress(transcode_record(upload_id)),
        );
        let mut subs = HashSet::new();
        assert!(!event.is_visible_to(&subs));
        subs.insert(upload_id);
        assert!(event.is_visible_to(&subs));

        let global = Event::global(EventPayload::ProgressSnapshot(ProgressSnapshot::default()));
        assert!(global.is_visible_to(&HashSet::new()));
    }

    #[test]
    fn wire_format() {
        let upload_id = UploadId::new();
        let event = Event::new(
            EventScope::Job(upload_id),
            EventPayload::TranscodeProgress(transcode_record(upload_id)),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "transcode_progress");
        assert_eq!(json["scope"]["job"], upload_id.to_string());
        assert_eq!(json["data"]["stage"], "idle");
        assert!(json["timestamp"].is_string());

        let global = Event::global(EventPayload::SystemNotification {
            level: NotificationLevel::Warning,
            message: "draining".into(),
        });
        let json = serde_json::to_value(&global).unwrap();
        assert_eq!(json["scope"], "global");
        assert_eq!(json["event"], "system_notification");
        assert_eq!(json["data"]["level"], "warning");
    }

    #[test]
    fn payload_names_match_serialized_tag() {
        let upload_id = UploadId::new();
        let payloads = vec![
            EventPayload::ProgressSnapshot(ProgressSnapshot::default()),
            EventPayload::JobRecord(JobRecord::default()),
            EventPayload::UploadProgress(UploadProgress::new(upload_id, "clip", None)),
            EventPayload::TranscodeFailed(transcode_record(upload_id).failed("boom")),
            EventPayload::SystemNotification {
                level: NotificationLevel::Info,
                message: "hello".into(),
            },
        ];
        for p in &payloads {
            let json = serde_json::to_value(p).unwrap();
            assert_eq!(json["event"], p.name());
        }
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.notify(NotificationLevel::Error, "nobody listening");
        assert_eq!(bus.receiver_count(), 0);
    }
}
