//! Stream session tracking.
//!
//! One session per stream request. A session lives from the moment the
//! response body starts until it finishes or errors.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use mf_core::{SessionId, VideoId};

/// An in-flight stream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSession {
    pub session_id: SessionId,
    pub video_id: VideoId,
    /// Requested file, e.g. `720p.mp4`.
    pub quality: String,
    pub bytes_served: u64,
    pub start_time: DateTime<Utc>,
}

/// Thread-safe table of active stream sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<DashMap<SessionId, StreamSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its id.
    pub fn open(&self, video_id: VideoId, quality: impl Into<String>) -> SessionId {
        let session_id = SessionId::new();
        let session = StreamSession {
            session_id,
            video_id,
            quality: quality.into(),
            bytes_served: 0,
            start_time: Utc::now(),
        };
        tracing::debug!(
            session_id = %session_id,
            video_id = %video_id,
            quality = %session.quality,
            "Stream session opened"
        );
        self.sessions.insert(session_id, session);
        session_id
    }

    pub fn add_bytes(&self, session_id: SessionId, bytes: u64) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.bytes_served += bytes;
        }
    }

    /// End a session. Returns the final record if it was still open.
    pub fn close(&self, session_id: SessionId) -> Option<StreamSession> {
        let (_, session) = self.sessions.remove(&session_id)?;
        tracing::debug!(
            session_id = %session_id,
            video_id = %session.video_id,
            bytes_served = session.bytes_served,
            duration_ms = (Utc::now() - session.start_time).num_milliseconds(),
            "Stream session closed"
        );
        Some(session)
    }

    pub fn get(&self, session_id: SessionId) -> Option<StreamSession> {
        self.sessions.get(&session_id).map(|entry| entry.value().clone())
    }

    pub fn list_active(&self) -> Vec<StreamSession> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_accumulate_close() {
        let manager = SessionManager::new();
        let video_id = VideoId::new();
        let id = manager.open(video_id, "720p.mp4");

        manager.add_bytes(id, 100);
        manager.add_bytes(id, 28);
        let session = manager.get(id).unwrap();
        assert_eq!(session.bytes_served, 128);
        assert_eq!(session.video_id, video_id);

        let closed = manager.close(id).unwrap();
        assert_eq!(closed.bytes_served, 128);
        assert!(manager.is_empty());
    }

    #[test]
    fn close_twice_is_none() {
        let manager = SessionManager::new();
        let id = manager.open(VideoId::new(), "360p.mp4");
        assert!(manager.close(id).is_some());
        assert!(manager.close(id).is_none());
    }

    #[test]
    fn bytes_for_unknown_session_are_ignored() {
        let manager = SessionManager::new();
        manager.add_bytes(SessionId::new(), 10);
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn list_active_is_ordered() {
        let manager = SessionManager::new();
        let first = manager.open(VideoId::new(), "a.mp4");
        std::thread::sleep(std::time::Duration::from_millis(2));
        manager.open(VideoId::new(), "b.mp4");
        let sessions = manager.list_active();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, first);
    }
}
