//! Progress records for uploads and transcodes.
//!
//! Records are keyed by [`UploadId`] and always overwritten as a whole, so
//! the latest record is the full truth for any observer that (re)connects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{UploadId, VideoId};

// ---------------------------------------------------------------------------
// TranscodeStage
// ---------------------------------------------------------------------------

/// Stage of a transcode as seen by observers.
///
/// Serialized as a flat string: `idle`, `transcoding_<preset>`, `completed`
/// or `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TranscodeStage {
    Idle,
    /// Encoding the named preset.
    Transcoding(String),
    Completed,
    Failed,
}

impl TranscodeStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TranscodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Transcoding(preset) => write!(f, "transcoding_{preset}"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

impl From<TranscodeStage> for String {
    fn from(stage: TranscodeStage) -> Self {
        stage.to_string()
    }
}

impl TryFrom<String> for TranscodeStage {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "idle" => Ok(Self::Idle),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => match other.strip_prefix("transcoding_") {
                Some(preset) if !preset.is_empty() => Ok(Self::Transcoding(preset.to_string())),
                _ => Err(format!("unknown transcode stage: {other}")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TranscodeProgress
// ---------------------------------------------------------------------------

/// Progress record of one transcode job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeProgress {
    pub upload_id: UploadId,
    pub video_id: VideoId,
    pub video_name: String,
    pub stage: TranscodeStage,
    /// Percent of the current preset, 0..=100.
    pub stage_percent: f64,
    /// Percent of the whole job, 0..=100, never decreasing.
    pub overall_percent: u8,
    /// Encoder frames per second, if reported.
    pub fps: Option<f64>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TranscodeProgress {
    /// A fresh record in the `idle` stage.
    pub fn started(upload_id: UploadId, video_id: VideoId, video_name: impl Into<String>) -> Self {
        Self {
            upload_id,
            video_id,
            video_name: video_name.into(),
            stage: TranscodeStage::Idle,
            stage_percent: 0.0,
            overall_percent: 0,
            fps: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Copy of this record moved to `completed` at 100%.
    pub fn completed(&self) -> Self {
        Self {
            stage: TranscodeStage::Completed,
            stage_percent: 100.0,
            overall_percent: 100,
            fps: None,
            error: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Copy of this record moved to `failed`, keeping the last percentages.
    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            stage: TranscodeStage::Failed,
            fps: None,
            error: Some(error.into()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// UploadProgress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Uploading,
    Completed,
    Failed,
}

/// Progress record of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub upload_id: UploadId,
    pub video_name: String,
    pub bytes_received: u64,
    /// Declared size, when the client sent a `Content-Length`.
    pub total_bytes: Option<u64>,
    pub percent: u8,
    pub stage: UploadStage,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UploadProgress {
    pub fn new(upload_id: UploadId, video_name: impl Into<String>, total_bytes: Option<u64>) -> Self {
        Self {
            upload_id,
            video_name: video_name.into(),
            bytes_received: 0,
            total_bytes,
            percent: 0,
            stage: UploadStage::Uploading,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Record `bytes_received` and recompute the percent.
    pub fn advance(&mut self, bytes_received: u64) {
        self.bytes_received = bytes_received;
        self.percent = match self.total_bytes {
            Some(total) if total > 0 => {
                ((bytes_received as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
            }
            _ => 0,
        };
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self) {
        self.stage = UploadStage::Completed;
        self.percent = 100;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.stage = UploadStage::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.stage != UploadStage::Uploading
    }
}

/// Every live progress record, handed to newly connected observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub uploads: Vec<UploadProgress>,
    pub transcodes: Vec<TranscodeProgress>,
}

// ---------------------------------------------------------------------------
// Progress math
// ---------------------------------------------------------------------------

/// Percent of one preset from the encoder timemark.
///
/// Falls back to `native_percent` when the duration is unknown.
pub fn stage_percent(current_secs: f64, duration_secs: f64, native_percent: Option<f64>) -> f64 {
    let raw = if duration_secs.is_finite() && duration_secs > 0.0 {
        current_secs / duration_secs * 100.0
    } else {
        native_percent.unwrap_or(0.0)
    };
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 100.0)
    }
}

/// Whole-job percent for preset `index` of `total` at `stage_percent`.
pub fn overall_percent(index: usize, total: usize, stage_percent: f64) -> u8 {
    if total == 0 {
        return 100;
    }
    let share = 100.0 / total as f64;
    let value = index as f64 * share + stage_percent.clamp(0.0, 100.0) / 100.0 * share;
    value.round().clamp(0.0, 100.0) as u8
}
