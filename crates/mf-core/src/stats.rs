//! Statistics snapshot types shared by the aggregator, the stats API and
//! the periodic `stats_update` broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cached result of the last disk-usage scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsageSnapshot {
    pub uploads_bytes: u64,
    pub streams_bytes: u64,
    pub total_bytes: u64,
    /// `None` until the first scan finishes.
    pub last_updated: Option<DateTime<Utc>>,
    pub is_calculating: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadStats {
    pub active: u64,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub peak_concurrent: u64,
    pub average_duration_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub average_duration_secs: f64,
    /// Number of durations folded into the average.
    pub samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscodeStats {
    pub active: u64,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub by_preset: BTreeMap<String, PresetStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub active: u64,
    pub total: u64,
    pub bytes_served: u64,
    pub peak_concurrent: u64,
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uploads: UploadStats,
    pub transcodes: TranscodeStats,
    pub streams: StreamStats,
    pub disk: DiskUsageSnapshot,
    pub uptime_secs: u64,
    pub generated_at: DateTime<Utc>,
}

/// Fold one more sample into an incremental running average.
///
/// `count` is the number of samples *including* the new one.
pub fn running_average(old_avg: f64, count: u64, sample: f64) -> f64 {
    if count <= 1 {
        return sample;
    }
    let n = count as f64;
    (old_avg * (n - 1.0) + sample) / n
}
