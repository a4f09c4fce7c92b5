//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the server, storage roots, tools, transcoding, progress
//! retention, maintenance, shutdown and statistics. Every section defaults
//! sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::media::{default_presets, Preset};
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub transcode: TranscodeConfig,
    pub progress: ProgressConfig,
    pub maintenance: MaintenanceConfig,
    pub shutdown: ShutdownConfig,
    pub stats: StatsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.storage.uploads_dir == self.storage.streams_dir {
            warnings.push(
                "storage.uploads_dir and storage.streams_dir are the same directory".into(),
            );
        }

        if self.transcode.presets.is_empty() {
            warnings.push("transcode.presets is empty; every transcode will be a no-op".into());
        }

        let mut seen = std::collections::HashSet::new();
        for (i, preset) in self.transcode.presets.iter().enumerate() {
            if !seen.insert(preset.name.as_str()) {
                warnings.push(format!("transcode.presets[{i}] duplicates name '{}'", preset.name));
            }
            if preset.width == 0 || preset.height == 0 {
                warnings.push(format!("transcode.presets[{i}] has a zero dimension"));
            }
            if preset.max_bitrate_kbps < preset.video_bitrate_kbps {
                warnings.push(format!(
                    "transcode.presets[{i}] max bitrate is below the target bitrate"
                ));
            }
        }

        if self.maintenance.orphan_threshold_secs == 0 {
            warnings.push(
                "maintenance.orphan_threshold_secs is 0; in-flight files may be deleted".into(),
            );
        }

        if self.shutdown.drain_timeout_secs == 0 {
            warnings.push("shutdown.drain_timeout_secs is 0; jobs will never be waited for".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// Where uploads land and where renditions are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub uploads_dir: PathBuf,
    /// Output root; every video gets `{streams_dir}/{video_id}/`.
    pub streams_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("./data/uploads"),
            streams_dir: PathBuf::from("./data/streams"),
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Fixed audio parameters passed to every preset encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub codec: String,
    pub bitrate: String,
    pub channels: u32,
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: "aac".into(),
            bitrate: "128k".into(),
            channels: 2,
            sample_rate: 44_100,
        }
    }
}

/// Transcoding ladder and encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub presets: Vec<Preset>,
    pub video_codec: String,
    /// x264 speed preset.
    pub encoder_preset: String,
    pub audio: AudioConfig,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            presets: default_presets(),
            video_codec: "libx264".into(),
            encoder_preset: "veryfast".into(),
            audio: AudioConfig::default(),
        }
    }
}

/// How long terminal progress records stay visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub success_grace_secs: u64,
    /// Longer than success so failures can be inspected.
    pub failure_grace_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            success_grace_secs: 30,
            failure_grace_secs: 60,
        }
    }
}

impl ProgressConfig {
    pub fn success_grace(&self) -> Duration {
        Duration::from_secs(self.success_grace_secs)
    }

    pub fn failure_grace(&self) -> Duration {
        Duration::from_secs(self.failure_grace_secs)
    }
}

/// Orphan cleanup and disk-usage scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub cleanup_interval_secs: u64,
    pub cleanup_initial_delay_secs: u64,
    /// Minimum age before anything is considered orphaned.
    pub orphan_threshold_secs: u64,
    pub disk_usage_interval_secs: u64,
    /// Directory entries stat'ed concurrently per batch.
    pub disk_usage_batch_size: usize,
    /// Prefix of files written by health-check write probes.
    pub write_probe_prefix: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 3600,
            cleanup_initial_delay_secs: 60,
            orphan_threshold_secs: 3600,
            disk_usage_interval_secs: 300,
            disk_usage_batch_size: 64,
            write_probe_prefix: ".write-probe-".into(),
        }
    }
}

impl MaintenanceConfig {
    pub fn orphan_threshold(&self) -> Duration {
        Duration::from_secs(self.orphan_threshold_secs)
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Statistics broadcast settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub broadcast_interval_secs: u64,
    /// `get_stats` triggers a disk refresh at most this often.
    pub disk_refresh_min_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_secs: 5,
            disk_refresh_min_interval_secs: 60,
        }
    }
}
