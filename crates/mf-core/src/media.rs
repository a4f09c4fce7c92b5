//! Media domain model: quality presets, probed metadata and rendition
//! outputs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File extensions that count as valid transcoded media when scanning an
/// output directory.
pub const MEDIA_EXTENSIONS: &[&str] = &["mp4", "m3u8", "ts", "m4s"];

/// Extension of a rendition the encoder is still writing.
pub const PARTIAL_EXTENSION: &str = "part";

/// A named quality target with fixed resolution and rate-control settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Name used for the stage label and the output file (`720p`).
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Target video bitrate in kbit/s.
    pub video_bitrate_kbps: u32,
    /// Peak video bitrate in kbit/s.
    pub max_bitrate_kbps: u32,
    /// Rate-control buffer size in kbit.
    pub buffer_size_kbps: u32,
}

impl Preset {
    pub fn new(
        name: &str,
        width: u32,
        height: u32,
        video_bitrate_kbps: u32,
        max_bitrate_kbps: u32,
        buffer_size_kbps: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            video_bitrate_kbps,
            max_bitrate_kbps,
            buffer_size_kbps,
        }
    }

    /// `WIDTHxHEIGHT`, the form ffmpeg's `-s` flag takes.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Output file name inside the video's directory.
    pub fn file_name(&self) -> String {
        format!("{}.mp4", self.name)
    }

    /// Name written to while the preset is encoding. Renamed to
    /// [`file_name`](Self::file_name) once the encoder succeeds.
    pub fn partial_file_name(&self) -> String {
        format!("{}.{PARTIAL_EXTENSION}", self.file_name())
    }

    /// Stage label used in progress records.
    pub fn stage_label(&self) -> String {
        format!("transcoding_{}", self.name)
    }
}

/// The default adaptive-bitrate ladder, ascending by resolution.
pub fn default_presets() -> Vec<Preset> {
    vec![
        Preset::new("360p", 640, 360, 800, 856, 1200),
        Preset::new("480p", 854, 480, 1400, 1498, 2100),
        Preset::new("720p", 1280, 720, 2800, 2996, 4200),
        Preset::new("1080p", 1920, 1080, 5000, 5350, 7500),
    ]
}

/// Sort presets into the deterministic processing order (ascending
/// resolution, then name).
pub fn order_presets(presets: &mut [Preset]) {
    presets.sort_by(|a, b| {
        (a.height, a.width, &a.name).cmp(&(b.height, b.width, &b.name))
    });
}

/// Metadata extracted from a source file by the probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Duration in seconds; `0.0` when unknown.
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Overall bitrate in bit/s.
    pub bitrate: Option<u64>,
    pub fps: Option<f64>,
    pub size_bytes: Option<u64>,
}

impl VideoMetadata {
    /// Whether the duration is usable for timemark-based percentages.
    pub fn has_duration(&self) -> bool {
        self.duration_secs.is_finite() && self.duration_secs > 0.0
    }
}

/// Descriptor of one completed rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionOutput {
    pub preset: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// A video known to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: crate::VideoId,
    pub name: String,
    pub metadata: Option<VideoMetadata>,
    pub renditions: Vec<RenditionOutput>,
}

/// Whether `path` has one of the [`MEDIA_EXTENSIONS`].
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            MEDIA_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Whether `path` is an unfinished rendition.
pub fn is_partial_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PARTIAL_EXTENSION))
}
