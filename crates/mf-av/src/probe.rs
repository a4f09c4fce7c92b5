//! Source metadata extraction.
//!
//! [`MetadataProber`] is the seam the transcode orchestrator depends on;
//! [`FfprobeProber`] implements it by shelling out to
//! `ffprobe -v quiet -print_format json -show_format -show_streams`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mf_core::VideoMetadata;
use serde::Deserialize;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Probes run against local files and should be quick.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Extracts [`VideoMetadata`] from a media file.
#[async_trait]
pub trait MetadataProber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(&self, path: &Path) -> mf_core::Result<VideoMetadata>;
}

/// A prober backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self { ffprobe_path }
    }

    /// Build from a discovered registry.
    pub fn from_registry(tools: &ToolRegistry) -> mf_core::Result<Self> {
        Ok(Self::new(tools.require("ffprobe")?.path.clone()))
    }
}

#[async_trait]
impl MetadataProber for FfprobeProber {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    async fn probe(&self, path: &Path) -> mf_core::Result<VideoMetadata> {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.timeout(PROBE_TIMEOUT);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]);
        cmd.arg(path.to_string_lossy().as_ref());

        let output = cmd.execute().await?;
        parse_ffprobe_json(&output.stdout)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Map ffprobe's JSON into [`VideoMetadata`].
///
/// A missing or unparsable duration becomes `0.0` so the encoder's own
/// percentage is used later. Output without any video stream is rejected.
pub fn parse_ffprobe_json(json: &str) -> mf_core::Result<VideoMetadata> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| mf_core::Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| mf_core::Error::Probe("no video stream found".into()))?;

    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let format = output.format.as_ref();

    let duration_secs = format
        .and_then(|f| f.duration.as_deref())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);

    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate));

    Ok(VideoMetadata {
        duration_secs,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        video_codec: video.codec_name.clone(),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
        bitrate: format
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|s| s.parse().ok()),
        fps,
        size_bytes: format
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse().ok()),
    })
}

/// Parse a rational frame rate like `"24000/1001"` or `"25"`.
fn parse_frame_rate(s: &str) -> Option<f64> {
    let value = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}
