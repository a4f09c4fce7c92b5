//! Per-preset encoding with streamed progress.
//!
//! An [`Encoder`] starts one encode and returns an [`EncodeHandle`]: a
//! stream of [`EncodeTick`]s followed by a single terminal result. The
//! ffmpeg implementation runs the encoder as a child process with
//! `-progress pipe:2` and parses its key/value blocks from stderr.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use mf_core::config::{AudioConfig, TranscodeConfig};
use mf_core::Preset;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{mpsc, oneshot};

use crate::command::ToolCommand;
use crate::timemark::{format_timemark, parse_timemark};
use crate::tools::ToolRegistry;

/// Long sources at slow presets take hours.
const ENCODE_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Non-progress stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

const TICK_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Request / tick types
// ---------------------------------------------------------------------------

/// Everything the encoder needs for one preset.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub preset: Preset,
    pub video_codec: String,
    pub encoder_preset: String,
    pub audio: AudioConfig,
}

impl EncodeRequest {
    pub fn new(input: PathBuf, output: PathBuf, preset: Preset, config: &TranscodeConfig) -> Self {
        Self {
            input,
            output,
            preset,
            video_codec: config.video_codec.clone(),
            encoder_preset: config.encoder_preset.clone(),
            audio: config.audio.clone(),
        }
    }
}

/// One progress report from a running encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeTick {
    /// Position in the output, `HH:MM:SS(.ms)`.
    pub timemark: String,
    pub fps: Option<f64>,
    /// The encoder's own percentage, when it knows the input length.
    pub percent: Option<f64>,
}

impl EncodeTick {
    pub fn current_secs(&self) -> f64 {
        parse_timemark(&self.timemark)
    }
}

// ---------------------------------------------------------------------------
// Handle / reporter
// ---------------------------------------------------------------------------

/// Consumer side of a running encode.
#[derive(Debug)]
pub struct EncodeHandle {
    progress: mpsc::Receiver<EncodeTick>,
    result: oneshot::Receiver<mf_core::Result<()>>,
}

/// Producer side of a running encode, held by the encoder implementation.
#[derive(Debug)]
pub struct EncodeReporter {
    progress: mpsc::Sender<EncodeTick>,
    result: oneshot::Sender<mf_core::Result<()>>,
}

impl EncodeHandle {
    /// Create a connected reporter/handle pair.
    pub fn channel() -> (EncodeReporter, EncodeHandle) {
        let (progress_tx, progress_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = oneshot::channel();
        (
            EncodeReporter {
                progress: progress_tx,
                result: result_tx,
            },
            EncodeHandle {
                progress: progress_rx,
                result: result_rx,
            },
        )
    }

    /// Next progress tick, or `None` once the encoder has stopped reporting.
    pub async fn next_tick(&mut self) -> Option<EncodeTick> {
        self.progress.recv().await
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> mf_core::Result<()> {
        self.result.await.unwrap_or_else(|_| {
            Err(mf_core::Error::Internal(
                "encoder stopped without reporting a result".into(),
            ))
        })
    }
}

impl EncodeReporter {
    /// Forward a tick. A dropped handle is ignored.
    pub async fn tick(&self, tick: EncodeTick) {
        let _ = self.progress.send(tick).await;
    }

    /// Close the progress stream and deliver the terminal result.
    pub fn finish(self, result: mf_core::Result<()>) {
        drop(self.progress);
        let _ = self.result.send(result);
    }
}

// ---------------------------------------------------------------------------
// Encoder trait
// ---------------------------------------------------------------------------

/// Starts encodes. Implementations must be usable from many jobs at once.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start encoding `request` in the background.
    ///
    /// Must be called from within a tokio runtime.
    fn start(&self, request: EncodeRequest) -> mf_core::Result<EncodeHandle>;
}

// ---------------------------------------------------------------------------
// ffmpeg
// ---------------------------------------------------------------------------

/// [`Encoder`] backed by the ffmpeg CLI.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            timeout: ENCODE_TIMEOUT,
        }
    }

    pub fn from_registry(tools: &ToolRegistry) -> mf_core::Result<Self> {
        Ok(Self::new(tools.require("ffmpeg")?.path.clone()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Encoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn start(&self, request: EncodeRequest) -> mf_core::Result<EncodeHandle> {
        let mut cmd = ToolCommand::new(self.ffmpeg_path.clone());
        cmd.args(build_ffmpeg_args(&request));
        cmd.timeout(self.timeout);

        tracing::debug!(
            preset = %request.preset.name,
            input = %request.input.display(),
            output = %request.output.display(),
            "Spawning ffmpeg: {}",
            cmd.get_args().join(" ")
        );

        let mut child = cmd.spawn_with_stderr()?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| mf_core::Error::tool("ffmpeg", "failed to capture stderr"))?;

        let (reporter, handle) = EncodeHandle::channel();
        let timeout = cmd.get_timeout();

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, drive(&mut child, stderr, &reporter)).await;
            let result = match outcome {
                Ok(result) => result,
                Err(_elapsed) => {
                    let _ = child.kill().await;
                    Err(mf_core::Error::tool(
                        "ffmpeg",
                        format!("timed out after {timeout:?}"),
                    ))
                }
            };
            reporter.finish(result);
        });

        Ok(handle)
    }
}

/// Pump progress until ffmpeg closes stderr, then collect its exit status.
async fn drive(
    child: &mut Child,
    stderr: ChildStderr,
    reporter: &EncodeReporter,
) -> mf_core::Result<()> {
    let tail = pump_progress(tokio::io::BufReader::new(stderr), reporter).await?;
    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(mf_core::Error::tool(
            "ffmpeg",
            format!("exited with status {status}: {tail}"),
        ))
    }
}

/// Build the ffmpeg argument list for one preset.
pub fn build_ffmpeg_args(request: &EncodeRequest) -> Vec<String> {
    let preset = &request.preset;
    let audio = &request.audio;

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-progress".into(),
        "pipe:2".into(),
        "-nostats".into(),
        "-i".into(),
        request.input.to_string_lossy().to_string(),
    ];

    args.extend([
        "-c:v".into(),
        request.video_codec.clone(),
        "-preset".into(),
        request.encoder_preset.clone(),
        "-s".into(),
        preset.resolution(),
        "-b:v".into(),
        format!("{}k", preset.video_bitrate_kbps),
        "-maxrate".into(),
        format!("{}k", preset.max_bitrate_kbps),
        "-bufsize".into(),
        format!("{}k", preset.buffer_size_kbps),
    ]);

    args.extend([
        "-c:a".into(),
        audio.codec.clone(),
        "-b:a".into(),
        audio.bitrate.clone(),
        "-ac".into(),
        audio.channels.to_string(),
        "-ar".into(),
        audio.sample_rate.to_string(),
    ]);

    // The output may carry a temporary suffix, so the muxer is explicit.
    args.extend([
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        "mp4".into(),
        request.output.to_string_lossy().to_string(),
    ]);

    args
}

/// Read ffmpeg stderr to EOF, forwarding a tick per progress block.
///
/// Returns the last non-progress lines for error reporting.
async fn pump_progress<R>(reader: R, reporter: &EncodeReporter) -> mf_core::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut parser = ProgressParser::default();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while let Some(line) = lines.next_line().await? {
        if let Some(tick) = parser.feed(&line) {
            reporter.tick(tick).await;
        } else if !is_progress_line(&line) && !line.trim().is_empty() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    Ok(tail.into_iter().collect::<Vec<_>>().join("\n"))
}

/// `key=value` lines emitted by `-progress`.
fn is_progress_line(line: &str) -> bool {
    line.split_once('=')
        .map(|(key, _)| {
            !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .unwrap_or(false)
}

/// Accumulates one `-progress` block at a time.
#[derive(Debug, Default)]
struct ProgressParser {
    input_duration: Option<f64>,
    out_time: Option<String>,
    out_time_us: Option<i64>,
    fps: Option<f64>,
}

impl ProgressParser {
    /// Feed one stderr line; returns a tick when a block ends.
    fn feed(&mut self, line: &str) -> Option<EncodeTick> {
        let line = line.trim();

        // Input banner: "Duration: 00:01:03.48, start: 0.000000, bitrate: ..."
        if let Some(rest) = line.strip_prefix("Duration:") {
            if self.input_duration.is_none() {
                let value = rest.split(',').next().unwrap_or("").trim();
                let secs = parse_timemark(value);
                if secs > 0.0 {
                    self.input_duration = Some(secs);
                }
            }
            return None;
        }

        let (key, value) = line.split_once('=')?;
        let value = value.trim();
        match key {
            "out_time" => self.out_time = Some(value.to_string()),
            // ffmpeg reports out_time_ms in microseconds as well.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_us = Some(us);
                }
            }
            "fps" => self.fps = value.parse::<f64>().ok().filter(|f| f.is_finite()),
            "progress" => return Some(self.emit()),
            _ => {}
        }
        None
    }

    fn emit(&mut self) -> EncodeTick {
        let timemark = match (self.out_time.take(), self.out_time_us.take()) {
            (Some(t), _) if t != "N/A" => t,
            (_, Some(us)) => format_timemark(us as f64 / 1_000_000.0),
            _ => format_timemark(0.0),
        };
        let percent = self.input_duration.map(|duration| {
            (parse_timemark(&timemark) / duration * 100.0).clamp(0.0, 100.0)
        });
        EncodeTick {
            timemark,
            fps: self.fps.take(),
            percent,
        }
    }
}
