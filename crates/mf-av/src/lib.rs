//! # mf-av
//!
//! External tool integration for the mediaforge transcode pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes.
//! - **Metadata probing** ([`MetadataProber`], [`FfprobeProber`]) -- duration,
//!   resolution, codecs, bitrate and frame rate of a source file.
//! - **Encoding** ([`Encoder`], [`FfmpegEncoder`]) -- one preset per
//!   invocation, returning an [`EncodeHandle`] that streams `{timemark, fps}`
//!   ticks and resolves to a terminal result.

pub mod command;
pub mod encoder;
pub mod probe;
pub mod timemark;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use encoder::{
    build_ffmpeg_args, EncodeHandle, EncodeReporter, EncodeRequest, EncodeTick, Encoder,
    FfmpegEncoder,
};
pub use probe::{FfprobeProber, MetadataProber};
pub use timemark::{format_timemark, parse_timemark};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
