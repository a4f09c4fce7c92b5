//! Unified error type for mediaforge.
//!
//! All crates funnel their failures into [`Error`], which carries enough
//! context for API handlers to derive an HTTP status code via
//! [`Error::http_status`]. Failures inside a transcode are additionally
//! wrapped in a [`TranscodeError`] so the failing stage (and preset) is
//! always identifiable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TranscodeError
// ---------------------------------------------------------------------------

/// Machine-readable classification of a transcode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscodeErrorCode {
    /// The input file was missing or unreadable.
    FileValidationFailed,
    /// The metadata probe failed or returned unusable output.
    MetadataExtractionFailed,
    /// The encoder failed for a specific preset.
    TranscodeFailed,
}

impl TranscodeErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileValidationFailed => "FILE_VALIDATION_FAILED",
            Self::MetadataExtractionFailed => "METADATA_EXTRACTION_FAILED",
            Self::TranscodeFailed => "TRANSCODE_FAILED",
        }
    }
}

impl fmt::Display for TranscodeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured transcode failure: `{code, stage, timestamp}` plus the
/// human-readable message that is surfaced on the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code} [{stage}]: {message}")]
pub struct TranscodeError {
    pub code: TranscodeErrorCode,
    /// `file_validation`, `metadata_extraction` or `transcoding_<preset>`.
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscodeError {
    pub fn new(
        code: TranscodeErrorCode,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            stage: stage.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn file_validation(message: impl Into<String>) -> Self {
        Self::new(
            TranscodeErrorCode::FileValidationFailed,
            "file_validation",
            message,
        )
    }

    pub fn metadata_extraction(message: impl Into<String>) -> Self {
        Self::new(
            TranscodeErrorCode::MetadataExtractionFailed,
            "metadata_extraction",
            message,
        )
    }

    /// Failure of the encoder for the named preset.
    pub fn preset(preset: &str, message: impl Into<String>) -> Self {
        Self::new(
            TranscodeErrorCode::TranscodeFailed,
            format!("transcoding_{preset}"),
            message,
        )
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Unified error type covering all failure modes in mediaforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "video", "file").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// A path tried to escape its root. Reported to clients as not found.
    #[error("Path security violation: {0}")]
    PathSecurity(String),

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The server is draining and refuses new work.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Media probing failed.
    #[error("Probe error: {0}")]
    Probe(String),

    /// A transcode failed at a known stage.
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            // Never 403: existence of files outside the root must not leak.
            Error::PathSecurity(_) => 404,
            Error::Validation(_) => 400,
            Error::Unavailable(_) => 503,
            Error::Io { .. } => 500,
            Error::Tool { .. } => 502,
            Error::Probe(_) => 422,
            Error::Transcode(e) => match e.code {
                TranscodeErrorCode::FileValidationFailed => 400,
                TranscodeErrorCode::MetadataExtractionFailed => 422,
                TranscodeErrorCode::TranscodeFailed => 500,
            },
            Error::Internal(_) => 500,
        }
    }

    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } | Error::PathSecurity(_) => "not_found",
            Error::Validation(_) => "validation_error",
            Error::Unavailable(_) => "unavailable",
            Error::Io { .. } => "io_error",
            Error::Tool { .. } => "tool_error",
            Error::Probe(_) => "probe_error",
            Error::Transcode(e) => e.code.as_str(),
            Error::Internal(_) => "internal_error",
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
