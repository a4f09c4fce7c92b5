//! Shared streaming helpers: path resolution, range parsing, content types,
//! and chunked file serving via `ReaderStream` with session accounting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use mf_core::{is_partial_file, SessionId, VideoId};

use crate::sessions::SessionManager;
use crate::stats::StatisticsAggregator;

const CHUNK_SIZE: usize = 64 * 1024;

pub const MANIFEST_CACHE_CONTROL: &str = "public, max-age=2";
pub const MEDIA_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Map `(video_id, file)` to a file under `root`.
///
/// `..` segments, backslashes, absolute paths and anything that resolves
/// (through symlinks) outside `root` are [`mf_core::Error::PathSecurity`];
/// anything that does not exist, is not a regular file or is a rendition
/// still being encoded is [`mf_core::Error::NotFound`]. Both surface as 404.
pub async fn resolve_stream_path(
    root: &Path,
    video_id: &VideoId,
    file: &str,
) -> mf_core::Result<PathBuf> {
    let rejected = file.is_empty()
        || file.starts_with('/')
        || file.contains('\\')
        || file.contains('\0')
        || file.split('/').any(|seg| seg == "..");
    if rejected {
        return Err(mf_core::Error::PathSecurity(format!("{video_id}/{file}")));
    }

    let not_found = || mf_core::Error::not_found("file", format!("{video_id}/{file}"));
    if is_partial_file(Path::new(file)) {
        return Err(not_found());
    }

    let root = tokio::fs::canonicalize(root).await.map_err(|_| not_found())?;
    let candidate = root.join(video_id.to_string()).join(file);
    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| not_found())?;

    if !resolved.starts_with(&root) {
        return Err(mf_core::Error::PathSecurity(resolved.display().to_string()));
    }

    let meta = tokio::fs::metadata(&resolved).await.map_err(|_| not_found())?;
    if !meta.is_file() {
        return Err(not_found());
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Range parsing
// ---------------------------------------------------------------------------

/// What part of a file a request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable `Range` header.
    Full,
    /// Inclusive byte range.
    Partial { start: u64, end: u64 },
    /// A syntactically valid range that starts past the end of the file.
    Unsatisfiable,
}

/// Interpret a `Range` header against a file of `size` bytes.
///
/// Supports `bytes=S-E`, `bytes=S-` and suffix `bytes=-N`. The end is
/// clamped to `size - 1`. Malformed headers and multi-range requests are
/// ignored (full response).
pub fn parse_range(header: Option<&str>, size: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start_str, end_str)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        let Ok(suffix) = end_str.parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || size == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial {
            start: size.saturating_sub(suffix),
            end: size - 1,
        };
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if end_str.is_empty() {
        None
    } else {
        match end_str.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return ByteRange::Full,
        }
    };

    if let Some(end) = end {
        if end < start {
            return ByteRange::Full;
        }
    }
    if start >= size {
        return ByteRange::Unsatisfiable;
    }

    let last = size - 1;
    ByteRange::Partial {
        start,
        end: end.map_or(last, |e| e.min(last)),
    }
}

// ---------------------------------------------------------------------------
// Content types
// ---------------------------------------------------------------------------

pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

pub fn cache_control_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => MANIFEST_CACHE_CONTROL,
        _ => MEDIA_CACHE_CONTROL,
    }
}

// ---------------------------------------------------------------------------
// Session accounting
// ---------------------------------------------------------------------------

/// Lives as long as the response body. Closes the session when the body
/// finishes, errors or is dropped by a disconnecting client.
pub struct SessionGuard {
    sessions: SessionManager,
    stats: Arc<StatisticsAggregator>,
    session_id: SessionId,
}

impl SessionGuard {
    pub fn open(
        sessions: SessionManager,
        stats: Arc<StatisticsAggregator>,
        video_id: VideoId,
        quality: &str,
    ) -> Self {
        let session_id = sessions.open(video_id, quality);
        stats.stream_started();
        Self {
            sessions,
            stats,
            session_id,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn record(&self, bytes: u64) {
        self.sessions.add_bytes(self.session_id, bytes);
        self.stats.stream_bytes(bytes);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.close(self.session_id);
        self.stats.stream_ended();
    }
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

/// Serve `file_path` with range support.
///
/// `open_session` runs only once the request is known to be served, so
/// unsatisfiable ranges never count as streams.
pub async fn serve_file_streaming(
    file_path: &Path,
    range_header: Option<&str>,
    open_session: impl FnOnce() -> SessionGuard,
) -> mf_core::Result<Response> {
    let file_size = tokio::fs::metadata(file_path)
        .await
        .map_err(|_| mf_core::Error::not_found("file", file_path.display()))?
        .len();
    let content_type = content_type_for(file_path);
    let cache_control = cache_control_for(file_path);

    let range = parse_range(range_header, file_size);
    if range == ByteRange::Unsatisfiable {
        return Ok((
            StatusCode::RANGE_NOT_SATISFIABLE,
            [
                (header::CONTENT_RANGE.as_str(), format!("bytes */{file_size}")),
                (header::ACCEPT_RANGES.as_str(), "bytes".to_string()),
            ],
            Body::empty(),
        )
            .into_response());
    }

    let mut file = tokio::fs::File::open(file_path)
        .await
        .map_err(|_| mf_core::Error::not_found("file", file_path.display()))?;

    let (status, start, length) = match range {
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        _ => (StatusCode::OK, 0, file_size),
    };

    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start)).await?;
    }

    let guard = open_session();
    tracing::debug!(
        session_id = %guard.session_id(),
        file = %file_path.display(),
        status = status.as_u16(),
        "Streaming file"
    );
    let stream = ReaderStream::with_capacity(file.take(length), CHUNK_SIZE).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            guard.record(bytes.len() as u64);
        }
        chunk
    });
    let body = Body::from_stream(stream);

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, cache_control);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{file_size}", start, start + length - 1),
        );
    }

    builder
        .body(body)
        .map_err(|e| mf_core::Error::Internal(format!("Failed to build stream response: {e}")))
}
