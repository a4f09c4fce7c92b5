//! Upload ingestion.
//!
//! `PUT /api/uploads/{upload_id}` streams the request body to
//! `{uploads_dir}/{upload_id}.upload`, then hands the file to the
//! orchestrator in the background.

use std::path::Path as FsPath;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use mf_core::progress::UploadProgress;
use mf_core::{UploadId, VideoId};

use crate::context::AppContext;
use crate::error::AppError;
use crate::lifecycle::JobType;
use crate::transcode::TranscodeRequest;

/// Minimum spacing between `upload_progress` events of one upload.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub video_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub video_id: VideoId,
    pub upload_id: UploadId,
}

/// PUT /api/uploads/{upload_id}
pub async fn upload_video(
    State(ctx): State<AppContext>,
    Path(upload_id): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    if !ctx.lifecycle.is_accepting_requests() {
        return Err(mf_core::Error::Unavailable("server is shutting down".into()).into());
    }

    let upload_id: UploadId = upload_id
        .parse()
        .map_err(|_| mf_core::Error::Validation("Invalid upload_id".into()))?;
    let video_name = params
        .video_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| upload_id.to_string());

    // Claimed before the file is touched: a second PUT for the same id is
    // refused instead of writing into the same upload file.
    let job = ctx
        .lifecycle
        .track(format!("upload:{upload_id}"), JobType::Upload, format!("upload {video_name}"))
        .map_err(|_| mf_core::Error::Validation(format!("upload {upload_id} is already in progress")))?;

    let total_bytes = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let path = ctx
        .config
        .storage
        .uploads_dir
        .join(format!("{upload_id}.upload"));

    ctx.stats.upload_started();
    let started = Instant::now();

    let mut record = UploadProgress::new(upload_id, &video_name, total_bytes);
    ctx.progress.publish_upload_progress(record.clone());

    match write_body(&ctx, &path, body, &mut record).await {
        Ok(bytes) => {
            record.complete();
            ctx.progress.publish_upload_progress(record);
            ctx.stats.upload_completed(started.elapsed());
            tracing::info!(upload_id = %upload_id, bytes, "Upload received");
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            record.fail(e.to_string());
            ctx.progress.publish_upload_progress(record);
            ctx.stats.upload_failed();
            tracing::warn!(upload_id = %upload_id, error = %e, "Upload failed");
            return Err(e.into());
        }
    }

    // Register the transcode before releasing the upload job so shutdown
    // never sees a gap between the two.
    let request = TranscodeRequest::for_upload(
        path,
        &ctx.config.storage.streams_dir,
        upload_id,
        video_name,
    );
    let video_id = request.video_id;
    let input = request.input_path.clone();
    if let Err(e) = ctx.orchestrator.submit(request) {
        let _ = tokio::fs::remove_file(&input).await;
        return Err(e.into());
    }
    drop(job);

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            video_id,
            upload_id,
        }),
    ))
}

/// Stream `body` into `path`, publishing throttled progress. Returns the
/// number of bytes written.
async fn write_body(
    ctx: &AppContext,
    path: &FsPath,
    body: Body,
    record: &mut UploadProgress,
) -> mf_core::Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = body.into_data_stream();
    let mut written = 0u64;
    let mut last_publish = Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| mf_core::Error::Validation(format!("upload body interrupted: {e}")))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if last_publish.elapsed() >= PROGRESS_INTERVAL {
            record.advance(written);
            ctx.progress.publish_upload_progress(record.clone());
            last_publish = Instant::now();
        }
    }
    file.flush().await?;

    if written == 0 {
        return Err(mf_core::Error::Validation("upload body is empty".into()));
    }
    if let Some(total) = record.total_bytes {
        if written != total {
            return Err(mf_core::Error::Validation(format!(
                "upload truncated: received {written} of {total} bytes"
            )));
        }
    }

    record.advance(written);
    Ok(written)
}
