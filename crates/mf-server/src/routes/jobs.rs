//! Job and session listing, and transcode submission.

use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use mf_core::{UploadId, VideoId};

use crate::context::AppContext;
use crate::error::AppError;
use crate::lifecycle::ActiveJobHandle;
use crate::sessions::StreamSession;
use crate::transcode::TranscodeRequest;

/// Request body for starting a transcode of a server-side file.
#[derive(Debug, Deserialize)]
pub struct SubmitTranscodeRequest {
    pub input_path: String,
    pub video_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscodeAccepted {
    pub video_id: VideoId,
    /// Key of the progress record on the realtime channel.
    pub upload_id: UploadId,
}

/// GET /api/jobs/active
pub async fn active_jobs(State(ctx): State<AppContext>) -> Json<Vec<ActiveJobHandle>> {
    Json(ctx.lifecycle.active_jobs())
}

/// GET /api/streams/active
pub async fn active_streams(State(ctx): State<AppContext>) -> Json<Vec<StreamSession>> {
    Json(ctx.sessions.list_active())
}

/// POST /api/transcodes
pub async fn submit_transcode(
    State(ctx): State<AppContext>,
    Json(payload): Json<SubmitTranscodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !ctx.lifecycle.is_accepting_requests() {
        return Err(mf_core::Error::Unavailable("server is shutting down".into()).into());
    }
    if payload.input_path.trim().is_empty() {
        return Err(mf_core::Error::Validation("input_path is required".into()).into());
    }

    let input = PathBuf::from(&payload.input_path);
    if !tokio::fs::metadata(&input).await.is_ok_and(|m| m.is_file()) {
        return Err(mf_core::Error::not_found("file", input.display()).into());
    }

    let video_name = payload
        .video_name
        .filter(|n| !n.trim().is_empty())
        .or_else(|| {
            input
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "untitled".to_string());

    let request =
        TranscodeRequest::for_file(input, &ctx.config.storage.streams_dir, video_name);
    let accepted = TranscodeAccepted {
        video_id: request.video_id,
        upload_id: request.upload_id,
    };
    tracing::info!(
        video_id = %accepted.video_id,
        input = %payload.input_path,
        "Transcode submitted"
    );
    let _handle = ctx.orchestrator.submit(request)?;

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
