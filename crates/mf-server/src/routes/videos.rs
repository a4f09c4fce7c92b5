//! Video catalog handlers.

use axum::extract::{Path, State};
use axum::Json;

use mf_core::{VideoId, VideoRecord};

use crate::context::AppContext;
use crate::error::AppError;

/// GET /api/videos
pub async fn list_videos(State(ctx): State<AppContext>) -> Json<Vec<VideoRecord>> {
    Json(ctx.catalog.list())
}

/// GET /api/videos/{id}
pub async fn get_video(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<VideoRecord>, AppError> {
    let video_id: VideoId = id
        .parse()
        .map_err(|_| mf_core::Error::Validation("Invalid video id".into()))?;
    let video = ctx
        .catalog
        .get(video_id)
        .ok_or_else(|| mf_core::Error::not_found("video", video_id))?;
    Ok(Json(video))
}
