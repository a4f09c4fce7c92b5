//! Progress query handlers.

use axum::extract::{Path, State};
use axum::Json;

use mf_core::events::JobRecord;
use mf_core::progress::ProgressSnapshot;
use mf_core::UploadId;

use crate::context::AppContext;
use crate::error::AppError;

/// GET /api/progress
pub async fn progress_snapshot(State(ctx): State<AppContext>) -> Json<ProgressSnapshot> {
    Json(ctx.progress.snapshot())
}

/// GET /api/progress/{upload_id}
pub async fn job_progress(
    State(ctx): State<AppContext>,
    Path(upload_id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    let upload_id: UploadId = upload_id
        .parse()
        .map_err(|_| mf_core::Error::Validation("Invalid upload_id".into()))?;

    let record = ctx.progress.get(upload_id);
    if record.is_empty() {
        return Err(mf_core::Error::not_found("progress", upload_id).into());
    }
    Ok(Json(record))
}
