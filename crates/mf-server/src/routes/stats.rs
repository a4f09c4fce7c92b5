//! Statistics handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use mf_core::stats::StatsSnapshot;

use crate::context::AppContext;

/// GET /api/stats
pub async fn get_stats(State(ctx): State<AppContext>) -> Json<StatsSnapshot> {
    Json(ctx.stats.get_stats())
}

/// POST /api/stats/disk-usage/refresh
///
/// 202 when a scan was started, 409 when one is already running.
pub async fn refresh_disk_usage(State(ctx): State<AppContext>) -> impl IntoResponse {
    let started = ctx.disk_usage.trigger_refresh();
    let status = if started {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    (
        status,
        Json(json!({
            "started": started,
            "disk": ctx.disk_usage.snapshot(),
        })),
    )
}
