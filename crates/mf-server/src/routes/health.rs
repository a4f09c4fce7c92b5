//! Liveness endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::context::AppContext;

/// GET /health
///
/// 200 while running, 503 once draining has started. The body also reports
/// whether both storage roots accepted a write probe.
pub async fn health_check(State(ctx): State<AppContext>) -> impl IntoResponse {
    let state = ctx.lifecycle.state();
    let status = if ctx.lifecycle.is_accepting_requests() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let storage = ctx.cleanup.probe_storage().await;
    (
        status,
        Json(json!({
            "status": state,
            "active_jobs": ctx.lifecycle.active_count(),
            "storage": storage,
        })),
    )
}
