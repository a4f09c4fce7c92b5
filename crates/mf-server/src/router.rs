//! Axum router construction.
//!
//! Builds the full application router: the API group under `/api`, the
//! realtime socket, health, and the stream routes with their own CORS
//! policy.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        // Ingest
        .route(
            "/uploads/{upload_id}",
            put(routes::ingest::upload_video).layer(DefaultBodyLimit::disable()),
        )
        .route("/transcodes", post(routes::jobs::submit_transcode))
        // Catalog
        .route("/videos", get(routes::videos::list_videos))
        .route("/videos/{id}", get(routes::videos::get_video))
        // Progress
        .route("/progress", get(routes::progress::progress_snapshot))
        .route("/progress/{upload_id}", get(routes::progress::job_progress))
        // Stats
        .route("/stats", get(routes::stats::get_stats))
        .route(
            "/stats/disk-usage/refresh",
            post(routes::stats::refresh_disk_usage),
        )
        // Jobs and sessions
        .route("/jobs/active", get(routes::jobs::active_jobs))
        .route("/streams/active", get(routes::jobs::active_streams))
        .layer(cors);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/ws", get(routes::realtime::ws_handler))
        .nest("/api", api)
        .merge(routes::stream::stream_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
