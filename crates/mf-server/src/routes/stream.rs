//! Stream delivery of transcoded output with HTTP range support.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use mf_core::VideoId;

use super::streaming_helpers::{resolve_stream_path, serve_file_streaming, SessionGuard};
use crate::context::AppContext;
use crate::error::AppError;

/// `/stream/{video_id}/{*file}` with its own CORS policy: any origin,
/// read-only methods, range headers exposed to players.
pub fn stream_routes() -> Router<AppContext> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::RANGE])
        .expose_headers([
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::CONTENT_LENGTH,
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route(
            "/stream/{video_id}/{*file}",
            get(stream_file).options(stream_options),
        )
        .layer(cors)
}

/// GET /stream/{video_id}/{*file}
///
/// Rejected paths and missing files produce the same 404 body.
pub async fn stream_file(
    State(ctx): State<AppContext>,
    Path((video_id, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let video_id: VideoId = video_id
        .parse()
        .map_err(|_| mf_core::Error::not_found("video", &video_id))?;

    let path = match resolve_stream_path(&ctx.config.storage.streams_dir, &video_id, &file).await {
        Ok(path) => path,
        Err(e) => {
            if matches!(e, mf_core::Error::PathSecurity(_)) {
                tracing::warn!(video_id = %video_id, file = %file, error = %e, "Rejected stream path");
            }
            return Err(mf_core::Error::not_found("file", format!("{video_id}/{file}")).into());
        }
    };

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let open_session = || SessionGuard::open(ctx.sessions.clone(), ctx.stats.clone(), video_id, &file);

    Ok(serve_file_streaming(&path, range, open_session).await?)
}

/// OPTIONS without preflight headers still answers 200.
pub async fn stream_options() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("3600"),
        )],
    )
}
