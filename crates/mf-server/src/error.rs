//! Error-to-HTTP response conversion.
//!
//! Implements `IntoResponse` for [`mf_core::Error`] so that route handlers
//! can return `Result<T, AppError>` and use `?` on core results.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: mf_core::Error,
}

impl AppError {
    pub fn new(inner: mf_core::Error) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &mf_core::Error {
        &self.inner
    }
}

impl From<mf_core::Error> for AppError {
    fn from(e: mf_core::Error) -> Self {
        Self::new(e)
    }
}

impl From<mf_core::TranscodeError> for AppError {
    fn from(e: mf_core::TranscodeError) -> Self {
        Self::new(e.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        // Path escapes are reported exactly like a missing file.
        let message = match &self.inner {
            mf_core::Error::PathSecurity(_) => "file not found".to_string(),
            other => other.to_string(),
        };

        let body = json!({
            "error": message,
            "code": self.inner.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
