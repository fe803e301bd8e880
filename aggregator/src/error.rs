use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// The taxonomy of failures the aggregator can produce, re-architected from
/// "catch whatever the store throws" into named variants with a fixed
/// mapping to HTTP status codes.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("the store could not complete the operation, please retry: {0}")]
    Transient(String),

    #[error("the store is unavailable: {0}")]
    Fatal(String),

    #[error("the event queue is unavailable: {0}")]
    QueueUnavailable(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient_store_error"),
            AppError::Fatal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "fatal_store_error"),
            AppError::QueueUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable")
            }
        };

        tracing::error!(kind, detail = %self, "request failed");

        (
            status,
            Json(ErrorBody {
                error: kind,
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}
