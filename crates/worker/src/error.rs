//! Worker error types: HTTP error mapping and startup failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::DomainError;
use pipeline::PipelineError;
use store::StoreError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Pipeline or store failure.
    Pipeline(PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Pipeline(err) => pipeline_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn pipeline_error_to_response(err: PipelineError) -> (StatusCode, String) {
    match &err {
        PipelineError::Store(StoreError::NotFound { .. }) => (StatusCode::NOT_FOUND, err.to_string()),
        PipelineError::Store(StoreError::Domain(DomainError::InvalidTransition { .. })) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        e if e.is_transient() => {
            tracing::warn!(error = %err, "transient failure while serving request");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "internal server error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

/// Failures while wiring the worker together.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] DomainError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
