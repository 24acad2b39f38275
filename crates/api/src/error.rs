use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use docq_core::error::CoreError;
use docq_scheduler::SchedulerError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] and [`SchedulerError`] for domain errors and adds
/// HTTP-specific variants. Implements [`IntoResponse`] to produce
/// consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `docq_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An error from the scheduler.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The upload exceeded the configured body limit.
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- Domain errors ---
            AppError::Core(core) => classify_core_error(core),
            AppError::Scheduler(err) => classify_scheduler_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg.clone())
            }
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core_error(err: &CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            internal()
        }
    }
}

/// Classify a scheduler error into an HTTP status, error code, and message.
///
/// - Domain errors map as [`CoreError`] does.
/// - A job that is not `done` yet maps to 409.
/// - Shutdown maps to 503.
/// - Storage failures map to 500 with a sanitized message.
fn classify_scheduler_error(err: &SchedulerError) -> (StatusCode, &'static str, String) {
    match err {
        SchedulerError::Core(core) => classify_core_error(core),
        SchedulerError::NotReady(_) => (StatusCode::CONFLICT, "CONFLICT", err.to_string()),
        SchedulerError::ShuttingDown => (
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            err.to_string(),
        ),
        SchedulerError::Workspace(_) | SchedulerError::Output { .. } => {
            tracing::error!(error = %err, "Scheduler storage error");
            internal()
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
