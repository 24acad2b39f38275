#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Deliberately carries no detail: unknown, malformed, and reclaimed job
    /// ids must be indistinguishable to callers.
    #[error("Job not found")]
    NotFound,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
