use docq_core::error::CoreError;
use docq_core::job::JobStatus;
use docq_core::workspace::WorkspaceError;

/// Errors surfaced by [`Scheduler`](crate::Scheduler) operations.
///
/// Failures inside a running job never appear here; they end up on the
/// job record as `status = error`.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Job is not ready for download (status: {0})")]
    NotReady(JobStatus),

    #[error("Failed to stage workspace: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Failed to read output {name}: {source}")]
    Output {
        name: String,
        source: std::io::Error,
    },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    pub fn not_found() -> Self {
        SchedulerError::Core(CoreError::NotFound)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::Core(CoreError::NotFound))
    }
}
