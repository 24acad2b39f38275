use std::sync::Arc;

use docq_scheduler::Scheduler;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: the scheduler is a handle and the config is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Admission-controlled job scheduler.
    pub scheduler: Scheduler,
    /// Server configuration (upload limits are read by handlers).
    pub config: Arc<ServerConfig>,
}
