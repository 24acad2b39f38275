//! Route definitions for the `/jobs` resource.

use axum::routing::get;
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// POST   /                -> submit_job
/// GET    /{id}            -> get_job
/// DELETE /{id}            -> delete_job
/// GET    /{id}/download   -> download_job
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", axum::routing::post(jobs::submit_job))
        .route("/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/{id}/download", get(jobs::download_job))
}
