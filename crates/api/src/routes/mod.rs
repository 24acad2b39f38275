pub mod health;
pub mod jobs;

use axum::routing::get;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /jobs                                            submit (multipart)
/// /jobs/{id}                                       status, cleanup
/// /jobs/{id}/download                              download outputs
///
/// /stats                                           admission snapshot
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/stats", get(handlers::jobs::queue_stats))
}
