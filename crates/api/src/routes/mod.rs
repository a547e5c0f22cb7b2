pub mod health;
pub mod jobs;

use axum::routing::get;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /upload                 POST multipart upload -> queued job
/// /status/{id}            GET job status
/// /download/{id}          GET results archive
/// /stats                  GET usage statistics
/// ```
///
/// `max_upload_bytes` bounds the upload body.
pub fn api_routes(max_upload_bytes: u64) -> Router<AppState> {
    Router::new()
        .merge(jobs::router(max_upload_bytes))
        .route("/stats", get(handlers::stats::get_stats))
}
