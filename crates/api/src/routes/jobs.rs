//! Job routes.
//!
//! ```text
//! POST   /upload              -> upload
//! GET    /status/{id}         -> get_status
//! GET    /download/{id}       -> download
//! ```

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::{jobs, upload};
use crate::state::AppState;

/// Room for the multipart envelope and text fields on top of the file.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

pub fn router(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes + MULTIPART_OVERHEAD_BYTES)
        .unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/upload",
            post(upload::upload)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(body_limit)),
        )
        .route("/status/{id}", get(jobs::get_status))
        .route("/download/{id}", get(jobs::download))
}
