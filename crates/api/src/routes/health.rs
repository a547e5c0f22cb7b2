use axum::extract::State;
use axum::{routing::get, Json, Router};
use chrono::Utc;
use kneepipe_core::types::Timestamp;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `healthy` when the store is reachable, `unhealthy` otherwise.
    pub status: &'static str,
    /// `connected` or `disconnected`.
    pub store: &'static str,
    /// Store backend in use (`memory` or `postgres`).
    pub backend: &'static str,
    /// `running` when this process runs the worker, `external` otherwise.
    pub worker: &'static str,
    pub timestamp: Timestamp,
}

/// GET /health -- returns service and store health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_healthy = match state.stores.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            false
        }
    };

    Json(HealthResponse {
        status: if store_healthy { "healthy" } else { "unhealthy" },
        store: if store_healthy { "connected" } else { "disconnected" },
        backend: state.stores.backend(),
        worker: if state.worker_enabled { "running" } else { "external" },
        timestamp: Utc::now(),
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
