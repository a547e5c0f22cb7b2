use axum::extract::State;
use axum::Json;
use chrono::Utc;
use kneepipe_core::stats::{uptime_hours, StatsSnapshot};

use crate::error::AppResult;
use crate::state::AppState;

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<AppState>) -> AppResult<Json<StatsSnapshot>> {
    let now = Utc::now();
    let stats = &state.stores.stats;

    let average = state.stores.wait_estimator().average_duration().await?;

    Ok(Json(StatsSnapshot {
        total_jobs_processed: stats.processed_total().await?,
        total_jobs_today: stats.processed_on(now.date_naive()).await?,
        unique_users: stats.unique_emails().await?,
        average_processing_time_seconds: (average * 10.0).round() / 10.0,
        jobs_in_queue: state.stores.queue.length().await?,
        uptime_hours: uptime_hours(stats.startup_time().await?, now),
    }))
}
