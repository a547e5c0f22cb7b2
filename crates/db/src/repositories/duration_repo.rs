//! Repository for the `processing_times` table.

use sqlx::PgPool;

/// Provides the rolling duration history.
pub struct DurationRepo;

impl DurationRepo {
    /// Record a duration and drop everything older than the newest `keep`.
    pub async fn push(pool: &PgPool, seconds: f64, keep: i64) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query("INSERT INTO processing_times (duration_secs) VALUES ($1)")
            .bind(seconds)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM processing_times \
             WHERE id NOT IN ( \
                 SELECT id FROM processing_times ORDER BY id DESC LIMIT $1 \
             )",
        )
        .bind(keep)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Newest first.
    pub async fn recent(pool: &PgPool, limit: i64) -> Result<Vec<f64>, sqlx::Error> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            "SELECT duration_secs FROM processing_times ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }
}
