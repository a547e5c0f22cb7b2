//! Repository for the `job_queue` table.
//!
//! Ordering everywhere is `(score, job_id)` ascending.

use kneepipe_core::types::JobId;
use sqlx::PgPool;

/// Provides the FIFO queue index.
pub struct QueueRepo;

impl QueueRepo {
    /// Insert or re-score an entry.
    pub async fn upsert(pool: &PgPool, job_id: JobId, score: f64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO job_queue (job_id, score) VALUES ($1, $2) \
             ON CONFLICT (job_id) DO UPDATE SET score = EXCLUDED.score",
        )
        .bind(job_id)
        .bind(score)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// 1-based rank, or 0 when the job is not queued.
    pub async fn rank(pool: &PgPool, job_id: JobId) -> Result<i64, sqlx::Error> {
        let (rank,): (i64,) = sqlx::query_as(
            "SELECT COUNT(q.job_id) \
             FROM job_queue me \
             JOIN job_queue q ON (q.score, q.job_id) <= (me.score, me.job_id) \
             WHERE me.job_id = $1",
        )
        .bind(job_id)
        .fetch_one(pool)
        .await?;
        Ok(rank)
    }

    pub async fn remove(pool: &PgPool, job_id: JobId) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM job_queue WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_queue")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }

    /// Atomically pop the front entry.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent claimers never receive
    /// the same job.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<JobId>, sqlx::Error> {
        let row: Option<(JobId,)> = sqlx::query_as(
            "DELETE FROM job_queue \
             WHERE job_id = ( \
                 SELECT job_id FROM job_queue \
                 ORDER BY score ASC, job_id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING job_id",
        )
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }
}
