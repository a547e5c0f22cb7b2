//! Postgres-backed implementation of the store traits.

use async_trait::async_trait;
use chrono::NaiveDate;
use kneepipe_core::error::CoreError;
use kneepipe_core::estimation::HISTORY_LIMIT;
use kneepipe_core::job::Job;
use kneepipe_core::types::{JobId, Timestamp};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

use crate::error::StoreError;
use crate::repositories::{DurationRepo, JobRepo, QueueRepo, SlotRepo, StatsRepo};
use crate::store::{
    queue_score, DurationHistory, JobStore, ProcessingSlot, QueueIndex, SlotLease, StatsStore,
};
use crate::DbPool;

/// Thin adapter from the store traits to the repositories.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn count(value: i64) -> u64 {
    value.max(0) as u64
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        if JobRepo::insert(&self.pool, job).await? {
            Ok(())
        } else {
            Err(CoreError::Conflict(format!("Job {} already exists", job.id)).into())
        }
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        JobRepo::find_by_id(&self.pool, id).await
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        if JobRepo::update(&self.pool, job).await? {
            Ok(())
        } else {
            Err(CoreError::JobNotFound(job.id).into())
        }
    }
}

#[async_trait]
impl QueueIndex for PgStore {
    async fn enqueue(&self, id: JobId, at: Timestamp) -> Result<(), StoreError> {
        Ok(QueueRepo::upsert(&self.pool, id, queue_score(at)).await?)
    }

    async fn rank(&self, id: JobId) -> Result<u64, StoreError> {
        Ok(count(QueueRepo::rank(&self.pool, id).await?))
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        Ok(QueueRepo::remove(&self.pool, id).await?)
    }

    async fn length(&self) -> Result<u64, StoreError> {
        Ok(count(QueueRepo::count(&self.pool).await?))
    }

    async fn claim_next(&self) -> Result<Option<JobId>, StoreError> {
        Ok(QueueRepo::claim_next(&self.pool).await?)
    }
}

#[async_trait]
impl DurationHistory for PgStore {
    async fn push(&self, seconds: f64) -> Result<(), StoreError> {
        Ok(DurationRepo::push(&self.pool, seconds, HISTORY_LIMIT as i64).await?)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<f64>, StoreError> {
        Ok(DurationRepo::recent(&self.pool, limit as i64).await?)
    }
}

#[async_trait]
impl StatsStore for PgStore {
    async fn increment_processed(&self, day: NaiveDate) -> Result<(), StoreError> {
        Ok(StatsRepo::increment_processed(&self.pool, day).await?)
    }

    async fn processed_total(&self) -> Result<u64, StoreError> {
        Ok(count(StatsRepo::total(&self.pool).await?))
    }

    async fn processed_on(&self, day: NaiveDate) -> Result<u64, StoreError> {
        Ok(count(StatsRepo::on_day(&self.pool, day).await?))
    }

    async fn track_email(&self, email_key: &str) -> Result<(), StoreError> {
        Ok(StatsRepo::track_email(&self.pool, email_key).await?)
    }

    async fn unique_emails(&self) -> Result<u64, StoreError> {
        Ok(count(StatsRepo::unique_emails(&self.pool).await?))
    }

    async fn startup_time(&self) -> Result<Timestamp, StoreError> {
        Ok(StatsRepo::startup_time(&self.pool).await?)
    }
}

#[async_trait]
impl ProcessingSlot for PgStore {
    async fn try_acquire(&self) -> Result<Option<SlotLease>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        if SlotRepo::try_lock(&mut conn).await? {
            Ok(Some(SlotLease::new(HeldSlot { conn: Some(conn) })))
        } else {
            Ok(None)
        }
    }
}

/// The pooled connection whose session holds the advisory lock.
struct HeldSlot {
    conn: Option<PoolConnection<Postgres>>,
}

impl Drop for HeldSlot {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Ending the session releases the lock.
            drop(conn.detach());
            return;
        };
        runtime.spawn(async move {
            match SlotRepo::unlock(&mut conn).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!("Processing slot was not held at release"),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to release processing slot, closing session");
                    drop(conn.detach());
                }
            }
        });
    }
}
