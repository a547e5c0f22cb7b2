//! Storage interfaces.
//!
//! Each concern gets its own trait so backends can be mixed and tests can
//! swap in the in-memory implementation. Every implementation is internally
//! synchronized and copies records in and out whole.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use kneepipe_core::error::CoreError;
use kneepipe_core::job::Job;
use kneepipe_core::types::{JobId, Timestamp};

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::postgres::PgStore;
use crate::wait::WaitEstimator;
use crate::DbPool;

/// Job records keyed by id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with a conflict if the id is taken.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn find(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Overwrite an existing record.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.find(id)
            .await?
            .ok_or(StoreError::Core(CoreError::JobNotFound(id)))
    }
}

/// FIFO index of queued jobs.
///
/// Ordered by ascending score, ties broken by job id.
#[async_trait]
pub trait QueueIndex: Send + Sync {
    /// Insert `id`, or move it if already present.
    async fn enqueue(&self, id: JobId, at: Timestamp) -> Result<(), StoreError>;

    /// 1-based position of `id`; 0 when not queued.
    async fn rank(&self, id: JobId) -> Result<u64, StoreError>;

    /// Idempotent.
    async fn remove(&self, id: JobId) -> Result<(), StoreError>;

    async fn length(&self) -> Result<u64, StoreError>;

    /// Atomically remove and return the front entry.
    async fn claim_next(&self) -> Result<Option<JobId>, StoreError>;
}

/// Rolling history of completed-job durations.
#[async_trait]
pub trait DurationHistory: Send + Sync {
    async fn push(&self, seconds: f64) -> Result<(), StoreError>;

    /// Up to `limit` durations, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<f64>, StoreError>;
}

/// Usage counters.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Bump the all-time counter and the counter for `day`.
    async fn increment_processed(&self, day: NaiveDate) -> Result<(), StoreError>;

    async fn processed_total(&self) -> Result<u64, StoreError>;

    async fn processed_on(&self, day: NaiveDate) -> Result<u64, StoreError>;

    /// Record a submitter by hashed email key.
    async fn track_email(&self, email_key: &str) -> Result<(), StoreError>;

    async fn unique_emails(&self) -> Result<u64, StoreError>;

    /// Set on first call, stable afterwards.
    async fn startup_time(&self) -> Result<Timestamp, StoreError>;
}

/// The single processing slot of a backend.
///
/// At most one job may be `processing` at any instant, across every worker
/// sharing the backend. Workers take the slot before claiming from the
/// queue and hold it until the job reaches a terminal state.
#[async_trait]
pub trait ProcessingSlot: Send + Sync {
    /// Take the slot, or `None` while another worker holds it.
    async fn try_acquire(&self) -> Result<Option<SlotLease>, StoreError>;
}

/// Proof of holding the processing slot. Dropping it frees the slot.
#[must_use = "the slot is released as soon as the lease is dropped"]
pub struct SlotLease {
    _held: Box<dyn Send>,
}

impl SlotLease {
    /// Wrap whatever keeps the slot held; the slot is freed when `held` drops.
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

/// Queue score for an enqueue timestamp: fractional seconds since the epoch.
pub fn queue_score(at: Timestamp) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One handle per storage concern, shared by the API and the worker.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn QueueIndex>,
    pub durations: Arc<dyn DurationHistory>,
    pub stats: Arc<dyn StatsStore>,
    pub slot: Arc<dyn ProcessingSlot>,
    pool: Option<DbPool>,
}

impl Stores {
    /// Everything in process memory.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            jobs: store.clone(),
            queue: store.clone(),
            durations: store.clone(),
            stats: store.clone(),
            slot: store,
            pool: None,
        }
    }

    /// Everything in Postgres.
    pub fn postgres(pool: DbPool) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        Self {
            jobs: store.clone(),
            queue: store.clone(),
            durations: store.clone(),
            stats: store.clone(),
            slot: store,
            pool: Some(pool),
        }
    }

    pub fn wait_estimator(&self) -> WaitEstimator {
        WaitEstimator::new(self.durations.clone())
    }

    /// Backend name reported by the health endpoint.
    pub fn backend(&self) -> &'static str {
        if self.pool.is_some() {
            "postgres"
        } else {
            "memory"
        }
    }

    /// Verify the backend is reachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        match &self.pool {
            Some(pool) => crate::health_check(pool).await.map_err(StoreError::from),
            None => Ok(()),
        }
    }
}
