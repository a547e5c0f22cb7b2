//! In-process store used by tests and single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use kneepipe_core::error::CoreError;
use kneepipe_core::estimation::HISTORY_LIMIT;
use kneepipe_core::job::Job;
use kneepipe_core::types::{JobId, Timestamp};
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::error::StoreError;
use crate::store::{
    queue_score, DurationHistory, JobStore, ProcessingSlot, QueueIndex, SlotLease, StatsStore,
};

#[derive(Default)]
struct Counters {
    total: u64,
    daily: HashMap<NaiveDate, u64>,
    emails: HashSet<String>,
    startup: Option<Timestamp>,
}

/// Every store trait backed by plain collections behind tokio locks.
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    queue: Mutex<HashMap<JobId, f64>>,
    durations: Mutex<VecDeque<f64>>,
    counters: Mutex<Counters>,
    /// One permit: the processing slot.
    slot: Arc<Semaphore>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::default(),
            queue: Mutex::default(),
            durations: Mutex::default(),
            counters: Mutex::default(),
            slot: Arc::new(Semaphore::new(1)),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Entries ordered by `(score, id)`.
fn ordered(queue: &HashMap<JobId, f64>) -> Vec<(f64, JobId)> {
    let mut entries: Vec<_> = queue.iter().map(|(id, score)| (*score, *id)).collect();
    entries.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    entries
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(CoreError::Conflict(format!("Job {} already exists", job.id)).into());
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(CoreError::JobNotFound(job.id).into()),
        }
    }
}

#[async_trait]
impl QueueIndex for MemoryStore {
    async fn enqueue(&self, id: JobId, at: Timestamp) -> Result<(), StoreError> {
        self.queue.lock().await.insert(id, queue_score(at));
        Ok(())
    }

    async fn rank(&self, id: JobId) -> Result<u64, StoreError> {
        let queue = self.queue.lock().await;
        if !queue.contains_key(&id) {
            return Ok(0);
        }
        let position = ordered(&queue)
            .iter()
            .position(|(_, queued)| *queued == id)
            .map_or(0, |i| i as u64 + 1);
        Ok(position)
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        self.queue.lock().await.remove(&id);
        Ok(())
    }

    async fn length(&self) -> Result<u64, StoreError> {
        Ok(self.queue.lock().await.len() as u64)
    }

    async fn claim_next(&self) -> Result<Option<JobId>, StoreError> {
        let mut queue = self.queue.lock().await;
        let front = ordered(&queue).first().map(|(_, id)| *id);
        if let Some(id) = front {
            queue.remove(&id);
        }
        Ok(front)
    }
}

#[async_trait]
impl DurationHistory for MemoryStore {
    async fn push(&self, seconds: f64) -> Result<(), StoreError> {
        let mut durations = self.durations.lock().await;
        durations.push_front(seconds);
        durations.truncate(HISTORY_LIMIT);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<f64>, StoreError> {
        let durations = self.durations.lock().await;
        Ok(durations.iter().take(limit).copied().collect())
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn increment_processed(&self, day: NaiveDate) -> Result<(), StoreError> {
        let mut counters = self.counters.lock().await;
        counters.total += 1;
        *counters.daily.entry(day).or_default() += 1;
        Ok(())
    }

    async fn processed_total(&self) -> Result<u64, StoreError> {
        Ok(self.counters.lock().await.total)
    }

    async fn processed_on(&self, day: NaiveDate) -> Result<u64, StoreError> {
        Ok(self
            .counters
            .lock()
            .await
            .daily
            .get(&day)
            .copied()
            .unwrap_or(0))
    }

    async fn track_email(&self, email_key: &str) -> Result<(), StoreError> {
        self.counters
            .lock()
            .await
            .emails
            .insert(email_key.to_string());
        Ok(())
    }

    async fn unique_emails(&self) -> Result<u64, StoreError> {
        Ok(self.counters.lock().await.emails.len() as u64)
    }

    async fn startup_time(&self) -> Result<Timestamp, StoreError> {
        let mut counters = self.counters.lock().await;
        Ok(*counters.startup.get_or_insert_with(Utc::now))
    }
}

#[async_trait]
impl ProcessingSlot for MemoryStore {
    async fn try_acquire(&self) -> Result<Option<SlotLease>, StoreError> {
        Ok(self.slot.clone().try_acquire_owned().ok().map(SlotLease::new))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Duration;
    use kneepipe_core::job::NewJob;
    use kneepipe_core::options::JobOptions;
    use uuid::Uuid;

    use super::*;

    fn job() -> Job {
        Job::new(
            NewJob {
                id: Uuid::new_v4(),
                input_filename: "knee.nrrd".into(),
                input_path: "/tmp/knee.nrrd".into(),
                options: JobOptions::default(),
                retain_for_research: true,
                email: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_get_update() {
        let store = MemoryStore::new();
        let mut record = job();
        store.create(&record).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap(), record);

        record.start(Utc::now()).unwrap();
        store.update(&record).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap().started_at, record.started_at);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = MemoryStore::new();
        let record = job();
        store.create(&record).await.unwrap();
        assert_matches!(
            store.create(&record).await,
            Err(StoreError::Core(CoreError::Conflict(_)))
        );
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(store.find(id).await.unwrap().is_none());
        assert_matches!(
            store.get(id).await,
            Err(StoreError::Core(CoreError::JobNotFound(missing))) if missing == id
        );
        assert_matches!(
            store.update(&job()).await,
            Err(StoreError::Core(CoreError::JobNotFound(_)))
        );
    }

    #[tokio::test]
    async fn ranks_follow_enqueue_order() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.enqueue(a, t0).await.unwrap();
        store.enqueue(b, t0 + Duration::seconds(1)).await.unwrap();
        store.enqueue(c, t0 + Duration::seconds(2)).await.unwrap();

        assert_eq!(store.rank(a).await.unwrap(), 1);
        assert_eq!(store.rank(b).await.unwrap(), 2);
        assert_eq!(store.rank(c).await.unwrap(), 3);
        assert_eq!(store.length().await.unwrap(), 3);

        store.remove(a).await.unwrap();
        assert_eq!(store.rank(a).await.unwrap(), 0);
        assert_eq!(store.rank(b).await.unwrap(), 1);
        assert_eq!(store.rank(c).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn equal_scores_break_ties_by_id() {
        let store = MemoryStore::new();
        let t = Utc::now();
        let mut ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for id in ids {
            store.enqueue(id, t).await.unwrap();
        }
        ids.sort();
        for _ in 0..3 {
            for (i, id) in ids.iter().enumerate() {
                assert_eq!(store.rank(*id).await.unwrap(), i as u64 + 1);
            }
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.enqueue(id, Utc::now()).await.unwrap();
        store.remove(id).await.unwrap();
        store.remove(id).await.unwrap();
        assert_eq!(store.length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reenqueue_moves_entry() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.enqueue(a, t0).await.unwrap();
        store.enqueue(b, t0 + Duration::seconds(1)).await.unwrap();
        store.enqueue(a, t0 + Duration::seconds(2)).await.unwrap();
        assert_eq!(store.length().await.unwrap(), 2);
        assert_eq!(store.rank(a).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn claim_takes_front() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.enqueue(b, t0 + Duration::seconds(1)).await.unwrap();
        store.enqueue(a, t0).await.unwrap();

        assert_eq!(store.claim_next().await.unwrap(), Some(a));
        assert_eq!(store.rank(b).await.unwrap(), 1);
        assert_eq!(store.claim_next().await.unwrap(), Some(b));
        assert_eq!(store.claim_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn history_keeps_newest_twenty() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.push(i as f64).await.unwrap();
        }
        let recent = store.recent(100).await.unwrap();
        assert_eq!(recent.len(), HISTORY_LIMIT);
        assert_eq!(recent[0], 24.0);
        assert_eq!(recent[HISTORY_LIMIT - 1], 5.0);
    }

    #[tokio::test]
    async fn stats_counters() {
        let store = MemoryStore::new();
        let today = Utc::now().date_naive();
        let yesterday = today.pred_opt().unwrap();

        store.increment_processed(today).await.unwrap();
        store.increment_processed(today).await.unwrap();
        store.increment_processed(yesterday).await.unwrap();
        assert_eq!(store.processed_total().await.unwrap(), 3);
        assert_eq!(store.processed_on(today).await.unwrap(), 2);
        assert_eq!(store.processed_on(yesterday).await.unwrap(), 1);

        store.track_email("abc").await.unwrap();
        store.track_email("abc").await.unwrap();
        store.track_email("def").await.unwrap();
        assert_eq!(store.unique_emails().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn startup_time_is_stable() {
        let store = MemoryStore::new();
        let first = store.startup_time().await.unwrap();
        let second = store.startup_time().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn processing_slot_is_exclusive_until_released() {
        let store = MemoryStore::new();

        let lease = store.try_acquire().await.unwrap();
        assert!(lease.is_some());
        assert!(store.try_acquire().await.unwrap().is_none());

        drop(lease);
        assert!(store.try_acquire().await.unwrap().is_some());
    }
}
