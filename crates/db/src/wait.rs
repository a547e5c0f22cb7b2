//! Wait-time estimation over the shared duration history.

use std::sync::Arc;

use kneepipe_core::estimation::{self, HISTORY_LIMIT};

use crate::error::StoreError;
use crate::store::DurationHistory;

#[derive(Clone)]
pub struct WaitEstimator {
    history: Arc<dyn DurationHistory>,
}

impl WaitEstimator {
    pub fn new(history: Arc<dyn DurationHistory>) -> Self {
        Self { history }
    }

    /// Mean of the recent durations, 240s before any job has finished.
    pub async fn average_duration(&self) -> Result<f64, StoreError> {
        let recent = self.history.recent(HISTORY_LIMIT).await?;
        Ok(estimation::average_duration(&recent))
    }

    /// Seconds until a job at `position` finishes.
    pub async fn estimate_wait(&self, position: u64) -> Result<u64, StoreError> {
        if position == 0 {
            return Ok(0);
        }
        let average = self.average_duration().await?;
        Ok(estimation::estimate_wait(position, average))
    }

    pub async fn record_duration(&self, seconds: f64) -> Result<(), StoreError> {
        self.history.push(seconds.max(0.0)).await
    }
}
