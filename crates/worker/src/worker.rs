//! Background worker loop.
//!
//! Polls the queue every `poll_interval` and runs claimed jobs one at a
//! time. A worker only claims while it holds the backend's
//! [`ProcessingSlot`], so a second worker on the same backend (the API's
//! embedded one next to a standalone `kneepipe-worker`) waits its turn
//! instead of running a job alongside.
//!
//! [`ProcessingSlot`]: kneepipe_db::ProcessingSlot

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::orchestrator::JobOrchestrator;

/// Single-job-at-a-time queue consumer.
pub struct Worker {
    orchestrator: Arc<JobOrchestrator>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(orchestrator: Arc<JobOrchestrator>, poll_interval: Duration) -> Self {
        Self {
            orchestrator,
            poll_interval,
        }
    }

    /// Run until `cancel` fires. A job in flight is finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.drain_queue(&cancel).await;
                }
            }
        }
    }

    /// Run queued jobs back to back until the queue is empty.
    async fn drain_queue(&self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            match self.orchestrator.process_next().await {
                Ok(Some(job)) => {
                    tracing::debug!(job_id = %job.id, status = %job.status, "Worker finished job");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Worker cycle failed");
                    break;
                }
            }
        }
    }
}
