//! Job orchestration: submission, the processing state machine, and the
//! monitor loop around one pipeline run.
//!
//! A job moves `queued -> processing -> {complete, error}`. While
//! processing, the pipeline may be attempted several times (bounded retry
//! for transient failures); the job never returns to the queue. Resource
//! release runs after every attempt, whatever its outcome.
//!
//! Only one job processes at a time per backend: running a job requires the
//! store's [`ProcessingSlot`](kneepipe_db::ProcessingSlot), held from claim
//! to terminal state.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kneepipe_core::error::CoreError;
use kneepipe_core::error_codes::{classify, ErrorCode};
use kneepipe_core::job::{Job, JobStatus, NewJob};
use kneepipe_core::pipeline::config::write_job_config;
use kneepipe_core::pipeline::outputs::{package_results, verify_outputs};
use kneepipe_core::pipeline::process::{spawn_pipeline, OutputLine, OutputTail, RunningPipeline};
use kneepipe_core::pipeline::{
    FailureKind, JobLayout, PipelineArtifacts, PipelineFailure, PipelineInvocation,
};
use kneepipe_core::progress::{estimate_from_time, parse_progress_line, ProgressUpdate};
use kneepipe_core::stats::{email_key, normalize_email};
use kneepipe_core::types::JobId;
use kneepipe_core::upload::file_stem;
use kneepipe_db::{StoreError, Stores};
use tokio::time::MissedTickBehavior;

use crate::config::PipelineConfig;
use crate::releaser::ResourceReleaser;

/// How long to keep reading buffered output after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Delays before re-trying the write of a terminal job state.
const TERMINAL_WRITE_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Result of accepting a new job.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Job,
    pub queue_position: u64,
    pub estimated_wait_seconds: u64,
}

/// Drives jobs through their lifecycle.
pub struct JobOrchestrator {
    stores: Stores,
    config: Arc<PipelineConfig>,
    releaser: Arc<dyn ResourceReleaser>,
}

impl JobOrchestrator {
    pub fn new(
        stores: Stores,
        config: Arc<PipelineConfig>,
        releaser: Arc<dyn ResourceReleaser>,
    ) -> Self {
        Self {
            stores,
            config,
            releaser,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Create a queued job and report its place in line.
    pub async fn submit(&self, new: NewJob) -> Result<Submission, StoreError> {
        let now = Utc::now();
        let job = Job::new(new, now);

        self.stores.jobs.create(&job).await?;
        self.stores.queue.enqueue(job.id, now).await?;

        if let Some(email) = job.email.as_deref().and_then(normalize_email) {
            if let Err(e) = self.stores.stats.track_email(&email_key(&email)).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to record submitter");
            }
        }

        let queue_position = self.stores.queue.rank(job.id).await?;
        let estimated_wait_seconds = self
            .stores
            .wait_estimator()
            .estimate_wait(queue_position)
            .await?;

        tracing::info!(
            job_id = %job.id,
            queue_position,
            estimated_wait_seconds,
            model = %job.options.segmentation_model,
            "Job queued",
        );

        Ok(Submission {
            job,
            queue_position,
            estimated_wait_seconds,
        })
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// `queued -> processing`: stamp `started_at` and leave the queue.
    pub async fn start(&self, id: JobId) -> Result<Job, StoreError> {
        let mut job = self.stores.jobs.get(id).await?;
        job.start(Utc::now())?;
        self.stores.queue.remove(id).await?;
        self.stores.jobs.update(&job).await?;
        tracing::info!(job_id = %id, "Job processing started");
        Ok(job)
    }

    /// Claim the front of the queue and run it to a terminal state.
    ///
    /// Returns `None` when the queue is empty or another worker holds the
    /// processing slot.
    pub async fn process_next(&self) -> Result<Option<Job>, StoreError> {
        if self.stores.queue.length().await? == 0 {
            return Ok(None);
        }
        let Some(_slot) = self.stores.slot.try_acquire().await? else {
            tracing::debug!("Processing slot busy, leaving the queue alone");
            return Ok(None);
        };
        let Some(id) = self.stores.queue.claim_next().await? else {
            return Ok(None);
        };
        self.run_claimed(id).await.map(Some)
    }

    /// Run a queued job to completion or failure.
    ///
    /// Fails with a conflict while another job holds the processing slot.
    pub async fn run_job(&self, id: JobId) -> Result<Job, StoreError> {
        let Some(_slot) = self.stores.slot.try_acquire().await? else {
            return Err(CoreError::Conflict("Another job is already processing".into()).into());
        };
        self.run_claimed(id).await
    }

    /// Drive `id` through processing. The caller holds the slot.
    async fn run_claimed(&self, id: JobId) -> Result<Job, StoreError> {
        let mut job = match self.start(id).await {
            Ok(job) => job,
            Err(e) => {
                self.return_to_queue(id, &e).await;
                return Err(e);
            }
        };
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let result = self.run_attempt(&mut job).await;
            self.releaser.release().await;

            match result {
                Ok(artifacts) => return self.finish_success(job, artifacts).await,
                Err(failure) => {
                    let code = classify(&failure);
                    let retry = attempt < max_attempts
                        && failure.is_retryable(code, self.config.retry_timeouts);

                    if retry {
                        tracing::warn!(
                            job_id = %id,
                            attempt,
                            max_attempts,
                            error_code = %code,
                            error = %failure,
                            "Pipeline attempt failed, retrying",
                        );
                        attempt += 1;
                        continue;
                    }
                    return self.finish_failure(job, code, &failure).await;
                }
            }
        }
    }

    /// Put a claimed job back at its original place after `start` failed
    /// on the store. Domain errors (unknown job, wrong state) are final.
    async fn return_to_queue(&self, id: JobId, cause: &StoreError) {
        if matches!(cause, StoreError::Core(_)) {
            return;
        }
        let job = match self.stores.jobs.find(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(
                    job_id = %id,
                    error = %e,
                    cause = %cause,
                    "Failed to start job and to reload it; job will not run",
                );
                return;
            }
        };
        if job.status != JobStatus::Queued {
            return;
        }
        match self.stores.queue.enqueue(id, job.created_at).await {
            Ok(()) => tracing::error!(
                job_id = %id,
                error = %cause,
                "Failed to start job, returned it to the queue",
            ),
            Err(e) => tracing::error!(
                job_id = %id,
                error = %e,
                cause = %cause,
                "Failed to start job and to re-enqueue it; job will not run",
            ),
        }
    }

    /// Write a terminal state, re-trying transient store failures.
    async fn persist_terminal(&self, job: &Job) -> Result<(), StoreError> {
        for delay in TERMINAL_WRITE_DELAYS {
            match self.stores.jobs.update(job).await {
                Ok(()) => return Ok(()),
                Err(e @ StoreError::Core(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        status = %job.status,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to record final job state, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        // Final attempt after the last delay.
        self.stores.jobs.update(job).await
    }

    async fn finish_success(
        &self,
        mut job: Job,
        artifacts: PipelineArtifacts,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        job.complete(
            artifacts.archive_path.display().to_string(),
            artifacts.archive_size_bytes,
            now,
        )?;
        self.persist_terminal(&job).await?;

        if let Some(seconds) = job.processing_seconds() {
            if let Err(e) = self.stores.wait_estimator().record_duration(seconds).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to record duration");
            }
        }
        if let Err(e) = self.stores.stats.increment_processed(now.date_naive()).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to update counters");
        }

        tracing::info!(
            job_id = %job.id,
            result_size_bytes = artifacts.archive_size_bytes,
            processing_seconds = job.processing_seconds().unwrap_or_default(),
            "Job complete",
        );
        Ok(job)
    }

    async fn finish_failure(
        &self,
        mut job: Job,
        code: ErrorCode,
        failure: &PipelineFailure,
    ) -> Result<Job, StoreError> {
        job.fail(code, Utc::now())?;
        self.persist_terminal(&job).await?;
        tracing::error!(
            job_id = %job.id,
            error_code = %code,
            error = %failure,
            "Job failed",
        );
        Ok(job)
    }

    // -----------------------------------------------------------------------
    // One attempt
    // -----------------------------------------------------------------------

    async fn run_attempt(&self, job: &mut Job) -> Result<PipelineArtifacts, PipelineFailure> {
        let config = &self.config;
        let layout = JobLayout::new(&config.results_dir, job.id);
        let output_dir = layout.output_dir();

        write_job_config(&config.base_config, &layout.config_path(), &job.options).await?;
        reset_dir(&output_dir)
            .await
            .map_err(|e| PipelineFailure::io("Failed to prepare output directory", &e))?;

        let translator = &config.path_translator;
        let invocation = PipelineInvocation {
            program: config.program.clone(),
            script: config.script.clone(),
            pipeline_dir: config.pipeline_dir.clone(),
            input_path: translator.translate(Path::new(&job.input_path)),
            output_dir: translator.translate(&output_dir),
            model_name: job.options.segmentation_model.pipeline_model_name().to_string(),
            config_path: translator.translate(&layout.config_path()),
        };

        tracing::info!(
            job_id = %job.id,
            program = %invocation.program,
            input = %invocation.input_path.display(),
            model = %invocation.model_name,
            "Launching pipeline",
        );

        let running = spawn_pipeline(&mut invocation.command())
            .map_err(|e| PipelineFailure::spawn(&e))?;
        let tail = self.monitor(job, running).await?;

        let artifacts = blocking(move || verify_outputs(&output_dir)).await?;
        if artifacts.is_empty() {
            return Err(PipelineFailure::new(
                FailureKind::MissingArtifacts,
                "Pipeline completed but expected output files are missing",
            )
            .with_output(tail.render()));
        }

        let archive_path = layout.archive_path(file_stem(&job.input_filename));
        let src = layout.output_dir();
        let dest = archive_path.clone();
        let archive_size_bytes = blocking(move || package_results(&src, &dest)).await?;

        Ok(PipelineArtifacts {
            archive_path,
            archive_size_bytes,
        })
    }

    /// Watch a running pipeline until it exits or the deadline passes.
    ///
    /// Returns the output tail on a zero exit.
    async fn monitor(
        &self,
        job: &mut Job,
        mut running: RunningPipeline,
    ) -> Result<OutputTail, PipelineFailure> {
        let started = Instant::now();
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut progress = ProgressState::default();
        let mut lines_open = true;

        let status = loop {
            tokio::select! {
                _ = &mut deadline => {
                    if let Err(e) = running.kill().await {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to kill pipeline");
                    }
                    let elapsed = started.elapsed().as_secs();
                    tracing::error!(job_id = %job.id, elapsed_secs = elapsed, "Pipeline timed out");
                    return Err(PipelineFailure::timeout(elapsed, self.config.timeout.as_secs())
                        .with_output(progress.tail.render()));
                }
                status = running.child.wait() => {
                    break status;
                }
                line = running.lines.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(job, &mut progress, line).await,
                    None => lines_open = false,
                },
                _ = ticker.tick(), if !progress.explicit => {
                    let elapsed = started.elapsed().as_secs_f64();
                    let update = estimate_from_time(elapsed, self.config.expected_duration.as_secs_f64());
                    self.report(job, &mut progress, update).await;
                }
            }
        };

        // Output written just before exit may still be in flight.
        let drain = async {
            while let Some(line) = running.lines.recv().await {
                self.handle_line(job, &mut progress, line).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!(job_id = %job.id, "Stopped draining pipeline output");
        }

        let status = status.map_err(|e| PipelineFailure::io("Failed to wait for pipeline", &e))?;
        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            return Err(PipelineFailure::new(
                FailureKind::NonZeroExit { exit_code },
                format!("Pipeline exited with code {exit_code}"),
            )
            .with_output(progress.tail.render()));
        }
        Ok(progress.tail)
    }

    async fn handle_line(&self, job: &mut Job, progress: &mut ProgressState, line: OutputLine) {
        tracing::debug!(job_id = %job.id, stream = ?line.stream, line = %line.text, "pipeline");
        progress.tail.push(&line);
        if let Some(update) = parse_progress_line(&line.text) {
            progress.explicit = true;
            self.report(job, progress, update).await;
        }
    }

    /// Apply a progress reading, skipping repeats, and persist it.
    async fn report(&self, job: &mut Job, progress: &mut ProgressState, update: ProgressUpdate) {
        if progress.last.as_ref() == Some(&update) {
            return;
        }
        match job.apply_progress(&update) {
            Ok(true) => {
                if let Err(e) = self.stores.jobs.update(job).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to persist progress");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Progress rejected"),
        }
        progress.last = Some(update);
    }
}

/// Monitor-loop state for one attempt.
#[derive(Default)]
struct ProgressState {
    tail: OutputTail,
    last: Option<ProgressUpdate>,
    /// Set once the pipeline has reported progress itself.
    explicit: bool,
}

/// Remove stale output from a previous attempt and recreate the directory.
async fn reset_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, PipelineFailure>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PipelineFailure::io("Failed to process pipeline outputs", &e)),
        Err(e) => Err(PipelineFailure::new(
            FailureKind::Io(io::ErrorKind::Other),
            format!("Output processing task failed: {e}"),
        )),
    }
}
