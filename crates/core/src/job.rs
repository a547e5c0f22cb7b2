//! Job record and its state machine.
//!
//! `queued -> processing -> {complete, error}`. Terminal states never change.
//! Every transition method checks the current status and returns
//! [`CoreError::Conflict`] when called out of order, so a store can never
//! hold a record that skipped a state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::error_codes::ErrorCode;
use crate::options::JobOptions;
use crate::progress::{ProgressUpdate, TOTAL_STEPS};
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Input for creating a job. Everything here is immutable afterwards.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub input_filename: String,
    pub input_path: String,
    pub options: JobOptions,
    pub retain_for_research: bool,
    pub email: Option<String>,
}

/// Persisted state of one processing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_filename: String,
    pub input_path: String,
    pub options: JobOptions,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub progress_percent: u8,
    pub current_step: u32,
    pub total_steps: u32,
    pub step_name: Option<String>,
    pub result_path: Option<String>,
    pub result_size_bytes: Option<u64>,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub retain_for_research: bool,
    pub email: Option<String>,
}

impl Job {
    /// Build a freshly queued job.
    pub fn new(new: NewJob, now: Timestamp) -> Self {
        Self {
            id: new.id,
            input_filename: new.input_filename,
            input_path: new.input_path,
            options: new.options,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            progress_percent: 0,
            current_step: 0,
            total_steps: TOTAL_STEPS,
            step_name: None,
            result_path: None,
            result_size_bytes: None,
            error_message: None,
            error_code: None,
            retain_for_research: new.retain_for_research,
            email: new.email,
        }
    }

    /// `queued -> processing`.
    pub fn start(&mut self, now: Timestamp) -> Result<(), CoreError> {
        self.expect_status(JobStatus::Queued, "start")?;
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// Overwrite the progress fields while processing.
    ///
    /// The stored percentage never decreases. Returns whether anything
    /// visible changed, so callers can skip redundant writes.
    pub fn apply_progress(&mut self, update: &ProgressUpdate) -> Result<bool, CoreError> {
        self.expect_status(JobStatus::Processing, "update progress of")?;

        let percent = self.progress_percent.max(update.percent.min(100));
        let step = update.step.min(update.total_steps);
        let changed = percent != self.progress_percent
            || step != self.current_step
            || update.total_steps != self.total_steps
            || self.step_name.as_deref() != Some(update.step_name.as_str());

        self.progress_percent = percent;
        self.current_step = step;
        self.total_steps = update.total_steps;
        self.step_name = Some(update.step_name.clone());
        Ok(changed)
    }

    /// `processing -> complete`.
    pub fn complete(
        &mut self,
        result_path: String,
        result_size_bytes: u64,
        now: Timestamp,
    ) -> Result<(), CoreError> {
        self.expect_status(JobStatus::Processing, "complete")?;
        self.status = JobStatus::Complete;
        self.completed_at = Some(now);
        self.result_path = Some(result_path);
        self.result_size_bytes = Some(result_size_bytes);
        self.progress_percent = 100;
        self.current_step = self.total_steps;
        self.step_name = Some("Complete".to_string());
        Ok(())
    }

    /// `processing -> error`, storing the code and its user-facing message.
    pub fn fail(&mut self, code: ErrorCode, now: Timestamp) -> Result<(), CoreError> {
        self.expect_status(JobStatus::Processing, "fail")?;
        self.status = JobStatus::Error;
        self.completed_at = Some(now);
        self.error_code = Some(code);
        self.error_message = Some(code.user_message());
        Ok(())
    }

    /// Seconds spent processing so far (or in total once finished).
    pub fn elapsed_seconds(&self, now: Timestamp) -> f64 {
        match self.started_at {
            Some(started) => {
                let end = self.completed_at.unwrap_or(now);
                (end - started).num_milliseconds().max(0) as f64 / 1000.0
            }
            None => 0.0,
        }
    }

    /// Wall-clock processing time of a finished job.
    pub fn processing_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as f64 / 1000.0)
    }

    fn expect_status(&self, expected: JobStatus, action: &str) -> Result<(), CoreError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(CoreError::Conflict(format!(
                "Cannot {action} job {} in status '{}'",
                self.id, self.status
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
