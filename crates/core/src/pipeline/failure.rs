//! Tagged failure value returned by a pipeline run.
//!
//! Replaces exception introspection: the runner reports *what* went wrong as
//! a [`FailureKind`] plus free-form detail and whatever output the process
//! produced, and the classifier in [`crate::error_codes`] maps that value to
//! a user-facing [`ErrorCode`](crate::error_codes::ErrorCode).

use std::io;

use crate::error_codes::ErrorCode;

/// What kind of failure ended a pipeline attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The wall-clock deadline expired and the process was killed.
    Timeout { elapsed_secs: u64 },
    /// The process exited with a non-zero code (`-1` when killed by a signal).
    NonZeroExit { exit_code: i32 },
    /// Exit code 0, but none of the expected artifacts were written.
    MissingArtifacts,
    /// The process could not be started.
    Spawn(io::ErrorKind),
    /// Filesystem work around the process failed (output dir, packaging).
    Io(io::ErrorKind),
    /// The job-specific pipeline configuration could not be produced.
    Config,
}

/// A failed pipeline attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{detail}")]
pub struct PipelineFailure {
    pub kind: FailureKind,
    pub detail: String,
    /// Captured stderr followed by stdout, if the process produced any.
    pub output: Option<String>,
}

impl PipelineFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        let output = output.into();
        self.output = if output.trim().is_empty() {
            None
        } else {
            Some(output)
        };
        self
    }

    pub fn timeout(elapsed_secs: u64, limit_secs: u64) -> Self {
        Self::new(
            FailureKind::Timeout { elapsed_secs },
            format!("Pipeline exceeded {limit_secs}s timeout"),
        )
    }

    pub fn spawn(err: &io::Error) -> Self {
        Self::new(
            FailureKind::Spawn(err.kind()),
            format!("Failed to start pipeline: {err}"),
        )
    }

    pub fn io(context: &str, err: &io::Error) -> Self {
        Self::new(FailureKind::Io(err.kind()), format!("{context}: {err}"))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout { .. })
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Only transient infrastructure problems qualify: accelerator memory
    /// exhaustion and failures to start or feed the process. Timeouts are
    /// retried only when `retry_timeouts` is set. Anything rooted in the
    /// input (format, DICOM, missing file, segmentation quality) is final.
    pub fn is_retryable(&self, code: ErrorCode, retry_timeouts: bool) -> bool {
        match (self.kind, code) {
            (_, ErrorCode::GpuOom) => true,
            (FailureKind::Timeout { .. }, _) => retry_timeouts,
            (FailureKind::Spawn(_) | FailureKind::Io(_), ErrorCode::PipelineError) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
