//! User-facing pipeline error codes and the classifier that assigns them.
//!
//! The set of codes is closed: every failure after job creation ends up as
//! exactly one [`ErrorCode`], with [`ErrorCode::PipelineError`] as the
//! fallback. Two entry points exist because two kinds of evidence exist:
//! the text a failed process printed ([`classify_output`]) and the tagged
//! failure value produced by the runner ([`classify_failure`]).
//! [`classify`] combines them, preferring output evidence.

use std::fmt;
use std::io;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::pipeline::failure::{FailureKind, PipelineFailure};

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable error category stored on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    GpuOom,
    Timeout,
    InvalidFormat,
    FileNotFound,
    DicomError,
    SegmentationFailed,
    NsmFailed,
    ConfigError,
    PipelineError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        Self::GpuOom,
        Self::Timeout,
        Self::InvalidFormat,
        Self::FileNotFound,
        Self::DicomError,
        Self::SegmentationFailed,
        Self::NsmFailed,
        Self::ConfigError,
        Self::PipelineError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GpuOom => "GPU_OOM",
            Self::Timeout => "TIMEOUT",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::DicomError => "DICOM_ERROR",
            Self::SegmentationFailed => "SEGMENTATION_FAILED",
            Self::NsmFailed => "NSM_FAILED",
            Self::ConfigError => "CONFIG_ERROR",
            Self::PipelineError => "PIPELINE_ERROR",
        }
    }

    /// Parse a stored code. Unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Short description of what went wrong.
    pub fn message(self) -> &'static str {
        match self {
            Self::GpuOom => "The GPU ran out of memory while processing your file.",
            Self::Timeout => "Processing took longer than expected and was stopped.",
            Self::InvalidFormat => "The uploaded file format is not supported.",
            Self::FileNotFound => "The uploaded file could not be found.",
            Self::DicomError => "The DICOM files could not be read properly.",
            Self::SegmentationFailed => "The segmentation step failed to complete.",
            Self::NsmFailed => "Neural Shape Model analysis failed.",
            Self::ConfigError => "There was an error with the processing configuration.",
            Self::PipelineError => "An unexpected error occurred during processing.",
        }
    }

    /// What the submitter can do about it.
    pub fn recovery_hint(self) -> &'static str {
        match self {
            Self::GpuOom => {
                "Try reducing the batch size, using a different segmentation model, \
                 or processing a smaller image."
            }
            Self::Timeout => {
                "Your file may be very large. Try processing a smaller region or contact support."
            }
            Self::InvalidFormat => {
                "Please upload a NIfTI (.nii, .nii.gz), NRRD (.nrrd), or DICOM zip file."
            }
            Self::FileNotFound => "Please try uploading the file again.",
            Self::DicomError => {
                "Ensure the zip contains a valid DICOM series. Try converting to NIfTI format."
            }
            Self::SegmentationFailed => {
                "The image quality may be insufficient. Try a different segmentation model."
            }
            Self::NsmFailed => "Try running without NSM, or use bone-only analysis instead.",
            Self::ConfigError => "Please try again with default settings or contact support.",
            Self::PipelineError => {
                "Please try again. If the problem persists, contact support."
            }
        }
    }

    /// Message stored on the job: description followed by the recovery hint.
    pub fn user_message(self) -> String {
        format!("{} {}", self.message(), self.recovery_hint())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Output classification
// ---------------------------------------------------------------------------

/// Phrase groups checked against process output, highest priority first.
static OUTPUT_RULES: LazyLock<Vec<(Regex, ErrorCode)>> = LazyLock::new(|| {
    [
        (
            r"cuda out of memory|out of memory|cuda error|cudnn error|gpu memory|\boom\b",
            ErrorCode::GpuOom,
        ),
        (r"timeout|timed out", ErrorCode::Timeout),
        (r"not found|does not exist|no such file", ErrorCode::FileNotFound),
        (
            r"invalid format|cannot read|unsupported format|not a valid",
            ErrorCode::InvalidFormat,
        ),
        (r"dicom|dcm error", ErrorCode::DicomError),
        (
            r"segmentation failed|segmentation error|no segmentation",
            ErrorCode::SegmentationFailed,
        ),
        (
            r"nsm error|nsm failed|shape model|bscore error",
            ErrorCode::NsmFailed,
        ),
        (r"config error|invalid config|missing config", ErrorCode::ConfigError),
    ]
    .into_iter()
    .map(|(pattern, code)| {
        let re = Regex::new(&format!("(?i){pattern}")).expect("valid regex");
        (re, code)
    })
    .collect()
});

/// Classify a failure from the text the pipeline printed.
///
/// Never fails: text matching no phrase group is a
/// [`ErrorCode::PipelineError`].
pub fn classify_output(text: &str) -> ErrorCode {
    OUTPUT_RULES
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, code)| *code)
        .unwrap_or(ErrorCode::PipelineError)
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Classify a failure from the runner's tagged value alone.
///
/// Used when no output is available. The rule set is deliberately smaller
/// than [`classify_output`] and can disagree with it.
pub fn classify_failure(failure: &PipelineFailure) -> ErrorCode {
    let detail = failure.detail.to_lowercase();

    match failure.kind {
        FailureKind::Timeout { .. } => return ErrorCode::Timeout,
        FailureKind::Config => return ErrorCode::ConfigError,
        FailureKind::Spawn(io::ErrorKind::NotFound) | FailureKind::Io(io::ErrorKind::NotFound) => {
            return ErrorCode::FileNotFound
        }
        _ => {}
    }

    if detail.contains("timeout") {
        ErrorCode::Timeout
    } else if detail.contains("memory") || detail.contains("oom") {
        ErrorCode::GpuOom
    } else if detail.contains("not found") {
        ErrorCode::FileNotFound
    } else if detail.contains("format") || detail.contains("read") {
        ErrorCode::InvalidFormat
    } else {
        ErrorCode::PipelineError
    }
}

/// Classify a failed attempt using every piece of evidence available.
///
/// Output wins whenever it names a specific category; when the output is
/// absent or only yields the generic fallback, the tagged failure decides.
pub fn classify(failure: &PipelineFailure) -> ErrorCode {
    if let Some(output) = failure.output.as_deref() {
        let code = classify_output(output);
        if code != ErrorCode::PipelineError {
            return code;
        }
    }
    classify_failure(failure)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
