//! External segmentation pipeline: how it is invoked, what it writes, and
//! how its failures are described.
//!
//! The pipeline itself is a black box. This module owns everything around
//! it: the per-job directory layout, the generated config file, the command
//! line, the spawned process with its output readers, and verification and
//! packaging of what it produced. The monitor loop that ties these together
//! lives in the worker crate.

pub mod config;
pub mod failure;
pub mod outputs;
pub mod paths;
pub mod process;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::types::JobId;

pub use failure::{FailureKind, PipelineFailure};

/// Name of the per-job directory the pipeline writes into.
const OUTPUT_SUBDIR: &str = "pipeline_output";

/// Name of the generated per-job config file.
const CONFIG_FILE: &str = "config.json";

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Filesystem layout of one job under the results root.
///
/// ```text
/// <results_dir>/<job_id>/config.json
/// <results_dir>/<job_id>/pipeline_output/...
/// <results_dir>/<job_id>/<stem>_results.zip
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    pub job_dir: PathBuf,
}

impl JobLayout {
    pub fn new(results_dir: &Path, job_id: JobId) -> Self {
        Self {
            job_dir: results_dir.join(job_id.to_string()),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.job_dir.join(CONFIG_FILE)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.job_dir.join(OUTPUT_SUBDIR)
    }

    pub fn archive_path(&self, stem: &str) -> PathBuf {
        self.job_dir.join(archive_name(stem))
    }
}

/// `<stem>_results.zip`
pub fn archive_name(stem: &str) -> String {
    format!("{stem}_results.zip")
}

/// Result of a successful pipeline attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineArtifacts {
    pub archive_path: PathBuf,
    pub archive_size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Command line and environment for one pipeline run.
///
/// Produces `program [script] <input> <output_dir> <model>` with
/// `KNEEPIPELINE_CONFIG` pointing at the job config and the pipeline
/// directory prepended to `PYTHONPATH`.
#[derive(Debug, Clone)]
pub struct PipelineInvocation {
    pub program: String,
    pub script: Option<PathBuf>,
    pub pipeline_dir: Option<PathBuf>,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub model_name: String,
    pub config_path: PathBuf,
}

impl PipelineInvocation {
    /// Arguments passed after the program name.
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(4);
        if let Some(script) = &self.script {
            args.push(script.clone().into_os_string());
        }
        args.push(self.input_path.clone().into_os_string());
        args.push(self.output_dir.clone().into_os_string());
        args.push(OsString::from(&self.model_name));
        args
    }

    /// `PYTHONPATH` value with the pipeline directory in front of `existing`.
    pub fn python_path(&self, existing: Option<&str>) -> Option<String> {
        let dir = self.pipeline_dir.as_ref()?.display().to_string();
        Some(match existing {
            Some(rest) if !rest.is_empty() => format!("{dir}:{rest}"),
            _ => dir,
        })
    }

    /// Build the command. Stdio and kill-on-drop are set by
    /// [`process::spawn_pipeline`].
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args());
        cmd.env("KNEEPIPELINE_CONFIG", &self.config_path);

        let existing = std::env::var("PYTHONPATH").ok();
        if let Some(python_path) = self.python_path(existing.as_deref()) {
            cmd.env("PYTHONPATH", python_path);
        }
        if let Some(dir) = &self.pipeline_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn invocation() -> PipelineInvocation {
        PipelineInvocation {
            program: "python3".into(),
            script: Some("/opt/kneepipeline/dosma_knee_seg.py".into()),
            pipeline_dir: Some("/opt/kneepipeline".into()),
            input_path: "/data/uploads/knee.nii.gz".into(),
            output_dir: "/data/results/j/pipeline_output".into(),
            model_name: "nnunet_knee".into(),
            config_path: "/data/results/j/config.json".into(),
        }
    }

    #[test]
    fn layout_nests_under_job_id() {
        let id = Uuid::new_v4();
        let layout = JobLayout::new(Path::new("/data/results"), id);
        let base = PathBuf::from(format!("/data/results/{id}"));
        assert_eq!(layout.config_path(), base.join("config.json"));
        assert_eq!(layout.output_dir(), base.join("pipeline_output"));
        assert_eq!(layout.archive_path("knee"), base.join("knee_results.zip"));
    }

    #[test]
    fn args_follow_script_input_output_model() {
        let args = invocation().args();
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "/opt/kneepipeline/dosma_knee_seg.py",
                "/data/uploads/knee.nii.gz",
                "/data/results/j/pipeline_output",
                "nnunet_knee",
            ]
        );
    }

    #[test]
    fn script_is_optional() {
        let inv = PipelineInvocation {
            script: None,
            ..invocation()
        };
        assert_eq!(inv.args().len(), 3);
    }

    #[test]
    fn python_path_prepends_pipeline_dir() {
        let inv = invocation();
        assert_eq!(inv.python_path(None).as_deref(), Some("/opt/kneepipeline"));
        assert_eq!(
            inv.python_path(Some("/usr/lib/py")).as_deref(),
            Some("/opt/kneepipeline:/usr/lib/py")
        );

        let bare = PipelineInvocation {
            pipeline_dir: None,
            ..invocation()
        };
        assert_eq!(bare.python_path(Some("/usr/lib/py")), None);
    }
}
