use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kneepipe_core::pipeline::paths::PathTranslator;

/// Largest accepted `PIPELINE_MAX_RETRIES`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// A setting that would only fail once the first job runs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{key} must be at most {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u32,
        max: u32,
    },
}

/// Pipeline and worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Interpreter or binary to run (default: `python3`).
    pub program: String,
    /// Script passed as the first argument, if any.
    pub script: Option<PathBuf>,
    /// Pipeline checkout; used as cwd and prepended to `PYTHONPATH`.
    pub pipeline_dir: Option<PathBuf>,
    /// Base config that per-job configs are rendered from.
    pub base_config: PathBuf,
    /// Root under which each job gets `<job_id>/`.
    pub results_dir: PathBuf,
    /// Wall-clock limit for one pipeline attempt.
    pub timeout: Duration,
    /// Tick of the monitor loop's time-based progress fallback.
    pub poll_interval: Duration,
    /// Expected duration of a run, for time-based progress.
    pub expected_duration: Duration,
    /// Extra attempts after the first for retryable failures.
    pub max_retries: u32,
    /// Whether a timeout counts as retryable.
    pub retry_timeouts: bool,
    /// Pause after every attempt so accelerator memory can settle.
    pub gpu_settle: Duration,
    /// Optional shell command run after every attempt.
    pub gpu_cleanup_command: Option<String>,
    /// Rewrites container paths into paths the pipeline can see.
    pub path_translator: PathTranslator,
    /// How often the idle worker checks the queue.
    pub worker_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            script: None,
            pipeline_dir: None,
            base_config: PathBuf::from("config.json"),
            results_dir: PathBuf::from("data/results"),
            timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(500),
            expected_duration: Duration::from_secs(300),
            max_retries: 2,
            retry_timeouts: false,
            gpu_settle: Duration::from_millis(1000),
            gpu_cleanup_command: None,
            path_translator: PathTranslator::identity(),
            worker_poll_interval: Duration::from_millis(1000),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                              |
    /// |-----------------------------|--------------------------------------|
    /// | `PIPELINE_PROGRAM`          | `python3`                            |
    /// | `KNEEPIPELINE_PATH`         | unset                                |
    /// | `PIPELINE_SCRIPT`           | `$KNEEPIPELINE_PATH/dosma_knee_seg.py` |
    /// | `PIPELINE_BASE_CONFIG`      | `$KNEEPIPELINE_PATH/config.json`     |
    /// | `RESULTS_DIR`               | `data/results`                       |
    /// | `PIPELINE_TIMEOUT_SECS`     | `1800`                               |
    /// | `PIPELINE_POLL_INTERVAL_MS` | `500`                                |
    /// | `PIPELINE_EXPECTED_SECS`    | `300`                                |
    /// | `PIPELINE_MAX_RETRIES`      | `2`                                  |
    /// | `PIPELINE_RETRY_TIMEOUTS`   | `false`                              |
    /// | `GPU_SETTLE_MS`             | `1000`                               |
    /// | `GPU_CLEANUP_COMMAND`       | unset                                |
    /// | `CONTAINER_DATA_PATH`       | unset (no translation)               |
    /// | `HOST_DATA_PATH`            | unset (no translation)               |
    /// | `WORKER_POLL_INTERVAL_MS`   | `1000`                               |
    ///
    /// Panics on unparsable or out-of-range values.
    pub fn from_env() -> Self {
        let config = Self::load_env();
        if let Err(e) = config.validate() {
            panic!("Invalid pipeline configuration: {e}");
        }
        config
    }

    /// Reject values that `tokio::time::interval` or the retry loop cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("PIPELINE_TIMEOUT_SECS", self.timeout),
            ("PIPELINE_POLL_INTERVAL_MS", self.poll_interval),
            ("PIPELINE_EXPECTED_SECS", self.expected_duration),
            ("WORKER_POLL_INTERVAL_MS", self.worker_poll_interval),
        ];
        if let Some(&(key, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Zero(key));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::OutOfRange {
                key: "PIPELINE_MAX_RETRIES",
                value: self.max_retries,
                max: MAX_RETRIES_LIMIT,
            });
        }
        Ok(())
    }

    fn load_env() -> Self {
        let defaults = Self::default();

        let pipeline_dir = non_empty_var("KNEEPIPELINE_PATH").map(PathBuf::from);
        let script = non_empty_var("PIPELINE_SCRIPT")
            .map(PathBuf::from)
            .or_else(|| pipeline_dir.as_ref().map(|d| d.join("dosma_knee_seg.py")));
        let base_config = non_empty_var("PIPELINE_BASE_CONFIG")
            .map(PathBuf::from)
            .or_else(|| pipeline_dir.as_ref().map(|d| d.join("config.json")))
            .unwrap_or(defaults.base_config);

        let path_translator = match (
            non_empty_var("CONTAINER_DATA_PATH"),
            non_empty_var("HOST_DATA_PATH"),
        ) {
            (Some(from), Some(to)) => PathTranslator::new(from, to),
            _ => PathTranslator::identity(),
        };

        Self {
            program: non_empty_var("PIPELINE_PROGRAM").unwrap_or(defaults.program),
            script,
            pipeline_dir,
            base_config,
            results_dir: non_empty_var("RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.results_dir),
            timeout: Duration::from_secs(parse_var("PIPELINE_TIMEOUT_SECS", 1800)),
            poll_interval: Duration::from_millis(parse_var("PIPELINE_POLL_INTERVAL_MS", 500)),
            expected_duration: Duration::from_secs(parse_var("PIPELINE_EXPECTED_SECS", 300)),
            max_retries: parse_var("PIPELINE_MAX_RETRIES", 2),
            retry_timeouts: parse_var("PIPELINE_RETRY_TIMEOUTS", false),
            gpu_settle: Duration::from_millis(parse_var("GPU_SETTLE_MS", 1000)),
            gpu_cleanup_command: non_empty_var("GPU_CLEANUP_COMMAND"),
            path_translator,
            worker_poll_interval: Duration::from_millis(parse_var("WORKER_POLL_INTERVAL_MS", 1000)),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(key) {
        Some(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{key} must be a valid value: {e}")),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_poll_intervals_are_rejected() {
        let config = PipelineConfig {
            poll_interval: Duration::ZERO,
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("PIPELINE_POLL_INTERVAL_MS"))
        );

        let config = PipelineConfig {
            worker_poll_interval: Duration::ZERO,
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("WORKER_POLL_INTERVAL_MS"))
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = PipelineConfig {
            timeout: Duration::ZERO,
            ..PipelineConfig::default()
        };
        assert_matches!(config.validate(), Err(ConfigError::Zero("PIPELINE_TIMEOUT_SECS")));
    }

    #[test]
    fn excessive_retries_are_rejected() {
        let config = PipelineConfig {
            max_retries: u32::MAX,
            ..PipelineConfig::default()
        };
        assert_matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { value: u32::MAX, max: MAX_RETRIES_LIMIT, .. })
        );

        let config = PipelineConfig {
            max_retries: MAX_RETRIES_LIMIT,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }
}
