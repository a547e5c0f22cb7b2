//! Accelerator cleanup between pipeline attempts.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Upper bound on the cleanup command's runtime.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Frees shared resources after a pipeline attempt.
///
/// Called exactly once after every attempt, whatever its outcome. Must not
/// fail; problems are logged.
#[async_trait]
pub trait ResourceReleaser: Send + Sync {
    async fn release(&self);
}

/// Runs an optional cleanup command, then waits for memory to settle.
#[derive(Debug, Clone)]
pub struct GpuReleaser {
    command: Option<String>,
    settle: Duration,
}

impl GpuReleaser {
    pub fn new(command: Option<String>, settle: Duration) -> Self {
        Self { command, settle }
    }

    async fn run_cleanup(&self, command: &str) {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);

        match tokio::time::timeout(CLEANUP_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::debug!(command, "GPU cleanup command finished");
            }
            Ok(Ok(status)) => {
                tracing::warn!(command, exit_code = ?status.code(), "GPU cleanup command failed");
            }
            Ok(Err(e)) => {
                tracing::warn!(command, error = %e, "GPU cleanup command could not start");
            }
            Err(_) => {
                tracing::warn!(command, "GPU cleanup command timed out");
            }
        }
    }
}

#[async_trait]
impl ResourceReleaser for GpuReleaser {
    async fn release(&self) {
        if let Some(command) = &self.command {
            self.run_cleanup(command).await;
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn runs_command_then_settles() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("cleaned");
        let releaser = GpuReleaser::new(
            Some(format!("touch {}", marker.display())),
            Duration::from_millis(50),
        );

        let start = Instant::now();
        releaser.release().await;
        assert!(marker.exists());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn failing_command_is_tolerated() {
        let releaser = GpuReleaser::new(Some("exit 3".into()), Duration::ZERO);
        releaser.release().await;
    }
}
