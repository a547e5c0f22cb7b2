//! Spawning the pipeline and streaming its output.
//!
//! Two reader tasks, one per stream, forward each line into a single
//! ordered channel. The channel closes once both streams hit EOF, which the
//! monitor loop uses to know the output has been fully drained.
//!
//! On Unix the pipeline leads its own process group, so killing it also
//! reaches any workers it started; otherwise they would keep the GPU and
//! the output pipes after the pipeline itself is gone.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Capacity of the line channel between readers and the monitor loop.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Maximum number of lines kept per stream for error classification.
pub const TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of pipeline output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// A running pipeline process.
pub struct RunningPipeline {
    pub child: Child,
    pub lines: mpsc::Receiver<OutputLine>,
    /// Process group led by the child.
    group: Option<u32>,
}

impl RunningPipeline {
    /// Kill the pipeline and every process in its group, then reap it.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.kill_group();
        self.child.kill().await
    }

    fn kill_group(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.group.take() {
            // SAFETY: kill(2) has no memory-safety preconditions; a negative
            // pid addresses the process group.
            let ret = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!(pgid, error = %err, "Failed to kill pipeline process group");
                }
            }
        }
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        self.kill_group();
    }
}

/// Spawn `cmd` with piped output and start the reader tasks.
///
/// The child and its process group are killed if the handle is dropped.
pub fn spawn_pipeline(cmd: &mut Command) -> io::Result<RunningPipeline> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let group = if cfg!(unix) { child.id() } else { None };
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));
    }

    Ok(RunningPipeline {
        child,
        lines: rx,
        group,
    })
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                // Non-UTF-8 output or a broken pipe ends this stream only.
                tracing::debug!(?stream, error = %e, "Pipeline output reader stopped");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Output tail
// ---------------------------------------------------------------------------

/// Bounded record of the most recent output, per stream.
#[derive(Debug, Default)]
pub struct OutputTail {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

impl OutputTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: &OutputLine) {
        let buf = match line.stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        if buf.len() == TAIL_LINES {
            buf.pop_front();
        }
        buf.push_back(line.text.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Stderr followed by stdout, newline separated.
    pub fn render(&self) -> String {
        self.stderr
            .iter()
            .chain(self.stdout.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(stream: OutputStream, text: &str) -> OutputLine {
        OutputLine {
            stream,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn streams_lines_from_both_pipes() {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg("echo out-1; echo err-1 >&2; echo out-2");
        let mut running = spawn_pipeline(&mut cmd).unwrap();

        let mut received = Vec::new();
        while let Some(line) = running.lines.recv().await {
            received.push(line);
        }
        let status = running.child.wait().await.unwrap();
        assert!(status.success());

        let stdout: Vec<_> = received
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, ["out-1", "out-2"]);
        assert!(received.contains(&line(OutputStream::Stderr, "err-1")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_reaches_background_children() {
        // The background sleep inherits both pipes; the streams only close
        // once it is dead too.
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg("sleep 30 & echo started; wait");
        let mut running = spawn_pipeline(&mut cmd).unwrap();

        let first = running.lines.recv().await.unwrap();
        assert_eq!(first.text, "started");

        running.kill().await.unwrap();

        let drained = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while running.lines.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output pipes stayed open after kill");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let mut cmd = Command::new("/definitely/not/a/real/program");
        let err = spawn_pipeline(&mut cmd).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn tail_is_bounded_and_renders_stderr_first() {
        let mut tail = OutputTail::new();
        assert!(tail.is_empty());
        for i in 0..(TAIL_LINES + 5) {
            tail.push(&line(OutputStream::Stdout, &format!("line {i}")));
        }
        tail.push(&line(OutputStream::Stderr, "Traceback"));

        let rendered = tail.render();
        assert!(rendered.starts_with("Traceback\nline 5"));
        assert!(!rendered.contains("line 4\n"));
        assert_eq!(rendered.lines().count(), TAIL_LINES + 1);
    }
}
