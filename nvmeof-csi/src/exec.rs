//! External command execution with a hard deadline.
//!
//! Every host tool the node plugin shells out to (`nvme`, `mount`, `umount`)
//! goes through a [`CommandRunner`]. The runner never retries: callers decide
//! what a failed or timed out invocation means.

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep draining pipes after the process has exited or been killed.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Non-zero exit. `None` when the process was terminated by a signal.
    Failed(Option<i32>),
    /// The deadline expired and the process was killed.
    TimedOut,
}

impl Outcome {
    /// Short label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed(_) => "failed",
            Outcome::TimedOut => "timeout",
        }
    }
}

/// Combined stdout/stderr of an invocation together with its outcome.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub output: String,
    pub outcome: Outcome,
}

impl CommandOutput {
    pub fn new(output: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            output: output.into(),
            outcome,
        }
    }
}

/// Runs an external command line within a deadline.
#[tonic::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError>;
}

/// [`CommandRunner`] backed by real host processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[tonic::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

        info!(command = ?argv, timeout_secs = timeout.as_secs(), "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut stdout = OutputReader::spawn(child.stdout.take());
        let mut stderr = OutputReader::spawn(child.stderr.take());

        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Outcome::Success,
            Ok(Ok(status)) => Outcome::Failed(status.code()),
            Ok(Err(source)) => {
                return Err(ExecError::Wait {
                    program: program.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(command = ?argv, timeout_secs = timeout.as_secs(), "Command timed out, killing it");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, program = %program, "Failed to kill timed out command");
                }
                Outcome::TimedOut
            }
        };

        drain(&mut stdout, &mut stderr).await;
        let mut output = stdout.take();
        output.push_str(&stderr.take());

        debug!(program = %program, outcome = outcome.as_str(), output = %output, "Command returned");

        Ok(CommandOutput { output, outcome })
    }
}

/// Copies a pipe into a buffer that outlives the copying task.
struct OutputReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl OutputReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            lock_buffer(&buffer).extend_from_slice(&chunk[..n]);
                        }
                        Err(e) => {
                            debug!(error = %e, "Stopped reading command output");
                            break;
                        }
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                warn!(error = %e, "Output reader task failed");
            }
        }
    }

    fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Everything read so far, lossily decoded.
    fn take(&self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut *lock_buffer(&self.buffer))).into_owned()
    }
}

fn lock_buffer(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait for both pipes to hit EOF within one shared budget.
async fn drain(stdout: &mut OutputReader, stderr: &mut OutputReader) {
    let both = async {
        tokio::join!(stdout.finished(), stderr.finished());
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, both).await.is_err() {
        // A grandchild still holds a pipe open; keep what was read.
        warn!("Command output still open after exit, returning partial output");
        stdout.abort();
        stderr.abort();
    }
}

/// Build an argv vector from string slices.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
