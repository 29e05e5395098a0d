//! Bounded execution of external tools.

use crate::error::{DeviceError, DeviceResult};
use std::fmt;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// What an external tool printed and how it ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(f, "timed out")?;
        } else {
            match self.exit_code {
                Some(code) => write!(f, "exit code {code}")?,
                None => write!(f, "killed by signal")?,
            }
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ", stderr: {stderr}")?;
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            write!(f, ", stdout: {stdout}")?;
        }
        Ok(())
    }
}

/// Runs one external command to completion or timeout.
///
/// Implementations must not retry. A timeout is reported through
/// `CommandOutput::timed_out`, not as an `Err`.
pub trait ProcessExecutor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        timeout: Duration,
        args: &[String],
    ) -> DeviceResult<CommandOutput>;
}

/// Executor spawning real processes.
#[derive(Clone, Debug, Default)]
pub struct SystemProcessExecutor {
    poll_interval: Option<Duration>,
}

impl SystemProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval: Some(poll_interval),
        }
    }
}

impl ProcessExecutor for SystemProcessExecutor {
    fn execute(
        &self,
        program: &str,
        timeout: Duration,
        args: &[String],
    ) -> DeviceResult<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DeviceError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Drain both pipes while waiting so a chatty tool cannot block on a full pipe.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + timeout;
        let poll_interval = self.poll_interval.unwrap_or(Duration::from_millis(100));

        let (exit_code, timed_out) = loop {
            match child.try_wait()? {
                Some(status) => break (status.code(), false),
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        tracing::warn!(
                            program,
                            timeout_ms = timeout.as_millis() as u64,
                            "device command timed out"
                        );
                        break (None, true);
                    }
                    std::thread::sleep(poll_interval);
                }
            }
        };

        Ok(CommandOutput {
            exit_code,
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            timed_out,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).ok();
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Run `program args` and turn anything but a clean exit into `DeviceError::Command`.
pub(crate) fn run_checked(
    executor: &dyn ProcessExecutor,
    program: &str,
    timeout: Duration,
    args: Vec<String>,
    failure_message: impl FnOnce() -> String,
) -> DeviceResult<CommandOutput> {
    tracing::debug!(program, args = ?args, "running device command");
    let output = executor.execute(program, timeout, &args)?;
    if output.success() {
        return Ok(output);
    }
    let message = failure_message();
    tracing::warn!(
        program,
        exit_code = ?output.exit_code,
        timed_out = output.timed_out,
        stderr = %output.stderr.trim(),
        "{message}"
    );
    Err(DeviceError::Command { message, output })
}
