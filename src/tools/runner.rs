//! Subprocess execution behind a trait
//!
//! Backend adapters never touch `tokio::process` directly; they describe the
//! command as a [`CommandSpec`] and hand it to a [`CommandRunner`]. The real
//! implementation is [`SystemRunner`]; tests substitute a recording spy.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// A fully described command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg1 arg2`, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a completed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `-1` when the process was terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if non-empty, else stdout, trimmed
    pub fn diagnostic(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0} is not installed")]
    Missing(String),

    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Process execution seam used by every backend adapter
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing output, bounded by `spec.timeout`
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError>;

    /// Start without waiting; returns the child pid
    fn spawn_detached(&self, spec: &CommandSpec) -> Result<u32, RunError>;

    /// Resolve a program on `PATH`
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runs real processes, each in its own process group
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn io_error(program: &str, source: std::io::Error) -> RunError {
        if source.kind() == std::io::ErrorKind::NotFound {
            RunError::Missing(program.to_string())
        } else {
            RunError::Io {
                program: program.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        debug!(command = %spec.display(), timeout = ?spec.timeout, "Running command");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::io_error(&spec.program, e))?;

        // The child leads its own group, so pgid == pid
        let pgid = child.id();

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(Self::io_error(&spec.program, e)),
            Err(_) => {
                // kill_on_drop only reaches the direct child; grandchildren
                // spawned by `sh -c` share its group
                if let Some(pgid) = pgid {
                    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(e) => warn!(pgid, error = %e, "Failed to kill timed-out process group"),
                    }
                }
                warn!(command = %spec.display(), after = ?spec.timeout, "Command timed out");
                Err(RunError::TimedOut {
                    program: spec.program.clone(),
                    after: spec.timeout,
                })
            }
        }
    }

    fn spawn_detached(&self, spec: &CommandSpec) -> Result<u32, RunError> {
        debug!(command = %spec.display(), "Spawning detached");
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| Self::io_error(&spec.program, e))?;
        // Dropping the handle without kill_on_drop leaves the process running
        Ok(child.id().unwrap_or_default())
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder_and_display() {
        let spec = CommandSpec::new("nmcli")
            .args(["-t", "-f"])
            .arg("STATE")
            .timeout(Duration::from_secs(5));
        assert_eq!(spec.display(), "nmcli -t -f STATE");
        assert_eq!(spec.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "partial\n".into(),
            stderr: "  boom \n".into(),
        };
        assert_eq!(out.diagnostic(), "boom");
        let out = CommandOutput { exit_code: 1, stdout: " only stdout ".into(), stderr: String::new() };
        assert_eq!(out.diagnostic(), "only stdout");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = runner.run(&spec).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_system_runner_times_out() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RunError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = SystemRunner::new();
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Missing(_)));
    }
}
