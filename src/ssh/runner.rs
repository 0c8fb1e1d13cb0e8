//! Process execution abstraction used by the SSH strategy.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ConnectionError, TransferError};
use crate::provision::ServiceFuture;

/// Captured result of an external process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessOutput {
    /// Exit code, absent when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns stderr decoded lossily.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Errors raised while running a process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when the process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error text.
        message: String,
    },
    /// Raised when the process outlives its timeout. The process is killed.
    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        /// Program that was killed.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Raised when talking to the running process fails.
    #[error("i/o with {program} failed: {message}")]
    Io {
        /// Program being driven.
        program: String,
        /// Operating system error text.
        message: String,
    },
}

impl From<RunnerError> for ConnectionError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Spawn { program, message } | RunnerError::Io { program, message } => {
                Self::Spawn { program, message }
            }
            RunnerError::Timeout { program, timeout } => Self::Timeout { program, timeout },
        }
    }
}

impl From<RunnerError> for TransferError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Spawn { program, message } | RunnerError::Io { program, message } => {
                Self::Spawn { program, message }
            }
            RunnerError::Timeout { program, timeout } => Self::Timeout { program, timeout },
        }
    }
}

/// Abstraction over process execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, feeding `stdin` when supplied and killing
    /// the process once `limit` elapses.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
        limit: Duration,
    ) -> ServiceFuture<'a, ProcessOutput, RunnerError>;
}

/// Runner that spawns real processes with `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
        limit: Duration,
    ) -> ServiceFuture<'a, ProcessOutput, RunnerError> {
        Box::pin(async move {
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(if stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let mut child = command.spawn().map_err(|err| RunnerError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

            if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
                let payload = bytes.to_vec();
                let name = program.to_owned();
                tokio::spawn(async move {
                    if let Err(err) = pipe.write_all(&payload).await {
                        debug!(program = %name, error = %err, "stdin closed early");
                    }
                });
            }

            let output = timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RunnerError::Timeout {
                    program: program.to_owned(),
                    timeout: limit,
                })?
                .map_err(|err| RunnerError::Io {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(ProcessOutput {
                code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        })
    }
}
