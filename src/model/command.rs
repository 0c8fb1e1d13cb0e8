//! Command and file-copy descriptors used on a device's data path.

use std::collections::BTreeSet;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::error::ConnectionError;

/// Timeout applied to commands that do not set one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A command to run on a connected host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInput {
    /// Program or shell line to execute.
    pub line: String,
    /// Extra arguments appended after `line`.
    pub args: Vec<String>,
    /// Bytes written to the command's standard input.
    pub stdin: Option<Vec<u8>>,
    /// Upper bound on the command's run time.
    pub timeout: Duration,
}

impl CommandInput {
    /// Creates a command with the default timeout and no arguments.
    #[must_use]
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            args: Vec::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Supplies standard input.
    #[must_use]
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Overrides the timeout.
    #[must_use]
    pub const fn timeout(mut self, value: Duration) -> Self {
        self.timeout = value;
        self
    }
}

/// Result of a command run on a host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the remote command.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// The command that produced this output.
    pub original_input: CommandInput,
}

impl CommandOutput {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns standard output, failing when the command did not succeed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NonZeroExit`] carrying the exit code and
    /// the lossily decoded stderr when the exit code is non-zero.
    pub fn to_bytes(&self) -> Result<&[u8], ConnectionError> {
        if self.success() {
            return Ok(&self.stdout);
        }
        Err(ConnectionError::NonZeroExit {
            exit_code: self.exit_code,
            line: self.original_input.line.clone(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        })
    }

    /// Returns standard output as UTF-8 text with invalid sequences replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NonZeroExit`] under the same conditions as
    /// [`Self::to_bytes`].
    pub fn to_utf8_string(&self) -> Result<String, ConnectionError> {
        self.to_bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Options accepted by file transfers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CopyOption {
    /// Copy directories and their contents.
    Recursive,
}

/// Source and destination of a file transfer.
///
/// For a send the source is local and the destination remote; for a receive
/// the roles swap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CopyInput {
    /// Path files are read from.
    pub source: Utf8PathBuf,
    /// Path files are written to.
    pub destination: Utf8PathBuf,
    /// Transfer flags.
    pub options: BTreeSet<CopyOption>,
}

impl CopyInput {
    /// Creates a copy with no options.
    #[must_use]
    pub fn new(source: impl Into<Utf8PathBuf>, destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options: BTreeSet::new(),
        }
    }

    /// Enables recursive copying.
    #[must_use]
    pub fn recursive(mut self) -> Self {
        self.options.insert(CopyOption::Recursive);
        self
    }

    /// Returns `true` when recursive copying was requested.
    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.options.contains(&CopyOption::Recursive)
    }
}
