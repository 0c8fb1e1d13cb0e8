//! Reference data-path strategy over the system `ssh` and `scp` clients.
//!
//! [`SshConnectionFactory`] implements both factory contracts. Its
//! connections spawn one `ssh` process per command and its transfer agents
//! spawn one `scp` process per copy, so neither holds a session open and
//! closing them is a no-op.

use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use tracing::debug;

use crate::config::ConfigError;
use crate::connection::{
    Connection, ConnectionFactory, ContentTransferAgent, ContentTransferAgentFactory,
};
use crate::error::{ConnectionError, TransferError};
use crate::model::{CommandInput, CommandOutput, CopyInput, Host};
use crate::provision::ServiceFuture;

mod args;
mod runner;

pub use args::{expand_tilde, render_remote_command};
pub use runner::{CommandRunner, ProcessCommandRunner, ProcessOutput, RunnerError};

use args::{Direction, scp_args, ssh_args};

#[cfg(test)]
mod tests;

/// Exit status `ssh` reports when it could not reach the host.
pub const SSH_CONNECTION_FAILURE: i32 = 255;

/// SSH client settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DEVICE_POOL_SSH",
    discovery(
        app_name = "device-pool",
        env_var = "DEVICE_POOL_CONFIG_PATH",
        config_file_name = "device-pool.toml",
        dotfile_name = ".device-pool.toml",
        project_file_name = "device-pool.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode so the client never prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; pooled hosts are often
    /// recycled, so it is off by default.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used for authentication. Supports `~/` expansion. When
    /// absent the client falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Seconds the client waits for the TCP connection; zero leaves the
    /// client default.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Upper bound on a single file transfer, in seconds.
    #[ortho_config(default = 300)]
    pub transfer_timeout_secs: u64,
}

impl SshConfig {
    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first empty field, or
    /// when the transfer timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        if let Some(identity_file) = &self.ssh_identity_file {
            Self::require_value(identity_file, "ssh_identity_file")?;
        }
        if self.transfer_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transfer_timeout_secs must be positive: set DEVICE_POOL_SSH_TRANSFER_TIMEOUT_SECS"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "missing {field}: set DEVICE_POOL_SSH_{} or add {field} to device-pool.toml",
                field.to_uppercase()
            )));
        }
        Ok(())
    }

    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("device-pool")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the transfer timeout as a [`Duration`].
    #[must_use]
    pub const fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

/// Opens SSH connections and SCP transfer agents.
pub struct SshConnectionFactory<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: Arc<R>,
}

impl SshConnectionFactory<ProcessCommandRunner> {
    /// Creates a factory that spawns real `ssh`/`scp` processes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, ConfigError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshConnectionFactory<R> {
    /// Creates a factory using `runner` to execute processes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
        })
    }

    /// Returns the validated configuration.
    #[must_use]
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

impl<R: CommandRunner + 'static> ConnectionFactory for SshConnectionFactory<R> {
    fn connect<'a>(
        &'a self,
        host: &'a Host,
    ) -> ServiceFuture<'a, Arc<dyn Connection>, ConnectionError> {
        Box::pin(async move {
            debug!(device_id = %host.device_id, host = %host.host_name, "opening ssh connection");
            let connection: Arc<dyn Connection> = Arc::new(SshConnection {
                config: Arc::clone(&self.config),
                runner: Arc::clone(&self.runner),
                host: host.clone(),
            });
            Ok(connection)
        })
    }
}

impl<R: CommandRunner + 'static> ContentTransferAgentFactory for SshConnectionFactory<R> {
    fn connect<'a>(
        &'a self,
        provision_id: &'a str,
        _connection: Arc<dyn Connection>,
        host: &'a Host,
    ) -> ServiceFuture<'a, Arc<dyn ContentTransferAgent>, TransferError> {
        Box::pin(async move {
            debug!(provision_id, device_id = %host.device_id, "opening scp transfer agent");
            let agent: Arc<dyn ContentTransferAgent> = Arc::new(ScpTransferAgent {
                config: Arc::clone(&self.config),
                runner: Arc::clone(&self.runner),
                host: host.clone(),
            });
            Ok(agent)
        })
    }
}

/// Runs commands on one host through `ssh`.
pub struct SshConnection<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: Arc<R>,
    host: Host,
}

impl<R: CommandRunner> SshConnection<R> {
    async fn run(&self, input: &CommandInput) -> Result<CommandOutput, ConnectionError> {
        let args = ssh_args(&self.config, &self.host, input);
        let output = self
            .runner
            .run(
                &self.config.ssh_bin,
                &args,
                input.stdin.as_deref(),
                input.timeout,
            )
            .await?;
        let Some(exit_code) = output.code else {
            return Err(ConnectionError::MissingExitCode {
                program: self.config.ssh_bin.clone(),
            });
        };
        if exit_code == SSH_CONNECTION_FAILURE {
            return Err(ConnectionError::Unreachable {
                host: self.host.host_name.clone(),
                message: output.stderr_text(),
            });
        }
        Ok(CommandOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            original_input: input.clone(),
        })
    }
}

impl<R: CommandRunner> Connection for SshConnection<R> {
    fn execute<'a>(
        &'a self,
        input: &'a CommandInput,
    ) -> ServiceFuture<'a, CommandOutput, ConnectionError> {
        Box::pin(self.run(input))
    }
}

/// Copies files to and from one host through `scp`.
pub struct ScpTransferAgent<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: Arc<R>,
    host: Host,
}

impl<R: CommandRunner> ScpTransferAgent<R> {
    async fn copy(&self, input: &CopyInput, direction: Direction) -> Result<(), TransferError> {
        let args = scp_args(&self.config, &self.host, input, direction);
        let output = self
            .runner
            .run(
                &self.config.scp_bin,
                &args,
                None,
                self.config.transfer_timeout(),
            )
            .await?;
        if output.is_success() {
            return Ok(());
        }
        Err(TransferError::CommandFailure {
            program: self.config.scp_bin.clone(),
            status_text: output
                .code
                .map_or_else(|| "signal".to_owned(), |code| format!("exit code {code}")),
            stderr: output.stderr_text(),
        })
    }
}

impl<R: CommandRunner> ContentTransferAgent for ScpTransferAgent<R> {
    fn send<'a>(&'a self, input: &'a CopyInput) -> ServiceFuture<'a, (), TransferError> {
        Box::pin(self.copy(input, Direction::Send))
    }

    fn receive<'a>(&'a self, input: &'a CopyInput) -> ServiceFuture<'a, (), TransferError> {
        Box::pin(self.copy(input, Direction::Receive))
    }
}
