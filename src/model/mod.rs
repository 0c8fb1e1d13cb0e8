//! Value types shared by the provisioning, reservation, and device layers.
//!
//! Every type here is an immutable value: snapshots are replaced rather than
//! mutated in place, which keeps them safe to hand across tasks.

use thiserror::Error;

mod command;
mod host;
mod provision;

pub use command::{CommandInput, CommandOutput, CopyInput, CopyOption, DEFAULT_COMMAND_TIMEOUT};
pub use host::{DEFAULT_SSH_PORT, Host, HostBuilder, PlatformOs};
pub use provision::{ProvisionInput, ProvisionOutput, Reservation, Status};


/// Errors raised while constructing model values.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ModelError {
    /// Raised when a required field is missing or blank.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when a platform string is not of the form `os:arch`.
    #[error("platform format is 'os:arch' but '{0}' was provided")]
    InvalidPlatform(String),
    /// Raised when a provision request asks for zero hosts.
    #[error("provision amount must be at least 1")]
    InvalidAmount,
}
