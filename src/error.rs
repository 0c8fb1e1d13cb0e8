//! Error taxonomy for provisioning, reservation, and device access.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ModelError, Status};

/// Errors raised by provisioning services and the device pool.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisioningError {
    /// Raised when a request id is unknown, either never submitted or
    /// already released.
    #[error("provision request {id} not found")]
    NotFound {
        /// Request identifier.
        id: String,
    },
    /// Raised when the fulfillment queue no longer accepts work.
    #[error("provision request {id} could not be queued: fulfillment has stopped")]
    QueueClosed {
        /// Request identifier.
        id: String,
    },
    /// Raised when a request reached a terminal status other than success.
    #[error("provision request {id} finished with status {status}")]
    Failed {
        /// Request identifier.
        id: String,
        /// Terminal status observed.
        status: Status,
    },
    /// Raised when a request did not reach a terminal status in time.
    #[error("provision request {id} did not complete in time")]
    Timeout {
        /// Request identifier.
        id: String,
    },
    /// Raised when waiting on a request was interrupted.
    #[error("waiting on provision request {id} was interrupted: {message}")]
    Interrupted {
        /// Request identifier.
        id: String,
        /// Description of the interruption.
        message: String,
    },
    /// Raised when an engine is built without any hosts or host provider.
    #[error("a provisioning engine needs at least one host")]
    EmptyHosts,
    /// Raised when no Tokio runtime is available to host background tasks.
    #[error("background tasks need a Tokio runtime: {0}")]
    Runtime(String),
    /// Raised when the external lock guarding a request could not be taken.
    #[error("failed to lock provision request {id}: {source}")]
    Locking {
        /// Request identifier.
        id: String,
        /// Underlying locking failure.
        source: LockingError,
    },
    /// Raised when a model value is invalid.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Raised when a reservation could not be exchanged for a host.
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    /// Raised when a connection to a granted host failed.
    #[error("failed to connect to granted host: {0}")]
    Connection(#[from] ConnectionError),
    /// Raised when a transfer agent for a granted host failed.
    #[error("failed to open transfer agent for granted host: {0}")]
    Transfer(#[from] TransferError),
    /// Raised when a component is missing or misconfigured.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors raised while exchanging a reservation for a host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReservationError {
    /// Raised when no host carries the reserved device id.
    #[error("host {device_id} not found")]
    HostNotFound {
        /// Device identifier looked up.
        device_id: String,
    },
    /// Raised when an external host directory failed.
    #[error("host directory failed: {message}")]
    Directory {
        /// Description of the failure.
        message: String,
    },
}

/// Errors raised by connections to a host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectionError {
    /// Raised when the transport process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error text.
        message: String,
    },
    /// Raised when a command exceeded its timeout.
    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        /// Program that timed out.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Raised when a command exited unsuccessfully and its output was
    /// requested as a success value.
    #[error("command `{line}` exited with status {exit_code}: {stderr}")]
    NonZeroExit {
        /// Exit code reported.
        exit_code: i32,
        /// Command line that ran.
        line: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a process terminated without an exit code.
    #[error("{program} terminated without an exit code")]
    MissingExitCode {
        /// Program that terminated.
        program: String,
    },
    /// Raised when the host could not be reached at all.
    #[error("host {host} is unreachable: {message}")]
    Unreachable {
        /// Address that was dialled.
        host: String,
        /// Description of the failure.
        message: String,
    },
}

/// Errors raised by content transfer agents.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// Raised when the transfer process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error text.
        message: String,
    },
    /// Raised when a transfer exceeded its timeout.
    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        /// Program that timed out.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Raised when the transfer process reported failure.
    #[error("{program} failed with {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status description.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when an agent does not support the requested operation.
    #[error("transfer operation not supported: {0}")]
    Unsupported(String),
}

/// Errors surfaced by [`crate::device::Device`] operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeviceError {
    /// Raised by the device's connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Raised by the device's transfer agent.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Errors raised by locking services.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LockingError {
    /// Raised when another holder owns an unexpired lock.
    #[error("lock {id} is held by {holder}")]
    Conflict {
        /// Lock identifier.
        id: String,
        /// Current owner of the lock.
        holder: String,
    },
    /// Raised when waiting for a lock was interrupted.
    #[error("waiting for lock {id} was interrupted")]
    Interrupted {
        /// Lock identifier.
        id: String,
    },
    /// Raised when a lock was not obtained within the allowed time.
    #[error("lock {id} was not acquired within {timeout:?}")]
    Timeout {
        /// Lock identifier.
        id: String,
        /// Time spent waiting.
        timeout: Duration,
    },
    /// Raised when the lock backend itself failed.
    #[error("lock backend failed: {0}")]
    Mechanism(String),
}

/// Errors raised while growing a host population.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PopulationError {
    /// Raised when the paging function failed.
    #[error("host expansion failed: {message}")]
    Expansion {
        /// Description of the failure.
        message: String,
    },
    /// Raised when the expansion worker is no longer running.
    #[error("host expansion worker has stopped")]
    WorkerStopped,
    /// Raised when no Tokio runtime is available to host the worker.
    #[error("host expansion needs a Tokio runtime: {0}")]
    Runtime(String),
}
