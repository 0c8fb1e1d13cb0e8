//! Data-path contracts: command execution and file transfer against a
//! granted host.
//!
//! Concrete strategies (SSH, agents, message buses) live behind these traits
//! so the pool never depends on how a host is reached.

use std::sync::Arc;

use crate::error::{ConnectionError, TransferError};
use crate::model::{CommandInput, CommandOutput, CopyInput, Host};
use crate::provision::ServiceFuture;

/// An open command channel to one host.
pub trait Connection: Send + Sync {
    /// Runs a command and captures its output.
    fn execute<'a>(
        &'a self,
        input: &'a CommandInput,
    ) -> ServiceFuture<'a, CommandOutput, ConnectionError>;

    /// Releases resources held by the connection.
    fn close(&self) -> ServiceFuture<'_, (), ConnectionError> {
        Box::pin(async { Ok(()) })
    }
}

/// Opens connections to hosts.
pub trait ConnectionFactory: Send + Sync {
    /// Opens a connection to `host`.
    fn connect<'a>(
        &'a self,
        host: &'a Host,
    ) -> ServiceFuture<'a, Arc<dyn Connection>, ConnectionError>;

    /// Releases resources shared by every connection from this factory.
    fn close(&self) -> ServiceFuture<'_, (), ConnectionError> {
        Box::pin(async { Ok(()) })
    }
}

/// Moves files to and from one host.
pub trait ContentTransferAgent: Send + Sync {
    /// Copies local `input.source` to remote `input.destination`.
    fn send<'a>(&'a self, input: &'a CopyInput) -> ServiceFuture<'a, (), TransferError>;

    /// Copies remote `input.source` to local `input.destination`.
    fn receive<'a>(&'a self, input: &'a CopyInput) -> ServiceFuture<'a, (), TransferError>;

    /// Releases resources held by the agent.
    fn close(&self) -> ServiceFuture<'_, (), TransferError> {
        Box::pin(async { Ok(()) })
    }
}

/// Opens transfer agents.
///
/// The agent receives the device's connection so strategies that tunnel
/// transfers over it can reuse it.
pub trait ContentTransferAgentFactory: Send + Sync {
    /// Opens an agent for `host` on behalf of request `provision_id`.
    fn connect<'a>(
        &'a self,
        provision_id: &'a str,
        connection: Arc<dyn Connection>,
        host: &'a Host,
    ) -> ServiceFuture<'a, Arc<dyn ContentTransferAgent>, TransferError>;

    /// Releases resources shared by every agent from this factory.
    fn close(&self) -> ServiceFuture<'_, (), TransferError> {
        Box::pin(async { Ok(()) })
    }
}
