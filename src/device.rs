//! Handles to granted hosts.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::connection::{Connection, ContentTransferAgent};
use crate::error::DeviceError;
use crate::model::{CommandInput, CommandOutput, CopyInput, Host};

/// A granted host bound to an open connection and transfer agent.
///
/// Devices are created by [`DevicePool::obtain`](crate::pool::DevicePool::obtain)
/// and own their connection and agent until [`Device::close`] is called.
pub struct Device {
    host: Host,
    connection: Arc<dyn Connection>,
    transfer: Arc<dyn ContentTransferAgent>,
}

impl Device {
    /// Binds a host to its data-path handles.
    #[must_use]
    pub fn new(
        host: Host,
        connection: Arc<dyn Connection>,
        transfer: Arc<dyn ContentTransferAgent>,
    ) -> Self {
        Self {
            host,
            connection,
            transfer,
        }
    }

    /// Returns the device identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.host.device_id
    }

    /// Returns the granted host.
    #[must_use]
    pub const fn host(&self) -> &Host {
        &self.host
    }

    /// Runs a command on the device.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Connection`] when the connection fails. A
    /// command that runs but exits non-zero is not an error here.
    pub async fn execute(&self, input: &CommandInput) -> Result<CommandOutput, DeviceError> {
        Ok(self.connection.execute(input).await?)
    }

    /// Copies local files onto the device.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Transfer`] when the copy fails.
    pub async fn copy_to(&self, input: &CopyInput) -> Result<(), DeviceError> {
        Ok(self.transfer.send(input).await?)
    }

    /// Copies files from the device to the local machine.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Transfer`] when the copy fails.
    pub async fn copy_from(&self, input: &CopyInput) -> Result<(), DeviceError> {
        Ok(self.transfer.receive(input).await?)
    }

    /// Closes the transfer agent and then the connection. Failures are
    /// logged, not returned, so both handles are always attempted.
    pub async fn close(&self) {
        if let Err(err) = self.transfer.close().await {
            warn!(device_id = self.id(), error = %err, "failed to close transfer agent");
        }
        if let Err(err) = self.connection.close().await {
            warn!(device_id = self.id(), error = %err, "failed to close connection");
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
