//! Public façade that turns provision requests into usable devices.
//!
//! [`DevicePool`] composes a provisioning service, a reservation service,
//! and the connection and transfer factories. `provision`, `describe`, and
//! `release` delegate to the provisioning service; `obtain` exchanges
//! successful reservations for [`Device`] handles; `provision_wait` wraps the
//! asynchronous lifecycle in a single call with a timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionFactory, ContentTransferAgentFactory};
use crate::device::Device;
use crate::error::ProvisioningError;
use crate::model::{ProvisionInput, ProvisionOutput, Reservation, Status};
use crate::provision::{ProvisionService, ReservationService};

mod wait;


/// Delay between status polls while waiting on a request, by default.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Entry point for provisioning devices.
pub struct DevicePool {
    provisioning: Arc<dyn ProvisionService>,
    reservations: Arc<dyn ReservationService>,
    connections: Arc<dyn ConnectionFactory>,
    transfers: Arc<dyn ContentTransferAgentFactory>,
    poll_interval: Duration,
}

impl fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePool")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl DevicePool {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> DevicePoolBuilder {
        DevicePoolBuilder::default()
    }

    /// Submits a request and returns immediately with its snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the provisioning service's error.
    pub async fn provision(
        &self,
        input: &ProvisionInput,
    ) -> Result<ProvisionOutput, ProvisioningError> {
        self.provisioning.provision(input).await
    }

    /// Returns the latest snapshot of a request.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::NotFound`] for unknown or released ids.
    pub async fn describe(&self, id: &str) -> Result<ProvisionOutput, ProvisioningError> {
        self.provisioning.describe(id).await
    }

    /// Releases a request. Unknown ids are not an error.
    ///
    /// # Errors
    ///
    /// Propagates failures reported by remote provisioning services.
    pub async fn release(&self, id: &str) -> Result<(), ProvisioningError> {
        self.provisioning.release(id).await
    }

    /// Opens a device for every succeeded reservation in `output`.
    ///
    /// When any reservation fails to exchange or connect, devices opened for
    /// earlier reservations are closed before the error is returned, so a
    /// failed call leaves nothing open. The request itself stays provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Reservation`],
    /// [`ProvisioningError::Connection`], or [`ProvisioningError::Transfer`]
    /// for the first reservation that could not be opened.
    pub async fn obtain(&self, output: &ProvisionOutput) -> Result<Vec<Device>, ProvisioningError> {
        let mut devices = Vec::with_capacity(output.reservations().len());
        let granted = output
            .reservations()
            .iter()
            .filter(|reservation| reservation.status == Status::Succeeded);
        for reservation in granted {
            match self.open_device(output.id(), reservation).await {
                Ok(device) => devices.push(device),
                Err(err) => {
                    warn!(
                        provision_id = output.id(),
                        device_id = %reservation.device_id,
                        opened = devices.len(),
                        error = %err,
                        "closing devices after partial obtain failure"
                    );
                    for device in &devices {
                        device.close().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(devices)
    }

    async fn open_device(
        &self,
        provision_id: &str,
        reservation: &Reservation,
    ) -> Result<Device, ProvisioningError> {
        let host = self.reservations.exchange(reservation).await?;
        let connection = self.connections.connect(&host).await?;
        let transfer = match self
            .transfers
            .connect(provision_id, Arc::clone(&connection), &host)
            .await
        {
            Ok(transfer) => transfer,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(device_id = %host.device_id, error = %close_err, "failed to close connection");
                }
                return Err(err.into());
            }
        };
        debug!(provision_id, device_id = %host.device_id, "opened device");
        Ok(Device::new(host, connection, transfer))
    }

    /// Closes the provisioning service and both factories. Failures are
    /// logged so every component gets a chance to close.
    pub async fn close(&self) {
        if let Err(err) = self.provisioning.close().await {
            warn!(error = %err, "failed to close provisioning service");
        }
        if let Err(err) = self.connections.close().await {
            warn!(error = %err, "failed to close connection factory");
        }
        if let Err(err) = self.transfers.close().await {
            warn!(error = %err, "failed to close transfer factory");
        }
    }

    /// Returns the delay between status polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Builder for [`DevicePool`].
pub struct DevicePoolBuilder {
    provisioning: Option<Arc<dyn ProvisionService>>,
    reservations: Option<Arc<dyn ReservationService>>,
    connections: Option<Arc<dyn ConnectionFactory>>,
    transfers: Option<Arc<dyn ContentTransferAgentFactory>>,
    poll_interval: Duration,
}

impl Default for DevicePoolBuilder {
    fn default() -> Self {
        Self {
            provisioning: None,
            reservations: None,
            connections: None,
            transfers: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl DevicePoolBuilder {
    /// Sets the provisioning service.
    #[must_use]
    pub fn provision_service(mut self, service: Arc<dyn ProvisionService>) -> Self {
        self.provisioning = Some(service);
        self
    }

    /// Sets the reservation service.
    #[must_use]
    pub fn reservation_service(mut self, service: Arc<dyn ReservationService>) -> Self {
        self.reservations = Some(service);
        self
    }

    /// Uses one value for both the provisioning and reservation contracts.
    #[must_use]
    pub fn provision_and_reservation_service<T>(self, service: Arc<T>) -> Self
    where
        T: ProvisionService + ReservationService + 'static,
    {
        let reservations: Arc<dyn ReservationService> = service.clone();
        self.provision_service(service)
            .reservation_service(reservations)
    }

    /// Sets the connection factory.
    #[must_use]
    pub fn connections(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(factory);
        self
    }

    /// Sets the transfer agent factory.
    #[must_use]
    pub fn transfers(mut self, factory: Arc<dyn ContentTransferAgentFactory>) -> Self {
        self.transfers = Some(factory);
        self
    }

    /// Uses one value for both factory contracts.
    #[must_use]
    pub fn connection_and_transfer_factory<T>(self, factory: Arc<T>) -> Self
    where
        T: ConnectionFactory + ContentTransferAgentFactory + 'static,
    {
        let transfers: Arc<dyn ContentTransferAgentFactory> = factory.clone();
        self.connections(factory).transfers(transfers)
    }

    /// Sets the delay between status polls.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Applies pool settings from `config`.
    #[must_use]
    pub const fn with_config(self, config: &PoolConfig) -> Self {
        self.poll_interval(config.poll_interval())
    }

    /// Builds the pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Config`] naming the first missing
    /// component.
    pub fn build(self) -> Result<DevicePool, ProvisioningError> {
        Ok(DevicePool {
            provisioning: Self::require(self.provisioning, "provision service")?,
            reservations: Self::require(self.reservations, "reservation service")?,
            connections: Self::require(self.connections, "connection factory")?,
            transfers: Self::require(self.transfers, "transfer agent factory")?,
            poll_interval: self.poll_interval,
        })
    }

    fn require<T>(value: Option<T>, component: &str) -> Result<T, ProvisioningError> {
        value.ok_or_else(|| ProvisioningError::Config(format!("device pool needs a {component}")))
    }
}
