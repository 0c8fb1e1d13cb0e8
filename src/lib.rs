//! Pool of remote devices behind an asynchronous provisioning contract.
//!
//! Callers submit a [`ProvisionInput`] to a [`ProvisionService`], poll the
//! request until it reaches a terminal [`Status`], and exchange the granted
//! reservations for [`Device`] handles that run commands and copy files.
//! [`DevicePool`] wraps the whole lifecycle, including a bounded
//! `provision_wait`.
//!
//! [`LocalProvisionService`] is the in-process engine. It leases hosts from a
//! host population ([`LocalHostProvider`], [`ExpandingHostProvider`] or
//! [`DelegatingHostProvider`]), expires idle requests, and reclaims hosts on
//! release. [`LockingProvisionService`] serialises provisioning across
//! callers, and the [`ssh`] module provides a data path over the system
//! `ssh` and `scp` clients.

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod lock;
pub mod model;
pub mod observability;
pub mod pool;
pub mod population;
pub mod provision;
pub mod ssh;
pub mod test_support;

pub use config::{ConfigError, PoolConfig};
pub use connection::{
    Connection, ConnectionFactory, ContentTransferAgent, ContentTransferAgentFactory,
};
pub use device::Device;
pub use error::{
    ConnectionError, DeviceError, LockingError, PopulationError, ProvisioningError,
    ReservationError, TransferError,
};
pub use lock::{LocalLockingService, LockGuard, LockInput, LockingService};
pub use model::{
    CommandInput, CommandOutput, CopyInput, CopyOption, Host, HostBuilder, ModelError, PlatformOs,
    ProvisionInput, ProvisionOutput, Reservation, Status,
};
pub use observability::{LoggingError, init_tracing};
pub use pool::{DevicePool, DevicePoolBuilder};
pub use population::{
    DelegatingHostProvider, ExpandingHostProvider, ExpansionFunction, HostChange, HostListener,
    HostPage, HostProvider, LocalHostProvider, SubscriptionId,
};
pub use provision::{
    LocalProvisionService, LocalProvisionServiceBuilder, LockingProvisionService,
    ProvisionService, ReservationService, ServiceFuture,
};
pub use ssh::{SshConfig, SshConnectionFactory};
