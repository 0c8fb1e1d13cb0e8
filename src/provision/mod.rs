//! Provisioning and reservation-exchange contracts.
//!
//! A provisioning service turns a [`ProvisionInput`] into reservations over
//! time; a reservation service turns each reservation into a concrete
//! [`Host`]. The in-process engine in [`local`] implements both, while the
//! decorator in [`locking`] adds cross-process mutual exclusion around any
//! provisioning service.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{ProvisioningError, ReservationError};
use crate::model::{Host, ProvisionInput, ProvisionOutput, Reservation};

pub mod local;
pub mod locking;

pub use local::{LocalProvisionService, LocalProvisionServiceBuilder};
pub use locking::LockingProvisionService;

/// Future returned by service contracts.
pub type ServiceFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Creates, inspects, and releases provision requests.
pub trait ProvisionService: Send + Sync {
    /// Submits a request and returns its current, usually non-terminal,
    /// snapshot without waiting for hosts.
    fn provision<'a>(
        &'a self,
        input: &'a ProvisionInput,
    ) -> ServiceFuture<'a, ProvisionOutput, ProvisioningError>;

    /// Returns the latest snapshot of a request.
    ///
    /// Unknown ids fail with [`ProvisioningError::NotFound`].
    fn describe<'a>(&'a self, id: &'a str)
    -> ServiceFuture<'a, ProvisionOutput, ProvisioningError>;

    /// Releases a request and everything it was granted. Releasing an
    /// unknown or already released id is not an error.
    fn release<'a>(&'a self, id: &'a str) -> ServiceFuture<'a, (), ProvisioningError>;

    /// Stops any background work owned by the service.
    fn close(&self) -> ServiceFuture<'_, (), ProvisioningError> {
        Box::pin(async { Ok(()) })
    }
}

/// Exchanges reservations for the hosts they name.
pub trait ReservationService: Send + Sync {
    /// Resolves a reservation to its host.
    fn exchange<'a>(
        &'a self,
        reservation: &'a Reservation,
    ) -> ServiceFuture<'a, Host, ReservationError>;
}

impl<T: ProvisionService + ?Sized> ProvisionService for Arc<T> {
    fn provision<'a>(
        &'a self,
        input: &'a ProvisionInput,
    ) -> ServiceFuture<'a, ProvisionOutput, ProvisioningError> {
        (**self).provision(input)
    }

    fn describe<'a>(
        &'a self,
        id: &'a str,
    ) -> ServiceFuture<'a, ProvisionOutput, ProvisioningError> {
        (**self).describe(id)
    }

    fn release<'a>(&'a self, id: &'a str) -> ServiceFuture<'a, (), ProvisioningError> {
        (**self).release(id)
    }

    fn close(&self) -> ServiceFuture<'_, (), ProvisioningError> {
        (**self).close()
    }
}

impl<T: ReservationService + ?Sized> ReservationService for Arc<T> {
    fn exchange<'a>(
        &'a self,
        reservation: &'a Reservation,
    ) -> ServiceFuture<'a, Host, ReservationError> {
        (**self).exchange(reservation)
    }
}
