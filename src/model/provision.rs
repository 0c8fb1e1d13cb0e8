//! Provision requests, their lifecycle status, and reservation snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ModelError;

/// Lifecycle status shared by provision requests and individual reservations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Accepted but not yet picked up for fulfillment.
    Requested,
    /// Hosts are being granted.
    Provisioning,
    /// A cancellation was requested (remote control planes only).
    Canceling,
    /// Cancellation completed.
    Canceled,
    /// Every requested host was granted.
    Succeeded,
    /// Fulfillment gave up.
    Failed,
}

impl Status {
    /// Returns `true` for statuses that never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Returns the wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Provisioning => "PROVISIONING",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Derives an aggregate status from individual reservations.
    ///
    /// Any failed reservation fails the whole request and any non-terminal
    /// one keeps it provisioning; otherwise the last terminal status wins.
    /// An empty list is still `Requested`.
    #[must_use]
    pub fn summarize(reservations: &[Reservation]) -> Self {
        let mut status = Self::Requested;
        for reservation in reservations {
            if !reservation.status.is_terminal() {
                return Self::Provisioning;
            }
            if reservation.status == Self::Failed {
                return Self::Failed;
            }
            status = reservation.status;
        }
        status
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host's binding to a provision request.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    /// Device identifier of the granted host.
    pub device_id: String,
    /// Status of this particular grant.
    pub status: Status,
}

impl Reservation {
    /// Creates a reservation.
    #[must_use]
    pub fn new(device_id: impl Into<String>, status: Status) -> Self {
        Self {
            device_id: device_id.into(),
            status,
        }
    }
}

/// A caller's ask for a number of hosts.
///
/// The id is caller supplied so a request can be resubmitted idempotently.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProvisionInput {
    id: String,
    amount: usize,
}

impl ProvisionInput {
    /// Creates a request with an explicit id and amount.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Validation`] for a blank id and
    /// [`ModelError::InvalidAmount`] when `amount` is zero.
    pub fn new(id: impl Into<String>, amount: usize) -> Result<Self, ModelError> {
        let trimmed = id.into().trim().to_owned();
        if trimmed.is_empty() {
            return Err(ModelError::Validation("id".to_owned()));
        }
        if amount == 0 {
            return Err(ModelError::InvalidAmount);
        }
        Ok(Self {
            id: trimmed,
            amount,
        })
    }

    /// Creates a request for a single host under a random id.
    #[must_use]
    pub fn create() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            amount: 1,
        }
    }

    /// Creates a request for `amount` hosts under a random id.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidAmount`] when `amount` is zero.
    pub fn with_amount(amount: usize) -> Result<Self, ModelError> {
        Self::new(Uuid::new_v4().to_string(), amount)
    }

    /// Returns the request id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the number of hosts requested.
    #[must_use]
    pub const fn amount(&self) -> usize {
        self.amount
    }
}

/// Snapshot of a provision request's progress.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProvisionOutput {
    id: String,
    status: Status,
    reservations: Vec<Reservation>,
}

impl ProvisionOutput {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(id: impl Into<String>, status: Status, reservations: Vec<Reservation>) -> Self {
        Self {
            id: id.into(),
            status,
            reservations,
        }
    }

    /// Creates a `Requested` handle carrying only an id, for lookups.
    #[must_use]
    pub fn of(id: impl Into<String>) -> Self {
        Self::new(id, Status::Requested, Vec::new())
    }

    /// Returns the request id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the overall status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Returns the reservations accumulated so far, in grant order.
    #[must_use]
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Returns `true` when the request succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == Status::Succeeded
    }

    /// Returns a new snapshot with a different overall status.
    #[must_use]
    pub fn with_status(&self, status: Status) -> Self {
        Self {
            id: self.id.clone(),
            status,
            reservations: self.reservations.clone(),
        }
    }

    /// Returns a new snapshot with `reservation` appended and the overall
    /// status replaced.
    #[must_use]
    pub fn with_reservation(&self, reservation: Reservation, status: Status) -> Self {
        let mut reservations = Vec::with_capacity(self.reservations.len() + 1);
        reservations.extend(self.reservations.iter().cloned());
        reservations.push(reservation);
        Self {
            id: self.id.clone(),
            status,
            reservations,
        }
    }

    /// Returns a new snapshot without any reservation for `device_id`.
    #[must_use]
    pub fn without_device(&self, device_id: &str) -> Self {
        Self {
            id: self.id.clone(),
            status: self.status,
            reservations: self
                .reservations
                .iter()
                .filter(|reservation| reservation.device_id != device_id)
                .cloned()
                .collect(),
        }
    }
}
