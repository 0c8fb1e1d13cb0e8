//! Synchronous wait protocol over the asynchronous provisioning contract.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::DevicePool;
use crate::device::Device;
use crate::error::ProvisioningError;
use crate::model::{ProvisionInput, ProvisionOutput};
use crate::provision::ProvisionService;

async fn poll_until_terminal(
    service: Arc<dyn ProvisionService>,
    id: String,
    poll_interval: Duration,
) -> Result<ProvisionOutput, ProvisioningError> {
    loop {
        let output = service.describe(&id).await?;
        if output.status().is_terminal() {
            return Ok(output);
        }
        sleep(poll_interval).await;
    }
}

/// Stops the poller and releases the request if the waiting caller goes
/// away before the outcome is settled.
struct AbandonGuard {
    service: Arc<dyn ProvisionService>,
    id: String,
    poller: AbortHandle,
    armed: bool,
}

impl AbandonGuard {
    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        self.poller.abort();
        if !self.armed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(provision_id = %self.id, "runtime gone; cannot release abandoned request");
            return;
        };
        let service = Arc::clone(&self.service);
        let id = self.id.clone();
        warn!(provision_id = %id, "wait abandoned; releasing request");
        runtime.spawn(async move {
            if let Err(err) = service.release(&id).await {
                warn!(provision_id = %id, error = %err, "failed to release abandoned request");
            }
        });
    }
}

impl DevicePool {
    /// Provisions `input`, waits up to `limit` for it to finish, and opens
    /// its devices.
    ///
    /// Status polling runs on its own task every
    /// [`poll_interval`](Self::poll_interval). Whenever the call fails after
    /// the request was submitted, the request is released first, so no
    /// hosts stay leased. Dropping the returned future before it completes
    /// also releases the request.
    ///
    /// # Errors
    ///
    /// - [`ProvisioningError::Timeout`] when no terminal status arrives in
    ///   time.
    /// - [`ProvisioningError::Failed`] when the request ends in any terminal
    ///   status other than success.
    /// - [`ProvisioningError::Interrupted`] when the polling task dies.
    /// - The polling task's own error, for example
    ///   [`ProvisioningError::NotFound`] when the request was reaped.
    /// - Any error from [`DevicePool::obtain`].
    pub async fn provision_wait(
        &self,
        input: &ProvisionInput,
        limit: Duration,
    ) -> Result<Vec<Device>, ProvisioningError> {
        let submitted = self.provision(input).await?;
        let id = submitted.id().to_owned();
        let poller = tokio::spawn(poll_until_terminal(
            Arc::clone(&self.provisioning),
            id.clone(),
            self.poll_interval,
        ));
        let mut guard = AbandonGuard {
            service: Arc::clone(&self.provisioning),
            id: id.clone(),
            poller: poller.abort_handle(),
            armed: true,
        };

        let settled = match timeout(limit, poller).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(join_err)) => Err(ProvisioningError::Interrupted {
                id: id.clone(),
                message: join_err.to_string(),
            }),
            Err(_elapsed) => Err(ProvisioningError::Timeout { id: id.clone() }),
        };
        let outcome = settled.and_then(|output| {
            if output.succeeded() {
                Ok(output)
            } else {
                Err(ProvisioningError::Failed {
                    id: id.clone(),
                    status: output.status(),
                })
            }
        });

        let devices = match outcome {
            Ok(output) => {
                debug!(provision_id = %id, hosts = output.reservations().len(), "provision request succeeded");
                self.obtain(&output).await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &devices {
            info!(provision_id = %id, error = %err, "releasing request after failed wait");
            if let Err(release_err) = self.release(&id).await {
                warn!(provision_id = %id, error = %release_err, "failed to release request");
            }
        }
        guard.disarm();
        devices
    }
}
