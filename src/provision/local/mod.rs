//! In-process provisioning engine.
//!
//! [`LocalProvisionService`] leases hosts from a population to provision
//! requests. Requests are queued by `provision` and fulfilled by one
//! background worker in arrival order; when no host is free the worker waits
//! for a release, which is the only backpressure in the system. A second
//! background task reaps requests whose lease has expired.
//!
//! The engine is single-process. Pair it with
//! [`LockingProvisionService`](super::LockingProvisionService) when several
//! processes share a host directory.

use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ProvisionService, ReservationService, ServiceFuture};
use crate::config::PoolConfig;
use crate::error::{ProvisioningError, ReservationError};
use crate::model::{Host, ProvisionInput, ProvisionOutput, Reservation};
use crate::population::{
    DelegatingHostProvider, HostChange, HostListener, HostProvider, LocalHostProvider,
    SubscriptionId,
};

mod state;
mod worker;

use state::{CachedEntry, Shared, deadline_after};
use worker::{WorkItem, run_fulfillment, run_reaper};

#[cfg(test)]
mod tests;

/// Lease length granted to new requests by default.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Period of the expiry sweep by default.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for [`LocalProvisionService`].
pub struct LocalProvisionServiceBuilder {
    hosts: Vec<Host>,
    provision_timeout: Duration,
    expire_provisions: bool,
    reap_interval: Duration,
    host_provider: Option<Arc<dyn HostProvider>>,
}

impl Default for LocalProvisionServiceBuilder {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            expire_provisions: true,
            reap_interval: DEFAULT_REAP_INTERVAL,
            host_provider: None,
        }
    }
}

impl LocalProvisionServiceBuilder {
    /// Adds static hosts.
    #[must_use]
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = Host>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    /// Adds one static host.
    #[must_use]
    pub fn host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    /// Sets how long a request may hold its hosts before it is reaped.
    #[must_use]
    pub const fn provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// Enables or disables the expiry sweep.
    #[must_use]
    pub const fn expire_provisions(mut self, enabled: bool) -> Self {
        self.expire_provisions = enabled;
        self
    }

    /// Sets the period of the expiry sweep.
    #[must_use]
    pub const fn reap_interval(mut self, period: Duration) -> Self {
        self.reap_interval = period;
        self
    }

    /// Draws additional hosts from a dynamic population.
    #[must_use]
    pub fn host_provider(mut self, provider: Arc<dyn HostProvider>) -> Self {
        self.host_provider = Some(provider);
        self
    }

    /// Applies the engine settings from `config`.
    #[must_use]
    pub fn with_config(self, config: &PoolConfig) -> Self {
        self.provision_timeout(config.provision_timeout())
            .expire_provisions(config.expire_provisions)
            .reap_interval(config.reap_interval())
    }

    /// Builds the engine and starts its background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::EmptyHosts`] when neither hosts nor a
    /// host provider were supplied, and [`ProvisioningError::Runtime`] when
    /// called outside a Tokio runtime.
    pub fn build(self) -> Result<LocalProvisionService, ProvisioningError> {
        if self.hosts.is_empty() && self.host_provider.is_none() {
            return Err(ProvisioningError::EmptyHosts);
        }
        let runtime =
            Handle::try_current().map_err(|err| ProvisioningError::Runtime(err.to_string()))?;
        let population: Arc<dyn HostProvider> = match self.host_provider {
            Some(upstream) => Arc::new(DelegatingHostProvider::new(self.hosts, upstream)),
            None => Arc::new(LocalHostProvider::new(self.hosts)),
        };
        let shared = Arc::new(Shared::new(
            population.hosts(),
            self.provision_timeout,
            Arc::clone(&population),
        ));
        let subscription = population.subscribe(change_listener(Arc::downgrade(&shared)));
        let shutdown = CancellationToken::new();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_fulfillment(
            Arc::clone(&shared),
            work_rx,
            shutdown.clone(),
        ));
        if self.expire_provisions {
            let period = self.reap_interval.max(Duration::from_millis(1));
            runtime.spawn(run_reaper(Arc::clone(&shared), period, shutdown.clone()));
        }
        info!(
            hosts = shared.lock_state().directory.len(),
            expire_provisions = self.expire_provisions,
            "provisioning engine started"
        );
        Ok(LocalProvisionService {
            shared,
            work_tx,
            shutdown,
            subscription,
        })
    }
}

fn change_listener(shared: Weak<Shared>) -> HostListener {
    Arc::new(move |change: HostChange, host: &Host| {
        if let Some(engine) = shared.upgrade() {
            engine.apply_change(change, host);
        }
    })
}

/// In-memory provisioning engine that is also its own host directory.
pub struct LocalProvisionService {
    shared: Arc<Shared>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    shutdown: CancellationToken,
    subscription: SubscriptionId,
}

impl LocalProvisionService {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> LocalProvisionServiceBuilder {
        LocalProvisionServiceBuilder::default()
    }

    /// Creates an engine over a static host set with default settings.
    ///
    /// # Errors
    ///
    /// See [`LocalProvisionServiceBuilder::build`].
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Result<Self, ProvisioningError> {
        Self::builder().hosts(hosts).build()
    }

    fn submit(&self, input: &ProvisionInput) -> Result<ProvisionOutput, ProvisioningError> {
        let id = input.id();
        let (snapshot, created) = {
            let mut state = self.shared.lock_state();
            match state.entries.entry(id.to_owned()) {
                Entry::Occupied(existing) => (existing.get().output.clone(), false),
                Entry::Vacant(slot) => {
                    let output = ProvisionOutput::of(id);
                    slot.insert(CachedEntry {
                        output: output.clone(),
                        expires_at: deadline_after(Instant::now(), self.shared.provision_timeout),
                    });
                    (output, true)
                }
            }
        };
        if !created {
            debug!(provision_id = id, status = %snapshot.status(), "provision request already known");
            return Ok(snapshot);
        }
        let queued = !self.shutdown.is_cancelled()
            && self
                .work_tx
                .send(WorkItem {
                    input: input.clone(),
                })
                .is_ok();
        if !queued {
            self.shared.lock_state().entries.remove(id);
            return Err(ProvisioningError::QueueClosed { id: id.to_owned() });
        }
        debug!(provision_id = id, amount = input.amount(), "queued provision request");
        Ok(snapshot)
    }

    fn lookup(&self, id: &str) -> Result<ProvisionOutput, ProvisioningError> {
        self.shared
            .lock_state()
            .entries
            .get(id)
            .map(|entry| entry.output.clone())
            .ok_or_else(|| ProvisioningError::NotFound { id: id.to_owned() })
    }

    /// Releases request `id` and returns how many hosts went back to the
    /// available queue. Unknown ids reclaim nothing.
    pub fn release_provision(&self, id: &str) -> usize {
        self.shared.release_provision(id)
    }

    /// Returns one host to the available queue ahead of its request.
    ///
    /// The request holding the host loses its reservation for it but stays
    /// active. Returns `false` when the host is already available or
    /// unknown.
    pub fn release_device(&self, device_id: &str) -> bool {
        self.shared.release_device(device_id)
    }

    /// Reclaims every request whose lease ended before `now` and returns how
    /// many requests were reaped. The background reaper calls this on a
    /// fixed period.
    pub fn release_expired(&self, now: Instant) -> usize {
        self.shared.release_expired(now)
    }

    /// Pushes a request's expiry back by the configured lease length.
    ///
    /// Returns `false` when the request is unknown.
    pub fn extend(&self, id: &str) -> bool {
        self.shared.extend(id)
    }

    /// Returns every host in the directory, leased or not.
    #[must_use]
    pub fn hosts(&self) -> Vec<Host> {
        self.shared
            .lock_state()
            .directory
            .values()
            .cloned()
            .collect()
    }

    /// Returns the hosts currently free to lease, in lease order.
    #[must_use]
    pub fn available_hosts(&self) -> Vec<Host> {
        self.shared.lock_state().available.iter().cloned().collect()
    }

    /// Returns how many requests are still tracked.
    #[must_use]
    pub fn active_provisions(&self) -> usize {
        self.shared.lock_state().entries.len()
    }

    /// Returns the population feeding this engine.
    #[must_use]
    pub fn host_provider(&self) -> Arc<dyn HostProvider> {
        Arc::clone(&self.shared.population)
    }

    /// Stops the background tasks. Hosts already leased stay leased.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("stopping provisioning engine");
            self.shutdown.cancel();
        }
    }
}

impl ProvisionService for LocalProvisionService {
    fn provision<'a>(
        &'a self,
        input: &'a ProvisionInput,
    ) -> ServiceFuture<'a, ProvisionOutput, ProvisioningError> {
        Box::pin(async move { self.submit(input) })
    }

    fn describe<'a>(
        &'a self,
        id: &'a str,
    ) -> ServiceFuture<'a, ProvisionOutput, ProvisioningError> {
        Box::pin(async move { self.lookup(id) })
    }

    fn release<'a>(&'a self, id: &'a str) -> ServiceFuture<'a, (), ProvisioningError> {
        Box::pin(async move {
            self.release_provision(id);
            Ok(())
        })
    }

    fn close(&self) -> ServiceFuture<'_, (), ProvisioningError> {
        Box::pin(async move {
            self.shutdown();
            Ok(())
        })
    }
}

impl ReservationService for LocalProvisionService {
    fn exchange<'a>(
        &'a self,
        reservation: &'a Reservation,
    ) -> ServiceFuture<'a, Host, ReservationError> {
        Box::pin(async move {
            self.shared
                .lock_state()
                .directory
                .get(&reservation.device_id)
                .cloned()
                .ok_or_else(|| ReservationError::HostNotFound {
                    device_id: reservation.device_id.clone(),
                })
        })
    }
}

impl Drop for LocalProvisionService {
    fn drop(&mut self) {
        self.shared.population.unsubscribe(self.subscription);
        self.shutdown.cancel();
    }
}
