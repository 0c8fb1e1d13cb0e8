//! Shared engine state and the leasing protocol.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{Host, ProvisionOutput, Reservation, Status};
use crate::population::{HostChange, HostProvider};

/// Lease expiry used when adding a timeout would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

pub(super) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// A request still tracked by the engine.
#[derive(Clone, Debug)]
pub(super) struct CachedEntry {
    pub(super) output: ProvisionOutput,
    pub(super) expires_at: Instant,
}

#[derive(Default)]
pub(super) struct EngineState {
    pub(super) entries: HashMap<String, CachedEntry>,
    pub(super) available: VecDeque<Host>,
    /// Every leasable host by device id, leased or not.
    pub(super) directory: HashMap<String, Host>,
}

impl EngineState {
    /// Returns a host to the available queue unless it is already there or
    /// has left the population.
    fn reclaim(&mut self, device_id: &str) -> bool {
        let Some(host) = self.directory.get(device_id) else {
            return false;
        };
        if self.available.contains(host) {
            return false;
        }
        self.available.push_back(host.clone());
        true
    }

    /// Returns `true` when an active request holds a reservation for the
    /// device.
    fn is_leased(&self, device_id: &str) -> bool {
        self.entries.values().any(|entry| {
            entry
                .output
                .reservations()
                .iter()
                .any(|reservation| reservation.device_id == device_id)
        })
    }

    /// Drops the device from whichever request holds it, returning that
    /// request's id.
    fn detach(&mut self, device_id: &str) -> Option<String> {
        let (id, entry) = self.entries.iter_mut().find(|(_, entry)| {
            entry
                .output
                .reservations()
                .iter()
                .any(|reservation| reservation.device_id == device_id)
        })?;
        entry.output = entry.output.without_device(device_id);
        Some(id.clone())
    }

    fn release_entry(&mut self, id: &str) -> Option<usize> {
        let entry = self.entries.remove(id)?;
        Some(
            entry
                .output
                .reservations()
                .iter()
                .filter(|reservation| self.reclaim(&reservation.device_id))
                .count(),
        )
    }
}

/// Outcome of one attempt to grant a host to a request.
pub(super) enum Lease {
    Granted(Host),
    Abandoned,
    Stopped,
}

pub(super) struct Shared {
    state: Mutex<EngineState>,
    host_released: Notify,
    pub(super) provision_timeout: Duration,
    pub(super) population: Arc<dyn HostProvider>,
}

impl Shared {
    pub(super) fn new(
        hosts: impl IntoIterator<Item = Host>,
        provision_timeout: Duration,
        population: Arc<dyn HostProvider>,
    ) -> Self {
        let mut state = EngineState::default();
        for host in hosts {
            if let Entry::Vacant(slot) = state.directory.entry(host.device_id.clone()) {
                slot.insert(host.clone());
                state.available.push_back(host);
            }
        }
        Self {
            state: Mutex::new(state),
            host_released: Notify::new(),
            provision_timeout,
            population,
        }
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a request to `Provisioning`, returning `false` when it has been
    /// released in the meantime.
    pub(super) fn mark_provisioning(&self, id: &str) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        entry.output = entry.output.with_status(Status::Provisioning);
        true
    }

    /// Grants one free host to request `id`, waiting for a release when none
    /// is free.
    ///
    /// The entry check and the host hand-off happen under one lock, so a host
    /// never leaves the available queue for a request that no longer exists.
    pub(super) async fn lease_next(
        &self,
        id: &str,
        last: bool,
        shutdown: &CancellationToken,
    ) -> Lease {
        let mut growth_requested = false;
        loop {
            let granted = {
                let mut state = self.lock_state();
                if !state.entries.contains_key(id) {
                    return Lease::Abandoned;
                }
                let host = state.available.pop_front();
                if let (Some(host), Some(entry)) = (&host, state.entries.get_mut(id)) {
                    let status = if last {
                        Status::Succeeded
                    } else {
                        Status::Provisioning
                    };
                    entry.output = entry.output.with_reservation(
                        Reservation::new(host.device_id.clone(), Status::Succeeded),
                        status,
                    );
                }
                host
            };
            if let Some(host) = granted {
                return Lease::Granted(host);
            }
            if !growth_requested {
                debug!(provision_id = id, "no free host, requesting growth");
                self.population.request_growth();
                growth_requested = true;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Lease::Stopped,
                () = self.host_released.notified() => {}
            }
        }
    }

    /// Removes request `id` and returns its hosts to the available queue.
    pub(super) fn release_provision(&self, id: &str) -> usize {
        let released = self.lock_state().release_entry(id);
        self.host_released.notify_one();
        match released {
            Some(reclaimed) => {
                info!(provision_id = id, reclaimed, "released provision request");
                reclaimed
            }
            None => {
                debug!(provision_id = id, "release of unknown provision request");
                0
            }
        }
    }

    /// Takes the device back from the request holding it, if any, and
    /// returns it to the available queue.
    pub(super) fn release_device(&self, device_id: &str) -> bool {
        let (holder, reclaimed) = {
            let mut state = self.lock_state();
            let holder = state.detach(device_id);
            (holder, state.reclaim(device_id))
        };
        if reclaimed {
            debug!(device_id, provision_id = ?holder, "released device");
            self.host_released.notify_one();
        }
        reclaimed
    }

    /// Releases every request whose lease ended before `now`.
    pub(super) fn release_expired(&self, now: Instant) -> usize {
        let mut reaped = 0;
        {
            let mut state = self.lock_state();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at < now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(reclaimed) = state.release_entry(&id) {
                    info!(provision_id = %id, reclaimed, "reaped expired provision request");
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            self.host_released.notify_one();
        }
        reaped
    }

    pub(super) fn extend(&self, id: &str) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        entry.expires_at = deadline_after(entry.expires_at, self.provision_timeout);
        true
    }

    /// Mirrors a population change into the directory and available queue.
    pub(super) fn apply_change(&self, change: HostChange, host: &Host) {
        match change {
            HostChange::Added => {
                let added = {
                    let mut state = self.lock_state();
                    if state.directory.get(&host.device_id) == Some(host) {
                        false
                    } else {
                        state
                            .directory
                            .insert(host.device_id.clone(), host.clone());
                        state
                            .available
                            .retain(|queued| queued.device_id != host.device_id);
                        let leased = state.is_leased(&host.device_id);
                        if !leased {
                            state.available.push_back(host.clone());
                        }
                        !leased
                    }
                };
                if added {
                    debug!(device_id = %host.device_id, "host joined the pool");
                    self.host_released.notify_one();
                }
            }
            HostChange::Removed => {
                let mut state = self.lock_state();
                if state.directory.get(&host.device_id) == Some(host) {
                    state.directory.remove(&host.device_id);
                    state.available.retain(|queued| queued != host);
                    warn!(device_id = %host.device_id, "host left the pool");
                }
            }
        }
    }
}
