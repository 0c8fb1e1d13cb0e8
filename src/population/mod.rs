//! Observable host populations.
//!
//! A population owns the set of hosts a provisioning engine may lease and
//! notifies subscribers whenever a host joins or leaves. Three providers are
//! available: [`LocalHostProvider`] for a fixed set mutated by hand,
//! [`ExpandingHostProvider`] for a set paged in from an external directory,
//! and [`DelegatingHostProvider`] for layering a local superset over a
//! shared upstream.
//!
//! Listeners run while the provider's membership lock is held, so mutation
//! and dispatch never interleave. A listener must not call back into the
//! provider that is notifying it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

mod delegating;
mod expanding;
mod local;

pub use delegating::DelegatingHostProvider;
pub use expanding::{
    DEFAULT_LEASE_SIZE, ExpandingHostProvider, ExpansionFunction, ExpansionSummary, HostPage,
};
pub use local::LocalHostProvider;

use crate::model::Host;


/// Kind of membership change reported to listeners.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HostChange {
    /// The host joined the population.
    Added,
    /// The host left the population.
    Removed,
}

/// Callback invoked once per membership change.
pub type HostListener = Arc<dyn Fn(HostChange, &Host) + Send + Sync>;

/// Handle returned by [`HostProvider::subscribe`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

/// A set of hosts that can change over time.
pub trait HostProvider: Send + Sync {
    /// Returns a snapshot of the current members.
    fn hosts(&self) -> HashSet<Host>;

    /// Hints that more hosts are wanted. Providers that cannot grow ignore it.
    fn request_growth(&self) {}

    /// Registers a listener for membership changes.
    ///
    /// Listeners run while the provider's membership lock is held. A
    /// listener must not call back into the provider that notifies it;
    /// doing so deadlocks.
    fn subscribe(&self, listener: HostListener) -> SubscriptionId;

    /// Removes a listener, returning `false` when it was not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

#[derive(Default)]
struct MembershipState {
    hosts: HashSet<Host>,
    listeners: Vec<(SubscriptionId, HostListener)>,
    next_subscription: u64,
}

impl MembershipState {
    fn emit(&self, change: HostChange, host: &Host) {
        for (_, listener) in &self.listeners {
            listener(change, host);
        }
    }
}

/// Host set and listener registry guarded by one lock.
#[derive(Default)]
pub(crate) struct Membership {
    state: Mutex<MembershipState>,
}

impl Membership {
    pub(crate) fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            state: Mutex::new(MembershipState {
                hosts: hosts.into_iter().collect(),
                ..MembershipState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MembershipState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> HashSet<Host> {
        self.lock().hosts.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().hosts.len()
    }

    pub(crate) fn subscribe(&self, listener: HostListener) -> SubscriptionId {
        let mut state = self.lock();
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        state.listeners.push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(candidate, _)| *candidate != id);
        state.listeners.len() != before
    }

    /// Adds `host`, notifying listeners only when it was not already present.
    pub(crate) fn insert(&self, host: Host) -> bool {
        let mut state = self.lock();
        if state.hosts.contains(&host) {
            return false;
        }
        state.hosts.insert(host.clone());
        state.emit(HostChange::Added, &host);
        true
    }

    /// Removes `host`, notifying listeners only when it was present.
    pub(crate) fn remove(&self, host: &Host) -> bool {
        let mut state = self.lock();
        let Some(removed) = state.hosts.take(host) else {
            return false;
        };
        state.emit(HostChange::Removed, &removed);
        true
    }

    /// Replaces the membership, notifying removals before additions.
    ///
    /// Returns the number of hosts added and removed.
    pub(crate) fn reset(&self, hosts: HashSet<Host>) -> (usize, usize) {
        let mut state = self.lock();
        let removed: Vec<Host> = state.hosts.difference(&hosts).cloned().collect();
        let added: Vec<Host> = hosts.difference(&state.hosts).cloned().collect();
        for host in &removed {
            state.emit(HostChange::Removed, host);
        }
        for host in &added {
            state.emit(HostChange::Added, host);
        }
        state.hosts = hosts;
        (added.len(), removed.len())
    }
}
