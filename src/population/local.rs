//! Hand-maintained host population.

use std::collections::HashSet;

use tracing::debug;

use super::{HostListener, HostProvider, Membership, SubscriptionId};
use crate::model::Host;

/// A fixed host set that changes only when the owner edits it.
#[derive(Default)]
pub struct LocalHostProvider {
    membership: Membership,
}

impl LocalHostProvider {
    /// Creates a provider seeded with `hosts`.
    #[must_use]
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            membership: Membership::new(hosts),
        }
    }

    /// Adds a host, emitting one addition event when it is new.
    pub fn add_host(&self, host: Host) -> bool {
        self.membership.insert(host)
    }

    /// Removes a host, emitting one removal event when it was present.
    pub fn remove_host(&self, host: &Host) -> bool {
        self.membership.remove(host)
    }

    /// Replaces the whole set in one step.
    ///
    /// Listeners see a removal for every host that disappeared and an
    /// addition for every host that is new; unchanged hosts produce no event.
    pub fn reset(&self, hosts: impl IntoIterator<Item = Host>) {
        let (added, removed) = self.membership.reset(hosts.into_iter().collect());
        debug!(added, removed, "reset local host population");
    }
}

impl HostProvider for LocalHostProvider {
    fn hosts(&self) -> HashSet<Host> {
        self.membership.snapshot()
    }

    fn subscribe(&self, listener: HostListener) -> SubscriptionId {
        self.membership.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.membership.unsubscribe(id)
    }
}
