//! Population layered over a shared upstream.

use std::collections::HashSet;
use std::sync::Arc;

use super::{HostChange, HostListener, HostProvider, Membership, SubscriptionId};
use crate::model::Host;

/// Keeps its own superset of an upstream population.
///
/// Upstream events are re-emitted only when they change this provider's
/// membership, so duplicates and stale removals from a shared upstream are
/// suppressed. Growth requests are forwarded upstream.
pub struct DelegatingHostProvider {
    membership: Arc<Membership>,
    upstream: Arc<dyn HostProvider>,
    subscription: SubscriptionId,
}

impl DelegatingHostProvider {
    /// Creates a provider holding `seed` plus every upstream host.
    #[must_use]
    pub fn new(seed: impl IntoIterator<Item = Host>, upstream: Arc<dyn HostProvider>) -> Self {
        let membership = Arc::new(Membership::new(seed));
        let downstream = Arc::clone(&membership);
        let listener: HostListener = Arc::new(move |change: HostChange, host: &Host| match change {
            HostChange::Added => {
                downstream.insert(host.clone());
            }
            HostChange::Removed => {
                downstream.remove(host);
            }
        });
        let subscription = upstream.subscribe(listener);
        for host in upstream.hosts() {
            membership.insert(host);
        }
        Self {
            membership,
            upstream,
            subscription,
        }
    }

    /// Returns the wrapped upstream population.
    #[must_use]
    pub fn upstream(&self) -> &Arc<dyn HostProvider> {
        &self.upstream
    }
}

impl HostProvider for DelegatingHostProvider {
    fn hosts(&self) -> HashSet<Host> {
        self.membership.snapshot()
    }

    fn request_growth(&self) {
        self.upstream.request_growth();
    }

    fn subscribe(&self, listener: HostListener) -> SubscriptionId {
        self.membership.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.membership.unsubscribe(id)
    }
}

impl Drop for DelegatingHostProvider {
    fn drop(&mut self) {
        self.upstream.unsubscribe(self.subscription);
    }
}
