//! Population paged in from an external host directory.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{HostListener, HostProvider, Membership, SubscriptionId};
use crate::config::PoolConfig;
use crate::error::PopulationError;
use crate::model::Host;
use crate::provision::ServiceFuture;

/// Number of new hosts one expansion pass may add.
pub const DEFAULT_LEASE_SIZE: usize = 20;

/// One page of hosts returned by an [`ExpansionFunction`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostPage {
    /// Hosts on this page.
    pub hosts: Vec<Host>,
    /// Token for the following page; `None` when this is the last page.
    pub next_token: Option<String>,
}

impl HostPage {
    /// Creates a page.
    #[must_use]
    pub const fn new(hosts: Vec<Host>, next_token: Option<String>) -> Self {
        Self { hosts, next_token }
    }
}

/// Paging contract over an external host directory.
///
/// `token` is `None` for the first page; `page_size` is the pass budget.
pub trait ExpansionFunction: Send + Sync {
    /// Fetches the page identified by `token`.
    fn next_page(
        &self,
        token: Option<String>,
        page_size: usize,
    ) -> ServiceFuture<'_, HostPage, PopulationError>;
}

impl<F, Fut> ExpansionFunction for F
where
    F: Fn(Option<String>, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HostPage, PopulationError>> + Send + 'static,
{
    fn next_page(
        &self,
        token: Option<String>,
        page_size: usize,
    ) -> ServiceFuture<'_, HostPage, PopulationError> {
        Box::pin(self(token, page_size))
    }
}

/// Outcome of one expansion pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExpansionSummary {
    /// Hosts that joined during the pass.
    pub added: usize,
    /// Hosts that were not seen again and left.
    pub removed: usize,
}

struct GrowthRequest {
    reply: Option<oneshot::Sender<Result<ExpansionSummary, PopulationError>>>,
}

struct Expansion {
    membership: Arc<Membership>,
    function: Box<dyn ExpansionFunction>,
    lease_size: usize,
}

impl Expansion {
    /// Runs one reconciliation pass.
    ///
    /// Every new host spends one unit of the lease budget. Known hosts that
    /// are seen again are kept; known hosts not seen before paging stops are
    /// removed. Paging stops when the budget is spent or the directory has
    /// no further pages, so one pass may not see the whole directory.
    async fn pass(&self) -> Result<ExpansionSummary, PopulationError> {
        let mut unseen = self.membership.snapshot();
        let mut leases = self.lease_size;
        let mut token = None;
        let mut summary = ExpansionSummary::default();
        info!(size = unseen.len(), "expanding host population");
        loop {
            let page = self.function.next_page(token, self.lease_size).await?;
            for host in page.hosts {
                if unseen.remove(&host) {
                    continue;
                }
                if self.membership.insert(host) {
                    summary.added += 1;
                    leases = leases.saturating_sub(1);
                }
            }
            token = page.next_token;
            if leases == 0 || token.is_none() {
                break;
            }
        }
        for host in &unseen {
            if self.membership.remove(host) {
                summary.removed += 1;
            }
        }
        info!(
            added = summary.added,
            removed = summary.removed,
            size = self.membership.len(),
            "expanded host population"
        );
        Ok(summary)
    }
}

async fn run_expansion(
    expansion: Expansion,
    mut requests: mpsc::UnboundedReceiver<GrowthRequest>,
    shutdown: CancellationToken,
) {
    debug!("host expansion worker started");
    loop {
        let request = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            received = requests.recv() => match received {
                Some(request) => request,
                None => break,
            },
        };
        let outcome = expansion.pass().await;
        if let Err(err) = &outcome {
            error!(error = %err, "failed to expand host population");
        }
        if let Some(reply) = request.reply
            && reply.send(outcome).is_err()
        {
            debug!("growth requester stopped waiting");
        }
    }
    debug!("host expansion worker stopped");
}

/// Population that grows by paging through an [`ExpansionFunction`].
///
/// Growth passes run one at a time on a dedicated background task, so
/// concurrent growth requests queue up rather than race.
pub struct ExpandingHostProvider {
    membership: Arc<Membership>,
    requests: mpsc::UnboundedSender<GrowthRequest>,
    shutdown: CancellationToken,
    lease_size: usize,
}

impl ExpandingHostProvider {
    /// Creates an empty provider with the default lease budget.
    ///
    /// # Errors
    ///
    /// Returns [`PopulationError::Runtime`] when called outside a Tokio
    /// runtime.
    pub fn new(function: impl ExpansionFunction + 'static) -> Result<Self, PopulationError> {
        Self::with_lease_size(function, DEFAULT_LEASE_SIZE)
    }

    /// Creates an empty provider that adds at most `lease_size` new hosts
    /// per pass and asks the directory for pages of that size.
    ///
    /// # Errors
    ///
    /// Returns [`PopulationError::Runtime`] when called outside a Tokio
    /// runtime.
    pub fn with_lease_size(
        function: impl ExpansionFunction + 'static,
        lease_size: usize,
    ) -> Result<Self, PopulationError> {
        let runtime =
            Handle::try_current().map_err(|err| PopulationError::Runtime(err.to_string()))?;
        let membership = Arc::new(Membership::default());
        let (requests, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let expansion = Expansion {
            membership: Arc::clone(&membership),
            function: Box::new(function),
            lease_size: lease_size.max(1),
        };
        runtime.spawn(run_expansion(expansion, receiver, shutdown.clone()));
        Ok(Self {
            membership,
            requests,
            shutdown,
            lease_size: lease_size.max(1),
        })
    }

    /// Creates an empty provider sized by `expansion_page_size`.
    ///
    /// # Errors
    ///
    /// Returns [`PopulationError::Runtime`] when called outside a Tokio
    /// runtime.
    pub fn with_config(
        function: impl ExpansionFunction + 'static,
        config: &PoolConfig,
    ) -> Result<Self, PopulationError> {
        Self::with_lease_size(function, config.expansion_page_size)
    }

    /// Returns the per-pass lease budget.
    #[must_use]
    pub const fn lease_size(&self) -> usize {
        self.lease_size
    }

    /// Queues one expansion pass and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`PopulationError::WorkerStopped`] when the worker has shut
    /// down, or the paging function's error when the pass failed.
    pub async fn grow(&self) -> Result<ExpansionSummary, PopulationError> {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(GrowthRequest { reply: Some(reply) })
            .map_err(|_| PopulationError::WorkerStopped)?;
        outcome.await.map_err(|_| PopulationError::WorkerStopped)?
    }

    /// Stops the expansion worker. Queued passes are discarded.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl HostProvider for ExpandingHostProvider {
    fn hosts(&self) -> HashSet<Host> {
        self.membership.snapshot()
    }

    fn request_growth(&self) {
        if self.requests.send(GrowthRequest { reply: None }).is_err() {
            debug!("growth requested after the expansion worker stopped");
        }
    }

    fn subscribe(&self, listener: HostListener) -> SubscriptionId {
        self.membership.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.membership.unsubscribe(id)
    }
}

impl Drop for ExpandingHostProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
