//! Background tasks owned by the provisioning engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::{Lease, Shared};
use crate::model::ProvisionInput;

/// A submitted request waiting for fulfillment.
pub(super) struct WorkItem {
    pub(super) input: ProvisionInput,
}

/// Grants hosts to queued requests one request at a time, in arrival order.
pub(super) async fn run_fulfillment(
    shared: Arc<Shared>,
    mut work: mpsc::UnboundedReceiver<WorkItem>,
    shutdown: CancellationToken,
) {
    info!("fulfillment worker started");
    loop {
        let item = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            received = work.recv() => match received {
                Some(item) => item,
                None => break,
            },
        };
        if !fulfil(&shared, &item.input, &shutdown).await {
            break;
        }
    }
    info!("fulfillment worker stopped");
}

/// Returns `false` when shutdown interrupted the request.
async fn fulfil(shared: &Shared, input: &ProvisionInput, shutdown: &CancellationToken) -> bool {
    let id = input.id();
    if !shared.mark_provisioning(id) {
        debug!(provision_id = id, "skipping released provision request");
        return true;
    }
    for granted in 1..=input.amount() {
        match shared
            .lease_next(id, granted == input.amount(), shutdown)
            .await
        {
            Lease::Granted(host) => {
                debug!(
                    provision_id = id,
                    device_id = %host.device_id,
                    granted,
                    requested = input.amount(),
                    "leased host"
                );
            }
            Lease::Abandoned => {
                debug!(provision_id = id, granted = granted - 1, "provision request released mid-flight");
                return true;
            }
            Lease::Stopped => return false,
        }
    }
    true
}

/// Periodically reclaims requests whose lease has expired.
pub(super) async fn run_reaper(
    shared: Arc<Shared>,
    period: Duration,
    shutdown: CancellationToken,
) {
    info!(period_ms = period.as_millis(), "reaper started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let reaped = shared.release_expired(Instant::now());
        debug!(reaped, "reaper pass complete");
    }
    info!("reaper stopped");
}
