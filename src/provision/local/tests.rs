//! Unit tests for the in-process provisioning engine.

use std::sync::atomic::{AtomicUsize, Ordering};

use rstest::{fixture, rstest};
use tokio::time::sleep;

use super::*;
use crate::error::PopulationError;
use crate::model::Status;
use crate::population::{ExpandingHostProvider, HostPage};
use crate::test_support::{sample_host, sample_hosts, wait_for_terminal};

const SETTLE: Duration = Duration::from_secs(5);

#[fixture]
fn three_hosts() -> Vec<Host> {
    sample_hosts(1..=3)
}

fn request(id: &str, amount: usize) -> ProvisionInput {
    ProvisionInput::new(id, amount).expect("valid input")
}

async fn succeeded(engine: &LocalProvisionService, id: &str) -> ProvisionOutput {
    let output = wait_for_terminal(engine, id, SETTLE)
        .await
        .expect("request should settle");
    assert_eq!(output.status(), Status::Succeeded, "request {id}");
    output
}

#[tokio::test]
async fn build_rejects_empty_host_set() {
    let result = LocalProvisionService::builder().build();
    assert!(matches!(result, Err(ProvisioningError::EmptyHosts)));
}

#[rstest]
fn build_requires_a_runtime(three_hosts: Vec<Host>) {
    let result = LocalProvisionService::new(three_hosts);
    assert!(matches!(result, Err(ProvisioningError::Runtime(_))));
}

#[rstest]
#[tokio::test]
async fn provision_starts_requested_and_succeeds(three_hosts: Vec<Host>) {
    let engine = LocalProvisionService::new(three_hosts).expect("engine builds");
    let input = request("req-1", 2);

    let submitted = engine.provision(&input).await.expect("submit succeeds");
    assert_eq!(submitted.id(), "req-1");
    assert_eq!(submitted.status(), Status::Requested);
    assert!(submitted.reservations().is_empty());

    let output = succeeded(&engine, "req-1").await;
    assert_eq!(output.reservations().len(), 2);
    assert!(
        output
            .reservations()
            .iter()
            .all(|reservation| reservation.status == Status::Succeeded)
    );
    assert_eq!(engine.available_hosts().len(), 1);
}

#[rstest]
#[tokio::test]
async fn resubmission_returns_snapshot_without_requeueing(three_hosts: Vec<Host>) {
    let engine = LocalProvisionService::new(three_hosts).expect("engine builds");
    let input = request("req-1", 1);
    engine.provision(&input).await.expect("first submit");
    succeeded(&engine, "req-1").await;

    let again = engine.provision(&input).await.expect("second submit");
    assert_eq!(again.status(), Status::Succeeded);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.active_provisions(), 1);
    assert_eq!(engine.available_hosts().len(), 2);
}

#[rstest]
#[tokio::test]
async fn release_reclaims_hosts_exactly_once(three_hosts: Vec<Host>) {
    let engine = LocalProvisionService::new(three_hosts).expect("engine builds");
    engine
        .provision(&request("req-1", 2))
        .await
        .expect("submit succeeds");
    succeeded(&engine, "req-1").await;

    assert_eq!(engine.release_provision("req-1"), 2);
    assert_eq!(engine.release_provision("req-1"), 0);
    assert_eq!(engine.available_hosts().len(), 3);

    let err = engine.describe("req-1").await.expect_err("entry removed");
    assert_eq!(
        err,
        ProvisioningError::NotFound {
            id: "req-1".to_owned()
        }
    );
    engine.release("never-submitted").await.expect("unknown release is fine");
}

#[tokio::test(start_paused = true)]
async fn waiting_request_is_served_after_release() {
    let engine = LocalProvisionService::new([sample_host(1)]).expect("engine builds");
    engine.provision(&request("a", 1)).await.expect("submit a");
    succeeded(&engine, "a").await;

    engine.provision(&request("b", 1)).await.expect("submit b");
    sleep(Duration::from_secs(1)).await;
    assert_eq!(
        engine.describe("b").await.expect("b known").status(),
        Status::Provisioning
    );

    engine.release("a").await.expect("release a");
    let output = succeeded(&engine, "b").await;
    assert_eq!(
        output.reservations(),
        [Reservation::new("host-1", Status::Succeeded)]
    );
}

#[tokio::test(start_paused = true)]
async fn request_released_mid_flight_takes_no_host() {
    let engine = LocalProvisionService::new([sample_host(1)]).expect("engine builds");
    engine.provision(&request("a", 1)).await.expect("submit a");
    succeeded(&engine, "a").await;
    engine.provision(&request("b", 1)).await.expect("submit b");
    sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.release_provision("b"), 0);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.release_provision("a"), 1);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.available_hosts(), vec![sample_host(1)]);
    assert_eq!(engine.active_provisions(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn release_expired_reaps_only_stale_requests(three_hosts: Vec<Host>) {
    let engine = LocalProvisionService::builder()
        .hosts(three_hosts)
        .expire_provisions(false)
        .provision_timeout(Duration::from_secs(10))
        .build()
        .expect("engine builds");
    engine.provision(&request("a", 2)).await.expect("submit a");
    succeeded(&engine, "a").await;

    assert_eq!(engine.release_expired(Instant::now()), 0);
    assert_eq!(
        engine.release_expired(Instant::now() + Duration::from_secs(11)),
        1
    );
    assert_eq!(engine.available_hosts().len(), 3);
    assert!(engine.describe("a").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn background_reaper_expires_idle_requests() {
    let engine = LocalProvisionService::builder()
        .host(sample_host(1))
        .provision_timeout(Duration::from_secs(5))
        .reap_interval(Duration::from_secs(1))
        .build()
        .expect("engine builds");
    engine.provision(&request("a", 1)).await.expect("submit a");
    succeeded(&engine, "a").await;

    sleep(Duration::from_secs(7)).await;

    assert!(matches!(
        engine.describe("a").await,
        Err(ProvisioningError::NotFound { .. })
    ));
    assert_eq!(engine.available_hosts(), vec![sample_host(1)]);
}

#[tokio::test(start_paused = true)]
async fn extend_pushes_expiry_back() {
    let engine = LocalProvisionService::builder()
        .host(sample_host(1))
        .expire_provisions(false)
        .provision_timeout(Duration::from_secs(10))
        .build()
        .expect("engine builds");
    let start = Instant::now();
    engine.provision(&request("a", 1)).await.expect("submit a");

    assert!(engine.extend("a"));
    assert!(!engine.extend("missing"));
    assert_eq!(engine.release_expired(start + Duration::from_secs(15)), 0);
    assert_eq!(engine.release_expired(start + Duration::from_secs(25)), 1);
}

#[rstest]
#[tokio::test]
async fn exchange_resolves_directory_hosts(three_hosts: Vec<Host>) {
    let engine = LocalProvisionService::new(three_hosts).expect("engine builds");
    engine.provision(&request("a", 1)).await.expect("submit a");
    let output = succeeded(&engine, "a").await;
    let reservation = output.reservations().first().expect("one reservation");

    let host = engine.exchange(reservation).await.expect("host resolves");
    assert_eq!(host.device_id, reservation.device_id);

    let err = engine
        .exchange(&Reservation::new("ghost", Status::Succeeded))
        .await
        .expect_err("unknown device");
    assert_eq!(
        err,
        ReservationError::HostNotFound {
            device_id: "ghost".to_owned()
        }
    );
}

#[tokio::test]
async fn release_device_returns_a_single_host() {
    let engine = LocalProvisionService::new([sample_host(1)]).expect("engine builds");
    engine.provision(&request("a", 1)).await.expect("submit a");
    succeeded(&engine, "a").await;
    assert!(engine.available_hosts().is_empty());

    assert!(engine.release_device("host-1"));
    assert!(!engine.release_device("host-1"));
    assert!(!engine.release_device("ghost"));
    assert_eq!(engine.active_provisions(), 1);
    let holder = engine.describe("a").await.expect("a is still active");
    assert!(holder.reservations().is_empty());
}

#[tokio::test]
async fn released_device_is_never_shared() {
    let engine = LocalProvisionService::new([sample_host(1)]).expect("engine builds");
    engine.provision(&request("a", 1)).await.expect("submit a");
    succeeded(&engine, "a").await;
    assert!(engine.release_device("host-1"));

    engine.provision(&request("b", 1)).await.expect("submit b");
    succeeded(&engine, "b").await;
    assert_eq!(engine.release_provision("a"), 0);
    assert!(engine.available_hosts().is_empty());

    engine.provision(&request("c", 1)).await.expect("submit c");
    sleep(Duration::from_millis(50)).await;
    let waiting = engine.describe("c").await.expect("c is tracked");
    assert!(waiting.reservations().is_empty());

    assert_eq!(engine.release_provision("b"), 1);
    let output = succeeded(&engine, "c").await;
    assert_eq!(output.reservations().len(), 1);
    assert_eq!(engine.active_provisions(), 1);
}

#[rstest]
#[tokio::test]
async fn shutdown_closes_the_queue(three_hosts: Vec<Host>) {
    let engine = LocalProvisionService::new(three_hosts).expect("engine builds");
    engine.close().await.expect("close succeeds");

    let err = engine
        .provision(&request("late", 1))
        .await
        .expect_err("queue closed");
    assert_eq!(
        err,
        ProvisioningError::QueueClosed {
            id: "late".to_owned()
        }
    );
    assert_eq!(engine.active_provisions(), 0);
}

#[tokio::test]
async fn provider_changes_reach_the_engine() {
    let provider = Arc::new(LocalHostProvider::default());
    let engine = LocalProvisionService::builder()
        .host_provider(Arc::clone(&provider) as Arc<dyn HostProvider>)
        .build()
        .expect("provider alone is enough");
    assert!(engine.hosts().is_empty());

    engine.provision(&request("a", 1)).await.expect("submit a");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        engine.describe("a").await.expect("a known").status(),
        Status::Provisioning
    );

    provider.add_host(sample_host(1));
    succeeded(&engine, "a").await;

    provider.remove_host(&sample_host(1));
    assert!(engine.hosts().is_empty());
    assert_eq!(engine.release_provision("a"), 0);
    assert!(engine.available_hosts().is_empty());
}

#[tokio::test]
async fn exhausted_engine_asks_population_to_grow() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let expanding = ExpandingHostProvider::new(move |_token: Option<String>, _size: usize| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, PopulationError>(HostPage::new(sample_hosts(1..=2), None)) }
    })
    .expect("runtime available");
    let engine = LocalProvisionService::builder()
        .host_provider(Arc::new(expanding))
        .build()
        .expect("engine builds");

    engine.provision(&request("a", 2)).await.expect("submit a");
    let output = succeeded(&engine, "a").await;

    assert_eq!(output.reservations().len(), 2);
    assert_eq!(engine.hosts().len(), 2);
    assert!(calls.load(Ordering::SeqCst) >= 1);
}
