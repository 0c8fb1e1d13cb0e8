//! End-to-end provisioning scenarios through the device pool façade.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use device_pool::test_support::{RecordingFactory, sample_host, sample_hosts};
use device_pool::{
    DevicePool, LocalProvisionService, ProvisionInput, ProvisioningError, Status,
};
use rstest::{fixture, rstest};
use tokio::time::{Instant, sleep};

#[fixture]
fn factory() -> RecordingFactory {
    RecordingFactory::new()
}

fn pool_over(engine: &Arc<LocalProvisionService>, factory: &RecordingFactory) -> DevicePool {
    DevicePool::builder()
        .provision_and_reservation_service(Arc::clone(engine))
        .connection_and_transfer_factory(Arc::new(factory.clone()))
        .poll_interval(Duration::from_millis(10))
        .build()
        .expect("all components supplied")
}

fn input(id: &str, amount: usize) -> ProvisionInput {
    ProvisionInput::new(id, amount).expect("valid input")
}

#[rstest]
#[tokio::test]
async fn two_of_three_hosts_are_granted(factory: RecordingFactory) {
    let engine = Arc::new(LocalProvisionService::new(sample_hosts(1..=3)).expect("engine"));
    let pool = pool_over(&engine, &factory);

    let devices = pool
        .provision_wait(&input("scenario-a", 2), Duration::from_secs(5))
        .await
        .expect("request succeeds");

    let ids: HashSet<&str> = devices.iter().map(|device| device.id()).collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(engine.available_hosts().len(), 1);
    assert_eq!(factory.connections_opened(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn waiting_request_succeeds_once_the_host_is_released(factory: RecordingFactory) {
    let engine = Arc::new(LocalProvisionService::new([sample_host(1)]).expect("engine"));
    let pool = pool_over(&engine, &factory);
    pool.provision_wait(&input("holder", 1), Duration::from_secs(5))
        .await
        .expect("holder takes the only host");

    let releaser = Arc::clone(&engine);
    let release_delay = Duration::from_secs(1);
    tokio::spawn(async move {
        sleep(release_delay).await;
        releaser.release_provision("holder");
    });

    let started = Instant::now();
    let devices = pool
        .provision_wait(&input("waiter", 1), Duration::from_secs(5))
        .await
        .expect("waiter succeeds before its timeout");

    assert!(started.elapsed() >= release_delay);
    assert_eq!(devices.first().map(|device| device.id()), Some("host-1"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn oversized_request_times_out_without_leaking(factory: RecordingFactory) {
    let engine = Arc::new(LocalProvisionService::new([sample_host(1)]).expect("engine"));
    let pool = pool_over(&engine, &factory);

    let err = pool
        .provision_wait(&input("greedy", 2), Duration::from_millis(200))
        .await
        .expect_err("only one host exists");
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        err,
        ProvisioningError::Timeout {
            id: "greedy".to_owned()
        }
    );
    assert_eq!(engine.available_hosts(), vec![sample_host(1)]);
    assert_eq!(engine.active_provisions(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn expired_requests_free_hosts_for_waiters(factory: RecordingFactory) {
    let engine = Arc::new(
        LocalProvisionService::builder()
            .host(sample_host(1))
            .provision_timeout(Duration::from_secs(2))
            .reap_interval(Duration::from_millis(100))
            .build()
            .expect("engine"),
    );
    let pool = pool_over(&engine, &factory);
    pool.provision(&input("forgotten", 1))
        .await
        .expect("submit succeeds");
    sleep(Duration::from_millis(1500)).await;

    let devices = pool
        .provision_wait(&input("patient", 1), Duration::from_secs(10))
        .await
        .expect("reaper frees the host");

    assert_eq!(devices.len(), 1);
    assert!(matches!(
        pool.describe("forgotten").await,
        Err(ProvisioningError::NotFound { .. })
    ));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_share_a_host(factory: RecordingFactory) {
    const HOSTS: usize = 4;
    let engine = Arc::new(LocalProvisionService::new(sample_hosts(1..=HOSTS)).expect("engine"));
    let pool = Arc::new(pool_over(&engine, &factory));
    let held: Arc<Mutex<HashSet<String>>> = Arc::default();

    let mut tasks = Vec::new();
    for index in 0..12 {
        let pool_handle = Arc::clone(&pool);
        let held_hosts = Arc::clone(&held);
        tasks.push(tokio::spawn(async move {
            let id = format!("req-{index}");
            let amount = 1 + index % 2;
            let devices = pool_handle
                .provision_wait(&input(&id, amount), Duration::from_secs(30))
                .await
                .expect("every request is eventually served");
            {
                let mut current = held_hosts.lock().unwrap_or_else(PoisonError::into_inner);
                for device in &devices {
                    assert!(
                        current.insert(device.id().to_owned()),
                        "{} granted twice",
                        device.id()
                    );
                }
                assert!(current.len() <= HOSTS);
            }
            sleep(Duration::from_millis(5)).await;
            {
                let mut current = held_hosts.lock().unwrap_or_else(PoisonError::into_inner);
                for device in &devices {
                    current.remove(device.id());
                }
            }
            for device in &devices {
                device.close().await;
            }
            pool_handle.release(&id).await.expect("release succeeds");
        }));
    }
    for task in tasks {
        task.await.expect("task completes");
    }

    assert_eq!(engine.available_hosts().len(), HOSTS);
    assert_eq!(engine.active_provisions(), 0);
}

#[rstest]
#[tokio::test]
async fn released_requests_are_not_found(factory: RecordingFactory) {
    let engine = Arc::new(LocalProvisionService::new(sample_hosts(1..=2)).expect("engine"));
    let pool = pool_over(&engine, &factory);
    let submitted = pool
        .provision(&input("short-lived", 1))
        .await
        .expect("submit succeeds");
    assert!(!submitted.status().is_terminal());

    pool.release("short-lived").await.expect("first release");
    pool.release("short-lived").await.expect("second release");

    assert!(matches!(
        pool.describe("short-lived").await,
        Err(ProvisioningError::NotFound { .. })
    ));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.available_hosts().len(), 2);
    assert_ne!(submitted.status(), Status::Succeeded);
}
