//! Integration tests for paged host populations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use device_pool::model::Host;
use device_pool::population::{
    DelegatingHostProvider, ExpandingHostProvider, ExpansionSummary, HostChange, HostPage,
    HostProvider,
};
use device_pool::test_support::{EventLog, sample_hosts};
use device_pool::{PoolConfig, PopulationError};
use rstest::{fixture, rstest};

/// Three pages: twenty hosts, twenty more overlapping the first by five,
/// then an empty final page.
fn three_pages(token: Option<String>, _size: usize) -> Result<HostPage, PopulationError> {
    Ok(match token.as_deref() {
        None => HostPage::new(sample_hosts(1..=20), Some("T1".to_owned())),
        Some("T1") => HostPage::new(sample_hosts(16..=35), Some("T2".to_owned())),
        Some(_) => HostPage::new(Vec::new(), None),
    })
}

/// Remote directory whose contents tests can change between passes.
#[derive(Clone, Default)]
struct Directory {
    hosts: Arc<Mutex<Vec<Host>>>,
}

impl Directory {
    fn replace(&self, hosts: Vec<Host>) {
        *self.hosts.lock().unwrap_or_else(PoisonError::into_inner) = hosts;
    }

    fn page(&self, token: Option<String>, size: usize) -> HostPage {
        let hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let start: usize = token.and_then(|value| value.parse().ok()).unwrap_or(0);
        let end = (start + size).min(hosts.len());
        let page = hosts.get(start..end).map(<[Host]>::to_vec).unwrap_or_default();
        let next = (end < hosts.len()).then(|| end.to_string());
        HostPage::new(page, next)
    }

    fn as_set(&self) -> HashSet<Host> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

fn expanding_over(directory: &Directory, page_size: usize) -> ExpandingHostProvider {
    let remote = directory.clone();
    ExpandingHostProvider::with_lease_size(
        move |token: Option<String>, size: usize| {
            let page = remote.page(token, size);
            async move { Ok::<_, PopulationError>(page) }
        },
        page_size,
    )
    .expect("runtime available")
}

#[fixture]
fn log() -> EventLog {
    EventLog::default()
}

#[rstest]
#[tokio::test]
async fn one_pass_stops_when_the_budget_is_spent(log: EventLog) {
    let provider = ExpandingHostProvider::new(|token: Option<String>, size: usize| async move {
        three_pages(token, size)
    })
    .expect("runtime available");
    provider.subscribe(log.listener());

    let first = provider.grow().await.expect("first pass");
    assert_eq!(first, ExpansionSummary { added: 20, removed: 0 });
    assert_eq!(provider.hosts().len(), 20);
    assert_eq!(log.events().len(), 20);

    let second = provider.grow().await.expect("second pass");
    assert_eq!(second, ExpansionSummary { added: 15, removed: 0 });
    assert_eq!(provider.hosts().len(), 35);
    assert_eq!(log.count(HostChange::Added), 35);
    assert_eq!(log.count(HostChange::Removed), 0);
}

#[rstest]
#[tokio::test]
async fn repeated_growth_converges_on_the_directory(log: EventLog) {
    let directory = Directory::default();
    directory.replace(sample_hosts(1..=12));
    let provider = expanding_over(&directory, 5);
    provider.subscribe(log.listener());

    for _ in 0..3 {
        provider.grow().await.expect("pass succeeds");
    }
    assert_eq!(provider.hosts(), directory.as_set());
    assert_eq!(log.events().len(), 12);

    let settled = provider.grow().await.expect("steady pass");
    assert_eq!(settled, ExpansionSummary::default());
    assert_eq!(log.events().len(), 12);
}

#[rstest]
#[tokio::test]
async fn hosts_missing_from_the_directory_are_removed(log: EventLog) {
    let directory = Directory::default();
    directory.replace(sample_hosts(1..=6));
    let provider = expanding_over(&directory, 10);
    provider.subscribe(log.listener());
    provider.grow().await.expect("initial pass");

    directory.replace(sample_hosts(3..=8));
    let summary = provider.grow().await.expect("reconciling pass");

    assert_eq!(summary, ExpansionSummary { added: 2, removed: 2 });
    assert_eq!(provider.hosts(), directory.as_set());
    assert_eq!(log.replayed(), directory.as_set());
    assert_eq!(log.events().len(), 10);
}

#[rstest]
#[tokio::test]
async fn delegating_wrapper_mirrors_growth_once(log: EventLog) {
    let directory = Directory::default();
    directory.replace(sample_hosts(1..=4));
    let upstream = Arc::new(expanding_over(&directory, 10));
    let delegating =
        DelegatingHostProvider::new(sample_hosts(1..=1), Arc::clone(&upstream) as Arc<dyn HostProvider>);
    delegating.subscribe(log.listener());

    upstream.grow().await.expect("pass succeeds");
    upstream.grow().await.expect("repeat pass");

    assert_eq!(delegating.hosts(), directory.as_set());
    assert_eq!(log.count(HostChange::Added), 3);
    assert_eq!(log.count(HostChange::Removed), 0);
}

#[tokio::test]
async fn page_size_comes_from_configuration() {
    let config = PoolConfig {
        provision_timeout_secs: 3600,
        expire_provisions: true,
        reap_interval_ms: 1000,
        poll_interval_ms: 250,
        expansion_page_size: 7,
        log_filter: "info".to_owned(),
    };
    let provider = ExpandingHostProvider::with_config(
        |_token: Option<String>, _size: usize| async {
            Ok::<_, PopulationError>(HostPage::default())
        },
        &config,
    )
    .expect("runtime available");
    assert_eq!(provider.lease_size(), 7);
}
