use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mfeed_adapters::feed_spec;
use mfeed_core::{FeedKind, RunStatus};
use mfeed_storage::{HttpClientConfig, HttpFetcher, MemoryStore};
use mfeed_sync::{load_registry, ResolvedFeed, Services, SyncConfig};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

/// Services over the memory store with every page pointed at a closed port.
fn services(feeds: &[ResolvedFeed]) -> Services {
    let config = SyncConfig::from_lookup(|_| None).unwrap();
    let registry = load_registry(workspace_root().join("feeds.yaml")).unwrap();
    Services::assemble(
        Arc::new(MemoryStore::new()),
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
        feeds,
        registry.resolve_retention(&config).unwrap(),
        |feed| feed_spec(feed).with_url("http://127.0.0.1:9/closed"),
    )
}

fn shipped_feeds() -> Vec<ResolvedFeed> {
    load_registry(workspace_root().join("feeds.yaml"))
        .unwrap()
        .resolve_feeds()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_registers_every_enabled_job_with_its_schedule() {
    let feeds = shipped_feeds();
    let services = services(&feeds);

    let commodities = services.job(FeedKind::Commodities).unwrap().schedule();
    assert_eq!(commodities.cron, "0 */5 * * * *");
    assert_eq!(commodities.timezone, chrono_tz::America::Sao_Paulo);
    assert_eq!(
        services.job(FeedKind::UsIndices).unwrap().schedule().timezone,
        chrono_tz::America::New_York
    );

    let handle = services.start_scheduler().await.unwrap();
    assert_eq!(
        handle.registered(),
        ["us-indices", "brazil-indices", "currencies", "commodities", "cleanup"]
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_feeds_are_not_scheduled() {
    let mut feeds = shipped_feeds();
    for f in feeds.iter_mut().filter(|f| f.feed == FeedKind::BrazilIndices) {
        f.enabled = false;
    }
    let services = services(&feeds);

    let handle = services.start_scheduler().await.unwrap();
    assert_eq!(
        handle.registered(),
        ["us-indices", "currencies", "commodities", "cleanup"]
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_scrapes_run_each_job_once() {
    let services = services(&shipped_feeds());
    services.run_startup_scrapes();

    for job in services.jobs.values() {
        assert_eq!(job.status().state.run_count, 1, "{}", job.feed());
    }

    // background runs fail fast against the closed port
    let finished = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if services.jobs.values().all(|j| !j.status().state.is_running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "startup runs did not finish");

    for job in services.jobs.values() {
        let state = job.status().state;
        assert_eq!(state.run_count, 1, "{}", job.feed());
        assert_eq!(state.last_run_status, Some(RunStatus::Failed), "{}", job.feed());
        assert!(state.last_error.unwrap().contains("fetching"));
    }
    assert_eq!(services.retention.status().state.run_count, 0);
}
