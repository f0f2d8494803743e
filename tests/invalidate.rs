mod support;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use filegate::cache::{CacheOptions, CacheStatus, FileCache};
use filegate::origin::OriginClient;
use http::StatusCode;
use support::*;

const SWEEP_PERIOD: Duration = Duration::from_millis(200);

fn cache_options() -> CacheOptions {
    CacheOptions {
        max_items: 4,
        max_size: 64 * 1024 * 1024,
        revalidate_period: SWEEP_PERIOD,
    }
}

async fn open_ok(cache: &Arc<FileCache>, key: &str) -> CacheStatus {
    let (mut reader, status) = cache.open(key).await.expect("open");
    let mut body = Vec::new();
    reader.read_to_end(&mut body).expect("read body");
    status
}

async fn wait_for_sweeps() {
    tokio::time::sleep(SWEEP_PERIOD * 4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changed_entry_is_evicted() {
    let origin = MockOrigin::start().await;
    origin.add_file("/k", "k-body");
    // origin reports the representation changed
    origin.set_head_status(Some(StatusCode::OK));

    let cache = FileCache::new(OriginClient::new(&origin.url()), cache_options());
    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Miss);

    wait_for_sweeps().await;
    assert!(origin.head_count("/k") >= 1, "sweep never ran");
    assert!(cache.is_empty());

    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Miss);
    assert_eq!(origin.get_count("/k"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_current_entry_is_retained() {
    let origin = MockOrigin::start().await;
    origin.add_file("/k", "k-body");
    // default HEAD reply is 304 Not Modified

    let cache = FileCache::new(OriginClient::new(&origin.url()), cache_options());
    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Miss);

    wait_for_sweeps().await;
    assert!(origin.head_count("/k") >= 1, "sweep never ran");

    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Hit);
    assert_eq!(origin.get_count("/k"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_head_retains_entry() {
    let origin = MockOrigin::start().await;
    origin.add_file("/k", "k-body");
    origin.set_head_status(Some(StatusCode::TOO_MANY_REQUESTS));

    let cache = FileCache::new(OriginClient::new(&origin.url()), cache_options());
    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Miss);

    wait_for_sweeps().await;
    assert!(origin.head_count("/k") >= 1, "sweep never ran");

    // 429 means retry later: the entry must survive the sweep
    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Hit);
    assert_eq!(origin.get_count("/k"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_entry_is_not_revalidated() {
    let origin = MockOrigin::start().await;
    origin.add_file("/k", "k-body");

    let cache = FileCache::new(OriginClient::new(&origin.url()), cache_options());
    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Miss);
    assert!(cache.remove("/k"));

    wait_for_sweeps().await;
    assert_eq!(origin.head_count("/k"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_joins_sweep_task() {
    let origin = MockOrigin::start().await;
    origin.add_file("/k", "k-body");

    let cache = FileCache::new(OriginClient::new(&origin.url()), cache_options());
    assert_eq!(open_ok(&cache, "/k").await, CacheStatus::Miss);

    cache.close().await.expect("close");
}
