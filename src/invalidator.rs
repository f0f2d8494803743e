use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::metrics;
use crate::origin::OriginClient;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The metadata the sweep needs to revalidate one cached entry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub url: String,
    pub mtime: SystemTime,
    pub etag: String,
}

pub type EvictFn = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Shared {
    tracked: HashMap<String, Snapshot>,
    added: HashSet<String>,
    removed: HashSet<String>,
    version: u64,
}

/// Background revalidator. Tracks which keys are cached, wakes on a fixed
/// period, and asks the origin with a conditional HEAD whether each cached
/// representation is still current. Entries the origin reports changed are
/// evicted through the callback.
///
/// The sweep task keeps a private copy of the tracked set and folds in the
/// add/del deltas under the mutex at the start of each pass, so no lock is
/// held while talking to the origin.
pub struct Invalidator {
    shared: Arc<Mutex<Shared>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Invalidator {
    pub fn spawn(origin: OriginClient, period: Duration, evict: EvictFn) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            Arc::clone(&shared),
            origin,
            period,
            evict,
            shutdown_rx,
        ));
        Self {
            shared,
            shutdown: shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn add(&self, key: &str, snapshot: Snapshot) {
        let mut shared = self.shared.lock();
        shared.tracked.insert(key.to_string(), snapshot);
        shared.added.insert(key.to_string());
        shared.version += 1;
    }

    pub fn del(&self, key: &str) {
        let mut shared = self.shared.lock();
        shared.tracked.remove(key);
        shared.removed.insert(key.to_string());
        shared.version += 1;
    }

    /// Signal the sweep task to stop and wait for it to drain, bounded at
    /// five seconds. A sweep in flight finishes its current pass first.
    pub async fn close(&self) -> Result<()> {
        log::info!("invalidator: closing");
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, handle).await {
            Ok(_) => {
                log::info!("invalidator: closed");
                Ok(())
            }
            Err(_) => Err(anyhow!("invalidator: timed out waiting for sweep task")),
        }
    }
}

async fn run(
    shared: Arc<Mutex<Shared>>,
    origin: OriginClient,
    period: Duration,
    evict: EvictFn,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut local: HashMap<String, Snapshot> = HashMap::new();
    let mut local_version = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                log::debug!("invalidator: quit");
                return;
            }
            _ = tokio::time::sleep(period) => {}
        }

        {
            let mut shared = shared.lock();
            if shared.version != local_version {
                local_version = shared.version;
                let removed: Vec<String> = shared.removed.drain().collect();
                for key in removed {
                    local.remove(&key);
                }
                let added: Vec<String> = shared.added.drain().collect();
                for key in added {
                    if let Some(snapshot) = shared.tracked.get(&key) {
                        local.insert(key, snapshot.clone());
                    }
                }
            }
        }

        let start = Instant::now();
        let mut invalidated = 0usize;
        for (key, snapshot) in &local {
            match origin.check(&snapshot.url, snapshot.mtime, &snapshot.etag).await {
                Ok(status) if status == StatusCode::NOT_MODIFIED => {}
                Ok(status)
                    if status == StatusCode::REQUEST_TIMEOUT
                        || status == StatusCode::TOO_MANY_REQUESTS =>
                {
                    log::debug!("invalidator: {key} transient, retry next sweep");
                }
                Ok(status) => {
                    log::info!("invalidate: {key} ({status})");
                    metrics::record_eviction("changed");
                    evict(key);
                    invalidated += 1;
                }
                Err(err) => {
                    log::warn!("invalidator: check {key}: {err:#}");
                }
            }
        }
        if invalidated > 0 {
            log::debug!(
                "invalidator: swept {} keys, {} invalidated in {:?}",
                local.len(),
                invalidated,
                start.elapsed()
            );
        }
    }
}
