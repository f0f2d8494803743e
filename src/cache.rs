use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::blob::{Blob, BlobReader};
use crate::invalidator::{Invalidator, Snapshot};
use crate::metrics;
use crate::origin::{FetchError, OriginClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub max_items: usize,
    /// Tracked and reported, but not an eviction trigger.
    pub max_size: u64,
    pub revalidate_period: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_size: 512 * 1024 * 1024,
            revalidate_period: Duration::from_secs(30),
        }
    }
}

// Iteration order of `entries` is eviction order: index 0 is the least
// recently used entry, the last index is the most recently used.
struct Inner {
    entries: IndexMap<String, Arc<Blob>>,
    size: u64,
}

/// Bounded LRU mapping from normalized request path to an immutable Blob.
/// Hits promote the entry and never touch the origin; misses fetch, insert
/// and register the entry with the invalidator. Concurrent misses on the
/// same key may each fetch; the last insert wins.
pub struct FileCache {
    inner: Mutex<Inner>,
    origin: OriginClient,
    invalidator: Invalidator,
    max_items: usize,
    max_size: u64,
}

impl FileCache {
    pub fn new(origin: OriginClient, opts: CacheOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<FileCache>| {
            let weak = weak.clone();
            let evict = Box::new(move |key: &str| {
                if let Some(cache) = weak.upgrade() {
                    cache.remove(key);
                }
            });
            Self {
                inner: Mutex::new(Inner {
                    entries: IndexMap::new(),
                    size: 0,
                }),
                invalidator: Invalidator::spawn(origin.clone(), opts.revalidate_period, evict),
                origin,
                max_items: opts.max_items.max(1),
                max_size: opts.max_size,
            }
        })
    }

    /// Look the key up, fetching from origin on a miss. Errors from the
    /// origin propagate as-is; nothing negative is cached.
    pub async fn open(&self, key: &str) -> Result<(BlobReader, CacheStatus), FetchError> {
        log::debug!("cache: {key}");

        if let Some(reader) = self.lookup(key) {
            metrics::record_cache_hit();
            return Ok((reader, CacheStatus::Hit));
        }

        metrics::record_cache_miss();
        let blob = self.origin.fetch(key).await?;
        let reader = self.insert(key, Arc::new(blob));
        Ok((reader, CacheStatus::Miss))
    }

    /// Remove a key, detaching it from the eviction order and dropping its
    /// invalidator record. Missing keys are a no-op. The invalidator is
    /// only told after the cache lock is released; neither lock is ever
    /// held while taking the other.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.entries.shift_remove(key) {
                Some(blob) => {
                    inner.size -= blob.size();
                    true
                }
                None => false,
            }
        };
        if removed {
            self.invalidator.del(key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total body bytes currently held. Informational; see `max_size`.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub async fn close(&self) -> Result<()> {
        self.invalidator.close().await
    }

    fn lookup(&self, key: &str) -> Option<BlobReader> {
        let mut inner = self.inner.lock();
        let blob = inner.entries.shift_remove(key)?;
        let reader = blob.reader();
        inner.entries.insert(key.to_string(), blob);
        Some(reader)
    }

    fn insert(&self, key: &str, blob: Arc<Blob>) -> BlobReader {
        let reader = blob.reader();
        let snapshot = Snapshot {
            url: blob.basename().to_string(),
            mtime: blob.mtime(),
            etag: blob.etag().to_string(),
        };

        // mutate the map under the cache lock only; invalidator calls
        // happen below, after the guard is released
        let (replaced, evicted) = {
            let mut inner = self.inner.lock();
            // a concurrent miss may have inserted already; replace it
            let replaced = match inner.entries.shift_remove(key) {
                Some(old) => {
                    inner.size -= old.size();
                    true
                }
                None => false,
            };
            inner.size += blob.size();
            inner.entries.insert(key.to_string(), blob);

            let evicted = if inner.entries.len() > self.max_items {
                match inner.entries.shift_remove_index(0) {
                    Some((old_key, old_blob)) => {
                        inner.size -= old_blob.size();
                        Some(old_key)
                    }
                    None => None,
                }
            } else {
                None
            };
            (replaced, evicted)
        };

        if replaced {
            self.invalidator.del(key);
        }
        self.invalidator.add(key, snapshot);
        if let Some(old_key) = evicted {
            self.invalidator.del(&old_key);
            metrics::record_eviction("capacity");
            log::debug!("cache: evicted {old_key}");
        }
        reader
    }
}
