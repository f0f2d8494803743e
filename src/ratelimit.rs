use std::time::Instant;

use http::HeaderMap;
use indexmap::IndexMap;
use parking_lot::Mutex;

const DEFAULT_CAPACITY: f64 = 10.0;
const DEFAULT_FILL_RATE: f64 = 1.0;
const MAX_CLIENTS: usize = 10_000;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Per-client token buckets behind a bounded LRU of clients. Buckets fill
/// at `fill_rate` tokens per second up to `capacity`; a request takes one
/// token or is declined.
pub struct RateLimiter {
    buckets: Mutex<IndexMap<String, Bucket>>,
    capacity: f64,
    fill_rate: f64,
    max_clients: usize,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(IndexMap::new()),
            capacity: DEFAULT_CAPACITY,
            fill_rate: DEFAULT_FILL_RATE,
            max_clients: MAX_CLIENTS,
        }
    }

    /// Take one token from `key`'s bucket, creating a full bucket for
    /// first-time clients. Returns whether the request is admitted.
    pub fn take(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let mut bucket = buckets.shift_remove(key).unwrap_or(Bucket {
            tokens: self.capacity,
            last: now,
        });
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.fill_rate).min(self.capacity);
        bucket.last = now;

        let granted = bucket.tokens >= 1.0;
        if granted {
            bucket.tokens -= 1.0;
        }
        buckets.insert(key.to_string(), bucket);

        while buckets.len() > self.max_clients {
            buckets.shift_remove_index(0);
        }
        granted
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Identify the client for admission: the first `X-Forwarded-For` value if
/// present, otherwise the host part of the remote address.
pub fn client_key(headers: &HeaderMap, remote_addr: &str) -> String {
    if let Some(forwarded) = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(remote_addr)
        .to_string()
}
