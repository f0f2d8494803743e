use std::sync::OnceLock;

use http::StatusCode;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("filegate_requests_total", "Total requests").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("filegate_requests_status_total", "Requests by status"),
            &["code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_hits_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("filegate_cache_hits_total", "Cache hits").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_misses_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("filegate_cache_misses_total", "Cache misses").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_evictions_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("filegate_cache_evictions_total", "Cache evictions by reason"),
            &["reason"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn ratelimited_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("filegate_ratelimited_total", "Rate-limited requests").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

pub fn record(status: StatusCode) {
    requests_total().inc();
    requests_status_total()
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_cache_hit() {
    cache_hits_total().inc();
}

pub fn record_cache_miss() {
    cache_misses_total().inc();
}

pub fn record_eviction(reason: &str) {
    cache_evictions_total().with_label_values(&[reason]).inc();
}

pub fn record_ratelimited() {
    ratelimited_total().inc();
}

pub fn render() -> String {
    // force registration so an early scrape still sees every series
    requests_total();
    requests_status_total();
    cache_hits_total();
    cache_misses_total();
    cache_evictions_total();
    ratelimited_total();

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&registry().gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
