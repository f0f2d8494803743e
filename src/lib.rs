pub mod access_log;
pub mod blob;
pub mod cache;
pub mod config;
pub mod http_range;
pub mod invalidator;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod ratelimit;
pub mod serve;
pub mod server;
