use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

const DEFAULT_HTTP_RATE_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Bind address, e.g. ":6069" or "127.0.0.1:6069".
    #[serde(rename = "Listen", default)]
    pub listen: String,
    /// Upstream URL prefix files are fetched from.
    #[serde(rename = "Origin", default)]
    pub origin: String,
    /// Accepted for compatibility with existing config files; unused.
    #[serde(rename = "TmpDir", default)]
    pub tmp_dir: String,
    /// Accepted for compatibility with existing config files; unused.
    #[serde(rename = "allow-origin", default)]
    pub allow_origin: Vec<String>,
    /// Informational; admission uses fixed per-client bucket parameters.
    #[serde(rename = "HTTPRateLimit", default)]
    pub http_rate_limit: i64,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub access_log: AccessLog,
    #[serde(default)]
    pub cache: Cache,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(anyhow!("Listen address is required"));
        }
        if self.origin.trim().is_empty() {
            return Err(anyhow!("Origin is required"));
        }
        let _: http::Uri = self
            .origin
            .parse()
            .with_context(|| format!("Origin {} is not a valid URL", self.origin))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    /// Rotate the log file once it exceeds this many MiB. 0 disables.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct AccessLog {
    #[serde(default)]
    pub enabled: bool,
    /// Empty path logs to stdout.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Byte budget; recorded and reported but not an eviction trigger.
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_revalidate_period", with = "humantime_serde")]
    pub revalidate_period: Duration,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            max_size: default_max_size(),
            revalidate_period: default_revalidate_period(),
        }
    }
}

fn default_max_items() -> usize {
    50
}

fn default_max_size() -> u64 {
    512 * 1024 * 1024
}

fn default_revalidate_period() -> Duration {
    Duration::from_secs(30)
}

/// Load a TOML config file, collecting the paths of unknown keys so the
/// caller can warn about them.
pub fn load(path: &Path) -> Result<(Config, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = toml::Deserializer::new(&raw);
    let mut cfg: Config = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    if cfg.http_rate_limit == 0 {
        cfg.http_rate_limit = DEFAULT_HTTP_RATE_LIMIT;
    }

    Ok((cfg, ignored))
}
