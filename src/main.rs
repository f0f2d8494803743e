use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pprof::protos::Message;

use filegate::config;
use filegate::logging;
use filegate::server;

#[derive(Parser, Debug)]
#[command(name = "filegate", about = "Caching HTTP gateway for static file assets", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    config: PathBuf,

    /// Override the bind address from the config file
    #[arg(long = "http")]
    http: Option<String>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Write a CPU profile to this file on shutdown
    #[arg(long = "cpuprofile")]
    cpuprofile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = config::load(&cli.config)?;
    logging::init(&cfg.logger, cli.verbose)?;

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    if let Some(addr) = &cli.http {
        cfg.listen = addr.clone();
    }
    cfg.validate()?;

    let profiler = match &cli.cpuprofile {
        Some(_) => Some(pprof::ProfilerGuard::new(100).context("start cpu profiler")?),
        None => None,
    };

    log::info!("filegate starting with config {}", cli.config.display());
    let result = server::run(Arc::new(cfg)).await;

    if let (Some(guard), Some(path)) = (profiler, &cli.cpuprofile) {
        if let Err(err) = write_cpu_profile(guard, path) {
            log::error!("write cpu profile: {err:#}");
        }
    }
    result
}

fn write_cpu_profile(guard: pprof::ProfilerGuard<'_>, path: &Path) -> Result<()> {
    let report = guard.report().build().context("build profile report")?;
    let profile = report.pprof().context("encode profile")?;
    let mut body = Vec::new();
    profile.write_to_vec(&mut body).context("serialize profile")?;
    std::fs::write(path, body).with_context(|| format!("write profile {}", path.display()))?;
    log::info!("cpu profile written to {}", path.display());
    Ok(())
}
