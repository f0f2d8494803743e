use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode};
use log::LevelFilter;

use crate::config::Logger;

/// Wire up the `log` facade: stdout by default, optionally a rotating log
/// file when `[logger] path` is set. `-v` forces debug regardless of the
/// configured level.
pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        level_from(&config.level)
    };

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(line_format);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path))
            .with_context(|| format!("log file {}", config.path))?;
        let mut to_file = logger.log_to_file(spec).format(line_format);
        if let Some((criterion, naming, cleanup)) = rotation(config) {
            to_file = to_file.rotate(criterion, naming, cleanup);
        }
        logger = to_file.write_mode(WriteMode::BufferAndFlush);
    }

    logger.start().context("start logger")?;
    Ok(())
}

fn level_from(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn rotation(config: &Logger) -> Option<(Criterion, Naming, Cleanup)> {
    if config.max_size == 0 {
        return None;
    }
    let cleanup = match config.max_backups {
        0 => Cleanup::Never,
        n => Cleanup::KeepLogFiles(n as usize),
    };
    Some((
        Criterion::Size(config.max_size * 1024 * 1024),
        Naming::Numbers,
        cleanup,
    ))
}

fn line_format(
    writer: &mut dyn Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        writer,
        "{} {:<5} pid={}: {}",
        now.now_utc_owned().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        record.level(),
        std::process::id(),
        record.args()
    )
}
