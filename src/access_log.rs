use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;

/// Appends one line per request to a file, or to stdout when no path is
/// configured.
pub struct AccessLogger {
    writer: Mutex<AccessWriter>,
}

enum AccessWriter {
    File(std::fs::File),
    Stdout(std::io::Stdout),
}

impl AccessLogger {
    pub fn new(path: Option<&str>) -> Result<Self> {
        let writer = if let Some(path) = path.filter(|p| !p.is_empty()) {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            AccessWriter::File(file)
        } else {
            AccessWriter::Stdout(std::io::stdout())
        };
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn log_line(&self, line: &str) {
        let mut writer = self.writer.lock();
        match &mut *writer {
            AccessWriter::File(file) => {
                let _ = file.write_all(line.as_bytes());
            }
            AccessWriter::Stdout(stdout) => {
                let _ = stdout.write_all(line.as_bytes());
            }
        }
    }
}
