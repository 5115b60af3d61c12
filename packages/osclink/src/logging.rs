//! File logging for the tunnel binaries.
//!
//! Stdout and stderr belong to the tunneled terminal stream, so diagnostics
//! go to a dated file instead.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `<prefix>-YYYYMMDD.log`
pub fn log_file_name(prefix: &str, date: NaiveDate) -> String {
    format!("{prefix}-{}.log", date.format("%Y%m%d"))
}

/// Install a global subscriber appending to today's log file in `dir`.
///
/// `RUST_LOG` overrides `default_filter`. Returns the path being written.
pub fn init_file_logging(dir: &Path, prefix: &str, default_filter: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
    let path = dir.join(log_file_name(prefix, chrono::Local::now().date_naive()));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {:?}", path))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_carries_the_date() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(log_file_name("osclink-client", date), "osclink-client-20260307.log");
    }

    #[test]
    fn creates_directory_and_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        // Another test may already own the global subscriber; the file is
        // created before installation either way.
        let _ = init_file_logging(&dir, "test", "debug");
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
