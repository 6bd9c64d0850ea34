//! Tracing subscriber setup.
//!
//! Logs go to stderr by default. With `--log file` each run writes a fresh
//! file named after its start time into `[logging] dir`. `RUST_LOG` takes
//! precedence over `[logging] level`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Chatty dependencies stay at `warn` unless `RUST_LOG` says otherwise.
const QUIET_DEPENDENCIES: &str = "hyper=warn,reqwest=warn,sqlx=warn";

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum LogTarget {
    Stream,
    File,
}

fn filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(f) => Ok(f),
        Err(_) => EnvFilter::try_new(format!("{},{}", level, QUIET_DEPENDENCIES))
            .with_context(|| format!("Invalid log level '{}'", level)),
    }
}

/// Path of the log file for a run started at `at`.
pub fn log_file_path(dir: &Path, at: DateTime<Local>) -> PathBuf {
    dir.join(format!("rentsync_{}.log", at.format("%H_%M_%d_%m_%Y")))
}

/// Install the global subscriber. Returns the log file path for `LogTarget::File`.
pub fn init(target: LogTarget, config: &LoggingConfig) -> Result<Option<PathBuf>> {
    let filter = filter(&config.level)?;
    match target {
        LogTarget::Stream => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
            Ok(None)
        }
        LogTarget::File => {
            fs::create_dir_all(&config.dir)
                .with_context(|| format!("Failed to create log directory: {}", config.dir.display()))?;
            let path = log_file_path(&config.dir, Local::now());
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to replace log file: {}", path.display()))?;
            }
            let file = File::create(&path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
            Ok(Some(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_file_named_after_start_time() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();
        let path = log_file_path(Path::new("logs"), at);
        assert_eq!(path, Path::new("logs").join("rentsync_09_05_07_03_2024.log"));
    }

    #[test]
    fn level_filter_builds() {
        assert!(filter("debug").is_ok());
    }
}
