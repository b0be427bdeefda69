//! Logging for both sides of a fork.
//!
//! Parent and child write to the same stderr or log file, so every line
//! starts with the pid and the fork depth of the process that wrote it:
//! `4242/0` is the process that made the first fork, `4243/1` its child.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub const LOG_LEVEL_ENV: &str = "FORKSYNC_LOG_LEVEL";

pub static FORKSYNC_LOGGER: OnceCell<ForkSyncLogger> = OnceCell::new();
pub static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

static FORK_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Installs the logger. The level comes from `FORKSYNC_LOG_LEVEL` (warn when
/// unset or unparsable); lines go to `log_file` when given, stderr otherwise.
/// Only the first call has any effect. A child inherits the parent's logger.
pub fn init(log_file: Option<PathBuf>) -> Result<()> {
    LOG_FILE.get_or_try_init(|| -> Result<Option<File>> {
        let level_filter = level_from_env();
        let logger = FORKSYNC_LOGGER.get_or_init(|| ForkSyncLogger::new(level_filter.to_level()));
        log::set_logger(logger)
            .map(|()| log::set_max_level(level_filter))
            .context("failed to set logger")?;
        log_file
            .map(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("failed to open log file {:?}", path))
            })
            .transpose()
    })?;
    Ok(())
}

fn level_from_env() -> LevelFilter {
    env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::Warn)
}

/// Marks the current process as one fork deeper than its parent.
pub(crate) fn enter_child() {
    FORK_DEPTH.fetch_add(1, Ordering::Relaxed);
}

pub fn fork_depth() -> usize {
    FORK_DEPTH.load(Ordering::Relaxed)
}

pub struct ForkSyncLogger {
    level: Option<log::Level>,
}

impl ForkSyncLogger {
    pub fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }

    fn format(&self, record: &Record) -> String {
        let origin = format!("{}/{}", std::process::id(), fork_depth());
        let now = chrono::Local::now().to_rfc3339();
        match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!(
                "{} [{} {}:{}] {} {}",
                origin,
                record.level(),
                file,
                line,
                now,
                record.args()
            ),
            _ => format!("{} [{}] {} {}", origin, record.level(), now, record.args()),
        }
    }
}

impl Log for ForkSyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.level.map_or(false, |level| metadata.level() <= level)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        match LOG_FILE.get().and_then(Option::as_ref) {
            Some(mut log_file) => {
                let _ = writeln!(log_file, "{}", line);
            }
            None => {
                let _ = writeln!(stderr(), "{}", line);
            }
        }
    }

    fn flush(&self) {
        match LOG_FILE.get().and_then(Option::as_ref) {
            Some(mut log_file) => {
                let _ = log_file.flush();
            }
            None => {
                let _ = stderr().flush();
            }
        }
    }
}
