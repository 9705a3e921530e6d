//! Logging
//!
//! Console output for operators at the screen plus JSON files for later
//! diagnosis. Every component reports through an [`OutcomeLog`], which
//! pins the fields `component`, `outcome` and `detail` on each event.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "screensync";
const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(86400);

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log directory {0:?}: {1}")]
    Directory(PathBuf, std::io::Error),
    #[error("failed to create log file appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}

/// Install the global subscriber. `verbosity` raises the console level
/// above the configured one (-v, -vv).
pub fn init(config: &LoggingConfig, verbosity: u8) -> Result<(), LoggingError> {
    fs::create_dir_all(&config.dir).map_err(|e| LoggingError::Directory(config.dir.clone(), e))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(&config.dir)?;

    let level = match verbosity {
        0 => config.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let console = config.console.then(|| {
        fmt::Layer::new()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_filter(filter())
    });

    let subscriber = tracing_subscriber::registry().with(console).with(
        fmt::Layer::new()
            .json()
            .with_writer(file_appender)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .with_ansi(false)
            .with_filter(filter()),
    );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LoggingError::Subscriber(e.to_string()))?;
    // The MQTT client logs through `log`; route it into tracing as well.
    tracing_log::LogTracer::init().map_err(|e| LoggingError::Subscriber(e.to_string()))?;

    Ok(())
}

/// Periodically prune rotated log files beyond `files_to_keep`
pub fn spawn_retention(config: &LoggingConfig) -> tokio::task::JoinHandle<()> {
    let log_dir = config.dir.clone();
    let keep = config.files_to_keep;
    tokio::spawn(async move {
        let mut interval = time::interval(LOG_ROTATION_INTERVAL);
        loop {
            interval.tick().await;
            cleanup_old_logs(&log_dir, keep);
        }
    })
}

fn cleanup_old_logs(log_dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(LOG_FILE_PREFIX)
        })
        .collect();

    // Newest first
    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    for old_file in log_files.iter().skip(keep) {
        let _ = fs::remove_file(old_file.path());
    }
}

/// Outcome of a step, as recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started,
    Succeeded,
    Warned,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Started => "started",
            Outcome::Succeeded => "succeeded",
            Outcome::Warned => "warned",
            Outcome::Failed => "failed",
        }
    }
}

/// Structured logger handle for one component.
///
/// Created by the supervisor and handed to each component, so every log
/// line carries the same fixed fields regardless of who emits it.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeLog {
    component: &'static str,
}

impl OutcomeLog {
    pub const fn new(component: &'static str) -> Self {
        Self { component }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn record(&self, outcome: Outcome, detail: impl std::fmt::Display) {
        let detail = detail.to_string();
        match outcome {
            Outcome::Started | Outcome::Succeeded => tracing::info!(
                component = self.component,
                outcome = outcome.as_str(),
                detail = %detail
            ),
            Outcome::Warned => tracing::warn!(
                component = self.component,
                outcome = outcome.as_str(),
                detail = %detail
            ),
            Outcome::Failed => tracing::error!(
                component = self.component,
                outcome = outcome.as_str(),
                detail = %detail
            ),
        }
    }

    pub fn started(&self, detail: impl std::fmt::Display) {
        self.record(Outcome::Started, detail);
    }

    pub fn succeeded(&self, detail: impl std::fmt::Display) {
        self.record(Outcome::Succeeded, detail);
    }

    pub fn warned(&self, detail: impl std::fmt::Display) {
        self.record(Outcome::Warned, detail);
    }

    pub fn failed(&self, detail: impl std::fmt::Display) {
        self.record(Outcome::Failed, detail);
    }
}
