//! File-based logging
//!
//! Writes daily rolling logs under the configured directory:
//! - `<dir>/main` - every event, JSON
//! - `<dir>/error` - WARN and above
//! - `<dir>/session` - session and transport targets

use crate::infrastructure::config::LoggingConfig;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log targets used by the crate
pub const TARGET_SESSION: &str = "session";
pub const TARGET_TRANSPORT: &str = "transport";

const LOG_TYPES: [&str; 3] = ["main", "error", "session"];

/// Logging setup errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to create log directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid log filter: {0}")]
    Filter(String),
    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

/// Initialize the global subscriber
///
/// The returned guards flush the non-blocking writers on drop and must be
/// held for the lifetime of the program.
pub fn init_logging(config: &LoggingConfig) -> Result<Vec<WorkerGuard>, LoggingError> {
    let root = Path::new(&config.directory);
    for log_type in LOG_TYPES {
        let dir = root.join(log_type);
        fs::create_dir_all(&dir).map_err(|source| LoggingError::Directory {
            path: dir.display().to_string(),
            source,
        })?;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| LoggingError::Filter(e.to_string()))?;

    let mut guards = Vec::with_capacity(LOG_TYPES.len());

    let (main_appender, guard) = create_appender(&root.join("main"), "main");
    guards.push(guard);
    let (error_appender, guard) = create_appender(&root.join("error"), "error");
    guards.push(guard);
    let (session_appender, guard) = create_appender(&root.join("session"), "session");
    guards.push(guard);

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let session_layer = tracing_subscriber::fmt::layer()
        .with_writer(session_appender)
        .with_ansi(false)
        .with_target(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            is_session_target(metadata.target())
        }));

    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(main_layer)
        .with(error_layer)
        .with(session_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(directory = %config.directory, "Logging initialized");
    Ok(guards)
}

fn is_session_target(target: &str) -> bool {
    target.starts_with(TARGET_SESSION) || target.starts_with(TARGET_TRANSPORT)
}

fn create_appender(dir: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
    tracing_appender::non_blocking(appender)
}

/// Session lifecycle events
#[macro_export]
macro_rules! log_session {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "session", $level, $($arg)+)
    };
}

/// Socket-level events
#[macro_export]
macro_rules! log_transport {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "transport", $level, $($arg)+)
    };
}
