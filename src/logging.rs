//! Process-wide tracing setup.
//!
//! Installs a compact console layer plus a JSON layer that appends to the
//! process log file. Must be called once, before any loop starts.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Errors installing the tracing subscriber.
#[derive(Debug)]
pub enum LoggingError {
    /// The log file could not be opened for appending
    LogFile { path: PathBuf, source: std::io::Error },

    /// A global subscriber is already installed
    AlreadyInitialized(String),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::LogFile { path, source } => {
                write!(f, "Cannot open log file {}: {}", path.display(), source)
            }
            LoggingError::AlreadyInitialized(e) => {
                write!(f, "Tracing already initialized: {}", e)
            }
        }
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoggingError::LogFile { source, .. } => Some(source),
            LoggingError::AlreadyInitialized(_) => None,
        }
    }
}

/// Open `path` for appending, creating it if needed.
fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Console output is always enabled; `log_file`, when given, receives the
/// same events as JSON lines.
pub fn init_tracing(log_file: Option<&Path>) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let file = match log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
