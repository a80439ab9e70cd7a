//! TunnelMux Logging
//!
//! Process-wide `tracing` setup shared by the client and the server.
//! `RUST_LOG` always wins over the configured level.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Unknown log level {0:?} (expected error, warn, info, debug or trace)")]
    UnknownLevel(String),

    #[error("Failed to open log file {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Filter used when `RUST_LOG` is unset.
    ///
    /// libp2p internals stay at `warn` unless tracing everything.
    pub fn filter_directives(self) -> String {
        match self {
            LogLevel::Trace => self.as_str().to_string(),
            _ => format!("{},libp2p_swarm=warn,libp2p_tcp=warn,yamux=warn", self),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::UnknownLevel(s.to_string())),
        }
    }
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.filter_directives()))
}

/// Install the global subscriber.
///
/// Logs go to the console, or only to `log_file` (appended,
/// no ANSI colors) when one is given.
pub fn try_init(level: LogLevel, log_file: Option<&Path>) -> Result<(), LoggingError> {
    let (console, file) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            let layer = fmt_layer::layer().with_ansi(false).with_writer(Mutex::new(file));
            (None, Some(layer))
        }
        None => (Some(fmt_layer::layer()), None),
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
