//! TunnelMux Settings
//!
//! Configuration for the client and the server.
//!
//! ## Features
//!
//! - One JSON file for both modes, every field optional
//! - Validation of mode-specific fields and addresses
//! - Command-line overrides applied on top of the file
//! - Hot reload: `SettingsWatcher` publishes fresh snapshots when the file
//!   changes; snapshots are never mutated in place
//!
//! ## Usage
//!
//! ```no_run
//! use tunnelmux_settings::{default_settings_path, Mode, Settings};
//!
//! let mut settings = Settings::load_from(&default_settings_path())?;
//! settings.mode = Mode::Server;
//! settings.validate()?;
//! settings.save()?;
//! # Ok::<(), tunnelmux_settings::SettingsError>(())
//! ```

mod config;
mod watcher;

pub use config::{ClientSettings, Mode, ServerSettings, Settings, SettingsOverrides};
pub use watcher::SettingsWatcher;

use std::path::PathBuf;

use thiserror::Error;
use tunnelmux_keystore::default_config_dir;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
