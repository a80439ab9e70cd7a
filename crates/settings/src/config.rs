//! Configuration types

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use tunnelmux_logging::LogLevel;
use tunnelmux_network::{parse_multiaddr, RemoteAddr, DEFAULT_PROTOCOL_ID};

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: Mode,

    /// error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log to this file instead of the console
    #[serde(default)]
    pub log_file: Option<String>,

    /// How often the settings file is checked for changes
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub server: ServerSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reload_interval() -> u64 {
    30
}

fn default_protocol_id() -> String {
    DEFAULT_PROTOCOL_ID.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            log_level: default_log_level(),
            log_file: None,
            reload_interval_secs: default_reload_interval(),
            client: ClientSettings::default(),
            server: ServerSettings::default(),
            config_path: None,
        }
    }
}

impl Settings {
    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings = Self::from_json(&content)?;
            settings.config_path = Some(path.to_path_buf());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.to_path_buf());
            Ok(settings)
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(SettingsError::ParseError)
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// File these settings were loaded from
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub(crate) fn set_config_path(&mut self, path: PathBuf) {
        self.config_path = Some(path);
    }

    pub fn log_level(&self) -> Result<LogLevel> {
        self.log_level
            .parse::<LogLevel>()
            .map_err(|e| invalid(e.to_string()))
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    /// Check the fields the selected mode needs
    pub fn validate(&self) -> Result<()> {
        self.log_level()?;
        if self.reload_interval_secs == 0 {
            return Err(invalid("reload_interval_secs must be greater than zero"));
        }

        match self.mode {
            Mode::Client => self.client.validate(),
            Mode::Server => self.server.validate(),
        }
    }

    pub fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(mode) = overrides.mode {
            self.mode = mode;
        }
        if let Some(server_addr) = &overrides.server_addr {
            self.client.server_addr = server_addr.clone();
        }
        if let Some(local_addr) = &overrides.local_addr {
            self.client.local_addr = local_addr.clone();
        }
        if let Some(listen_addr) = &overrides.listen_addr {
            self.server.listen_addr = listen_addr.clone();
        }
        if let Some(log_level) = &overrides.log_level {
            self.log_level = log_level.clone();
        }
    }
}

fn invalid(msg: impl Into<String>) -> SettingsError {
    SettingsError::Invalid(msg.into())
}

fn validate_protocol_id(protocol_id: &str) -> Result<()> {
    if !protocol_id.starts_with('/') {
        return Err(invalid(format!(
            "protocol_id {:?} must start with '/'",
            protocol_id
        )));
    }
    Ok(())
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Local SOCKS5 proxy tunneling to a server
    #[default]
    Client,
    /// Tunnel endpoint dialing destinations
    Server,
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Tunnel server ("peer_id@multiaddr", multiaddr or host:port)
    #[serde(default)]
    pub server_addr: String,

    /// SOCKS5 listen address
    #[serde(default = "default_local_addr")]
    pub local_addr: String,

    /// Keyfile path
    #[serde(default)]
    pub keyfile: Option<String>,

    #[serde(default = "default_protocol_id")]
    pub protocol_id: String,

    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Redials after the session is lost; 0 disables reconnecting
    #[serde(default)]
    pub reconnect_times: u32,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_local_addr() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    2
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            local_addr: default_local_addr(),
            keyfile: None,
            protocol_id: default_protocol_id(),
            connect_timeout_secs: default_timeout(),
            reconnect_times: 0,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl ClientSettings {
    pub fn remote_addr(&self) -> Result<RemoteAddr> {
        if self.server_addr.trim().is_empty() {
            return Err(invalid("client.server_addr is required"));
        }
        self.server_addr
            .parse::<RemoteAddr>()
            .map_err(|e| invalid(format!("client.server_addr: {}", e)))
    }

    pub fn local_socket_addr(&self) -> Result<SocketAddr> {
        self.local_addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("client.local_addr {:?}: {}", self.local_addr, e)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    fn validate(&self) -> Result<()> {
        self.remote_addr()?;
        self.local_socket_addr()?;
        validate_protocol_id(&self.protocol_id)?;
        if self.connect_timeout_secs == 0 {
            return Err(invalid("client.connect_timeout_secs must be greater than zero"));
        }
        Ok(())
    }
}

/// Server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address (multiaddr or host:port)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Keyfile path
    #[serde(default)]
    pub keyfile: Option<String>,

    #[serde(default = "default_protocol_id")]
    pub protocol_id: String,

    /// Destination TCP connect timeout
    #[serde(default = "default_timeout")]
    pub dial_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "/ip4/0.0.0.0/tcp/9000".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            keyfile: None,
            protocol_id: default_protocol_id(),
            dial_timeout_secs: default_timeout(),
        }
    }
}

impl ServerSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        parse_multiaddr(&self.listen_addr)
            .map_err(|e| invalid(format!("server.listen_addr: {}", e)))?;
        validate_protocol_id(&self.protocol_id)?;
        if self.dial_timeout_secs == 0 {
            return Err(invalid("server.dial_timeout_secs must be greater than zero"));
        }
        Ok(())
    }
}

/// Values given on the command line, taking precedence over the file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub mode: Option<Mode>,
    pub server_addr: Option<String>,
    pub local_addr: Option<String>,
    pub listen_addr: Option<String>,
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "12D3KooWQNV9B3aYrwqXfzQA9K6c1AzPLQVLyZsyYqNqXcT7Th5E";

    fn client_settings() -> Settings {
        let mut settings = Settings::default();
        settings.client.server_addr = format!("{}@/ip4/203.0.113.5/tcp/9000", PEER);
        settings
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.mode, Mode::Client);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.reload_interval_secs, 30);
        assert_eq!(settings.client.local_addr, "127.0.0.1:1080");
        assert_eq!(settings.client.connect_timeout_secs, 10);
        assert_eq!(settings.client.reconnect_times, 0);
        assert_eq!(settings.server.listen_addr, "/ip4/0.0.0.0/tcp/9000");
        assert_eq!(settings.server.dial_timeout(), Duration::from_secs(10));
        assert_eq!(settings.server.protocol_id, DEFAULT_PROTOCOL_ID);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = Settings::from_json(
            r#"{ "mode": "server", "server": { "listen_addr": ":4443" } }"#,
        )
        .unwrap();
        assert_eq!(settings.mode, Mode::Server);
        assert_eq!(settings.server.listen_addr, ":4443");
        assert_eq!(settings.server.dial_timeout_secs, 10);
        assert_eq!(settings.log_level, "info");
        settings.validate().unwrap();
    }

    #[test]
    fn test_settings_serialization() {
        let settings = client_settings();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed = Settings::from_json(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_client_requires_server_addr() {
        let settings = Settings::default();
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
        client_settings().validate().unwrap();
    }

    #[test]
    fn test_invalid_fields_rejected() {
        let mut settings = client_settings();
        settings.client.local_addr = "localhost".to_string();
        assert!(settings.validate().is_err());

        let mut settings = client_settings();
        settings.log_level = "loud".to_string();
        assert!(settings.validate().is_err());

        let mut settings = client_settings();
        settings.client.connect_timeout_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.mode = Mode::Server;
        settings.server.protocol_id = "tunnel".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let mut settings = Settings::default();
        settings.apply_overrides(&SettingsOverrides {
            mode: None,
            server_addr: Some("tunnel.example.com:9000".to_string()),
            local_addr: Some("127.0.0.1:1081".to_string()),
            listen_addr: None,
            log_level: Some("debug".to_string()),
        });
        assert_eq!(settings.client.server_addr, "tunnel.example.com:9000");
        assert_eq!(settings.client.local_addr, "127.0.0.1:1081");
        assert_eq!(settings.server.listen_addr, "/ip4/0.0.0.0/tcp/9000");
        assert_eq!(settings.log_level().unwrap(), LogLevel::Debug);
        settings.validate().unwrap();

        settings.apply_overrides(&SettingsOverrides {
            mode: Some(Mode::Server),
            ..Default::default()
        });
        assert_eq!(settings.mode, Mode::Server);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("tunnelmux-settings-{}", rand::random::<u64>()));
        let path = dir.join("settings.json");

        let settings = client_settings();
        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.client, settings.client);
        assert_eq!(loaded.config_path(), Some(path.as_path()));

        let _ = std::fs::remove_dir_all(dir);
    }
}
