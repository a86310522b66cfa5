//! Configuration persistence
//!
//! Client settings live in a TOML file under the platform config directory:
//! - Linux: ~/.config/meshchat/config.toml
//! - Windows: %APPDATA%\meshchat\config.toml
//! - macOS: ~/Library/Application Support/meshchat/config.toml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_NAME: &str = "meshchat";

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

const DEFAULT_DISPLAY_NAME: &str = "anonymous";

/// Public STUN servers used when none are configured
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const DEFAULT_HISTORY_CAPACITY: usize = 100;

const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 30_000;

const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Config file does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which transport carries chat messages
///
/// Defaults to `Mesh` when built with real peer links (feature `webrtc`),
/// otherwise to `Broker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct peer-to-peer data channels
    Mesh,
    /// Messages published through the signaling relay
    Broker,
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(feature = "webrtc") {
            Self::Mesh
        } else {
            Self::Broker
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mesh" => Ok(Self::Mesh),
            "broker" => Ok(Self::Broker),
            other => Err(format!("unknown transport '{}', expected mesh or broker", other)),
        }
    }
}

/// Relay reconnection after the signaling link drops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    #[serde(default = "default_display_name")]
    pub display_name: String,

    /// STUN/TURN urls handed to the peer connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    /// Delivered messages kept in local history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Time allowed for a peer link to open, 0 disables the deadline
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_signaling_url() -> String {
    DEFAULT_SIGNALING_URL.to_string()
}

fn default_display_name() -> String {
    DEFAULT_DISPLAY_NAME.to_string()
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_negotiation_timeout_ms() -> u64 {
    DEFAULT_NEGOTIATION_TIMEOUT_MS
}

fn default_join_timeout_ms() -> u64 {
    DEFAULT_JOIN_TIMEOUT_MS
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            display_name: default_display_name(),
            ice_servers: default_ice_servers(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            transport: TransportKind::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(ConfigError::Invalid(format!(
                "signaling url {} must start with ws:// or wss://",
                self.signaling_url
            )));
        }

        if self.ice_servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one ICE server is required".to_string(),
            ));
        }

        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be positive".to_string(),
            ));
        }

        if self.join_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "join_timeout_ms must be positive".to_string(),
            ));
        }

        if self.reconnect.enabled && self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be positive when reconnect is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Default config file location, if the platform has one
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load and validate the config from the platform location
pub fn load_config() -> Result<ChatConfig, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<ChatConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path)?;
    let config: ChatConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Validate and write the config, creating parent directories
pub fn save_config_to(config: &ChatConfig, path: &Path) -> Result<(), ConfigError> {
    config.validate()?;

    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }

    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.signaling_url, "ws://127.0.0.1:8080");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.negotiation_timeout_ms, 30_000);
        assert!(!config.reconnect.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_url() {
        let config = ChatConfig {
            signaling_url: "http://example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_validation_empty_ice_servers() {
        let config = ChatConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_history() {
        let config = ChatConfig {
            history_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization_with_defaults() {
        let toml_str = r#"
            signaling_url = "wss://relay.example.com"
            transport = "broker"

            [reconnect]
            enabled = true
        "#;

        let config: ChatConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.signaling_url, "wss://relay.example.com");
        assert_eq!(config.transport, TransportKind::Broker);
        assert_eq!(config.display_name, "anonymous");
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_reconnect_delay_doubles_until_cap() {
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_default_transport_matches_build() {
        #[cfg(feature = "webrtc")]
        assert_eq!(TransportKind::default(), TransportKind::Mesh);
        #[cfg(not(feature = "webrtc"))]
        assert_eq!(TransportKind::default(), TransportKind::Broker);

        let config: ChatConfig = toml::from_str("display_name = \"bob\"").unwrap();
        assert_eq!(config.transport, TransportKind::default());
    }

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("mesh".parse::<TransportKind>(), Ok(TransportKind::Mesh));
        assert_eq!("BROKER".parse::<TransportKind>(), Ok(TransportKind::Broker));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = ChatConfig {
            display_name: "alice".to_string(),
            history_capacity: 25,
            ..Default::default()
        };
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config_from(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "signaling_url = \"ftp://nope\"\n").unwrap();

        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
