//! Engine configuration
//!
//! Loaded from `keysprint.toml`. Every field has a default, so a missing
//! file is fine and a partial file only overrides what it names.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::connection::BackoffPolicy;
use crate::core::constants::EXTENSION_THRESHOLD;

// =============================================================================
// CONFIGURATION STRUCTURES
// =============================================================================

/// Race server endpoints and the local display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// WebSocket endpoint, e.g. "wss://race.example.test/ws"
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// REST base URL, e.g. "https://race.example.test/api"
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Name sent with a fresh join
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

fn default_ws_url() -> String {
    "wss://localhost:8080/ws".to_string()
}
fn default_rest_url() -> String {
    "https://localhost:8080/api".to_string()
}
fn default_display_name() -> String {
    "guest".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            display_name: default_display_name(),
        }
    }
}

/// Reconnection overrides. Defaults match the protocol contract
/// (1s base, doubling, 10s cap, 5 attempts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_ms() -> u64 {
    1_000
}
fn default_cap_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            cap: Duration::from_millis(self.cap_ms),
            max_attempts: self.max_attempts,
            ..BackoffPolicy::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    /// Also log to stdout
    #[serde(default)]
    pub console: bool,
    /// Log file path. Empty = no file logging.
    #[serde(default)]
    pub log_file: String,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    /// Fraction of the target at which an extension request is sent
    #[serde(default = "default_extension_threshold")]
    pub extension_threshold: f64,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_extension_threshold() -> f64 {
    EXTENSION_THRESHOLD
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            reconnect: ReconnectSettings::default(),
            extension_threshold: default_extension_threshold(),
            logging: LoggingSettings::default(),
        }
    }
}

// =============================================================================
// CONFIG LOADING
// =============================================================================

#[derive(Debug)]
pub enum ConfigError {
    ReadError(std::io::Error),
    ParseError(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config file: {}", e),
        }
    }
}

impl EngineConfig {
    pub const CONFIG_FILENAME: &'static str = "keysprint.toml";

    /// Load configuration from `dir/keysprint.toml`; defaults when the
    /// file does not exist.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join(Self::CONFIG_FILENAME);
        Self::load_file(&config_path)
    }

    pub fn load_file(config_path: &PathBuf) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            debug!("[config] No config file found, using defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(config_path).map_err(ConfigError::ReadError)?;
        let config: EngineConfig = toml::from_str(&contents).map_err(ConfigError::ParseError)?;
        info!(path = %config_path.display(), "[config] Loaded config");
        Ok(config)
    }
}
