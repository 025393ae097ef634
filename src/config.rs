//! Resilience settings and credential lookup
//!
//! Settings live in `<config_dir>/resilient-stt/config.json`. A missing or
//! unreadable file yields defaults; saving is atomic (temp file + rename).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::circuit::CircuitBreakerConfig;
use crate::streaming::{ConnectionConfig, ReconnectPolicy};
use crate::transcript::SegmentLogConfig;

const CONFIG_FILE_NAME: &str = "config.json";

/// Environment variable holding the long-lived API key
pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

/// Breaker id guarding the speech-to-text backend
pub const STT_SERVICE_ID: &str = "speech_to_text";

#[derive(Debug)]
pub enum ConfigError {
    /// Platform has no config directory
    NoConfigDir,
    Io(String),
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoConfigDir => write!(f, "Could not determine config directory"),
            ConfigError::Io(e) => write!(f, "Config file error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Template for every source's connection; the label is set per source
    pub connection: ConnectionConfig,

    pub reconnect: ReconnectPolicy,

    pub segment_log: SegmentLogConfig,

    /// One entry per guarded dependency
    pub circuit_breakers: Vec<CircuitBreakerConfig>,

    /// Breaker consulted before each streaming connection attempt.
    /// `None` leaves connections unguarded.
    pub stt_breaker_id: Option<String>,

    /// Directory of the durable store. Defaults to the platform data dir.
    pub state_dir: Option<PathBuf>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reconnect: ReconnectPolicy::default(),
            segment_log: SegmentLogConfig::default(),
            circuit_breakers: vec![CircuitBreakerConfig::new(STT_SERVICE_ID)],
            stt_breaker_id: Some(STT_SERVICE_ID.to_string()),
            state_dir: None,
        }
    }
}

impl ResilienceConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(crate::storage::default_state_dir)
    }
}

/// Default config file location
pub fn config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("resilient-stt").join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

/// Load from the default location, falling back to defaults
pub fn load_config() -> ResilienceConfig {
    match config_path() {
        Ok(path) => load_config_from(&path),
        Err(e) => {
            log::warn!("Config: {}", e);
            ResilienceConfig::default()
        }
    }
}

pub fn load_config_from(path: &Path) -> ResilienceConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ResilienceConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Config: failed to parse {:?}: {}", path, e);
                ResilienceConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ResilienceConfig::default(),
        Err(e) => {
            log::warn!("Config: failed to read {:?}: {}", path, e);
            ResilienceConfig::default()
        }
    }
}

pub fn save_config(config: &ResilienceConfig) -> Result<(), ConfigError> {
    save_config_to(&config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &ResilienceConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConfigError::Io(format!("create config directory {:?}: {}", parent, e))
        })?;
    }

    let contents =
        serde_json::to_string_pretty(config).map_err(|e| ConfigError::Serialize(e.to_string()))?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| ConfigError::Io(format!("write temp config {:?}: {}", tmp_path, e)))?;

    // On Windows, rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(ConfigError::Io(format!(
                    "remove existing config {:?}: {}",
                    path, e
                )));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        ConfigError::Io(format!(
            "rename temp config {:?} to {:?}: {}",
            tmp_path, path, e
        ))
    })
}

/// Load a `.env` file from the working directory, if any (development)
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => log::debug!("Loaded environment from {:?}", path),
        Err(e) if e.not_found() => {}
        Err(e) => log::warn!("Failed to load .env: {}", e),
    }
}

/// Get the speech-to-text API key from the environment
pub fn get_api_key() -> Option<String> {
    usable_key(std::env::var(API_KEY_ENV).ok())
}

/// Blank values count as unset
fn usable_key(raw: Option<String>) -> Option<String> {
    raw.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}
