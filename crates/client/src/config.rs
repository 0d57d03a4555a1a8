// Client configuration file.
//
// Global config: `~/.cowrite/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use cowrite_common::protocol::control::AiAction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autotrigger::{
    AutoTriggerConfig, DEFAULT_COOLDOWN_MS, DEFAULT_DEBOUNCE_MS, DEFAULT_MIN_CHANGE,
    DEFAULT_MIN_CHARACTERS,
};
use crate::session::ReconnectPolicy;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3030/ws";

/// Root directory for client state: `~/.cowrite/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".cowrite"))
}

/// Path to the config file: `~/.cowrite/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Default replica store: `~/.cowrite/replicas.db`.
pub fn default_store_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("replicas.db"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the authority.
    pub server_url: String,
    /// HTTP base of the refinement service (e.g. `http://127.0.0.1:3030`).
    pub refine_url: Option<String>,
    /// SQLite file holding replica updates. Defaults under `~/.cowrite/`.
    pub store_path: Option<PathBuf>,
    pub session: SessionConfig,
    pub auto_trigger: AutoTriggerSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            refine_url: None,
            store_path: None,
            session: SessionConfig::default(),
            auto_trigger: AutoTriggerSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `~/.cowrite/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn resolved_store_path(&self) -> Option<PathBuf> {
        self.store_path.clone().or_else(default_store_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub reconnect_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { reconnect_delay_ms: ReconnectPolicy::default().delay.as_millis() as u64 }
    }
}

impl SessionConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy { delay: Duration::from_millis(self.reconnect_delay_ms) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutoTriggerSettings {
    pub enabled: bool,
    pub debounce_ms: u64,
    pub cooldown_ms: u64,
    pub min_characters: usize,
    pub min_change: usize,
    /// Action sent when the trigger fires.
    pub action: AiAction,
    /// Agent role sent with `AGENT` actions.
    pub role: String,
}

impl Default for AutoTriggerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            min_characters: DEFAULT_MIN_CHARACTERS,
            min_change: DEFAULT_MIN_CHANGE,
            action: AiAction::Agent,
            role: "composer".to_string(),
        }
    }
}

impl AutoTriggerSettings {
    pub fn scheduler_config(&self) -> AutoTriggerConfig {
        AutoTriggerConfig {
            enabled: self.enabled,
            debounce: Duration::from_millis(self.debounce_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            min_characters: self.min_characters,
            min_change: self.min_change,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
