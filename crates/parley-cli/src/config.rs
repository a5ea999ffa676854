//! Configuration file support

use parley_api::BackendConfig;
use parley_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for parley. Unset fields fall back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL
    pub base_url: Option<String>,
    /// Path of the streaming chat endpoint
    pub stream_path: Option<String>,
    /// Let the backend use long-term memory
    pub include_memory: Option<bool>,
    /// Conversations fetched at startup
    pub page_size: Option<u32>,
    /// Minimum milliseconds between two redraws of a streaming answer
    pub frame_interval_ms: Option<u64>,
    /// Maximum number of unsynced conversations kept
    pub max_local_only: Option<usize>,
    /// Where conversations are saved between runs
    pub snapshot_path: Option<String>,
    /// Quiet period before changes are saved
    pub autosave_debounce_ms: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            base_url: Some(parley_api::client::DEFAULT_BASE_URL.to_string()),
            include_memory: Some(true),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Location of the conversation snapshot
    pub fn snapshot_path(&self) -> PathBuf {
        match &self.snapshot_path {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("parley")
                .join("conversations.json"),
        }
    }

    /// Delay before autosaving
    pub fn autosave_debounce(&self) -> Duration {
        self.autosave_debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(parley_core::persist::DEFAULT_AUTOSAVE_DEBOUNCE)
    }

    /// Backend client settings
    pub fn backend(&self) -> BackendConfig {
        let defaults = BackendConfig::default();
        BackendConfig {
            base_url: self.base_url.clone().unwrap_or(defaults.base_url),
            stream_path: self.stream_path.clone().unwrap_or(defaults.stream_path),
            ..defaults
        }
    }

    /// Engine settings
    pub fn engine(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            page_size: self.page_size.unwrap_or(defaults.page_size),
            include_memory: self.include_memory.unwrap_or(defaults.include_memory),
            frame_interval: self
                .frame_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.frame_interval),
            max_local_only: self.max_local_only.unwrap_or(defaults.max_local_only),
        }
    }
}

/// Example configuration file content
pub fn example_config() -> &'static str {
    r#"# parley configuration file
# Place at ~/.config/parley/config.toml (Linux) or set PARLEY_CONFIG_PATH

# Chat backend
base_url = "http://127.0.0.1:8000/api"
# stream_path = "/chat/stream"

# Let the backend draw on long-term memory
include_memory = true

# Conversations fetched at startup
# page_size = 50

# Redraw interval for streaming answers, in milliseconds
# frame_interval_ms = 16

# Unsynced conversations kept before the oldest are dropped
# max_local_only = 50

# Conversation snapshot (defaults to the local data directory)
# snapshot_path = "~/.local/share/parley/conversations.json"
# autosave_debounce_ms = 500
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("http://127.0.0.1:8000/api"));
        assert_eq!(config.include_memory, Some(true));
        assert!(config.page_size.is_none());
    }

    #[test]
    fn test_defaults_fill_unset_fields() {
        let config: Config = toml::from_str("frame_interval_ms = 40\npage_size = 10").unwrap();
        let engine = config.engine();
        assert_eq!(engine.frame_interval, Duration::from_millis(40));
        assert_eq!(engine.page_size, 10);
        assert!(engine.include_memory);

        let backend = config.backend();
        assert_eq!(backend.base_url, parley_api::client::DEFAULT_BASE_URL);
        assert_eq!(backend.stream_path, parley_api::client::DEFAULT_STREAM_PATH);
    }

    #[test]
    fn test_snapshot_path_override() {
        let config = Config {
            snapshot_path: Some("/tmp/parley.json".into()),
            ..Default::default()
        };
        assert_eq!(config.snapshot_path(), PathBuf::from("/tmp/parley.json"));
        assert!(
            Config::default()
                .snapshot_path()
                .ends_with("parley/conversations.json")
        );
    }
}
