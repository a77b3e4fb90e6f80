//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tally_chat::ReplayPacing;

/// Backend used when neither the flag nor the config file names one
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Configuration for tally
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dashboard backend, e.g. "http://localhost:8000"
    pub base_url: Option<String>,
    /// Agent configuration to route chat requests to
    pub agent_id: Option<i64>,
    pub replay: ReplayConfig,
}

/// Replay settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Type user turns without waiting for the step key
    pub auto_step: Option<bool>,
    pub pacing: ReplayPacing,
    pub keys: ReplayKeys,
}

/// Key names for replay control (see `input::parse_key`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayKeys {
    pub step: String,
    pub pause: String,
    pub stop: String,
}

impl Default for ReplayKeys {
    fn default() -> Self {
        Self {
            step: "enter".to_string(),
            pause: "space".to_string(),
            stop: "esc".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tally")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TALLY_CONFIG_PATH") {
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
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Self::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
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
            base_url: Some(DEFAULT_BASE_URL.to_string()),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Base URL, preferring the command-line value
    pub fn base_url(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# tally configuration file
# Place at ~/.config/tally/config.toml (Linux/Mac) or %APPDATA%\tally\config.toml (Windows)
# or point TALLY_CONFIG_PATH at it

# Dashboard backend
base_url = "http://localhost:8000"

# Agent configuration to chat with (optional)
# agent_id = 1

[replay]
# Type user turns without waiting for the step key
# auto_step = false

[replay.keys]
step = "enter"
pause = "space"
stop = "esc"

# Chunk sizes are in characters, delays in milliseconds
[replay.pacing]
user_chunk = { min = 1, max = 2 }
user_delay_ms = { min = 24, max = 58 }
reasoning_chunk = { min = 2, max = 6 }
reasoning_delay_ms = { min = 4, max = 12 }
answer_chunk = { min = 2, max = 7 }
answer_delay_ms = { min = 5, max = 14 }
tick_ms = 60
"#
}
