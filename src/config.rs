use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Base URL of the chat server, e.g. "http://localhost:3000".
    pub base_url: String,
    pub channel_id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ViewerConfig {
    #[serde(default = "default_emoji_base_url")]
    pub emoji_base_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            emoji_base_url: default_emoji_base_url(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_emoji_base_url() -> String {
    "/images/emoji".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}
