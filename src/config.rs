use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    pub bitrix: BitrixConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub max: MaxConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BitrixConfig {
    /// Connector code registered with the CRM's open-channel system.
    #[serde(default = "default_connector_code")]
    pub connector_code: String,
    /// Connect + total timeout for every outbound RPC call, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Process-wide fallback bot credential; per-tenant tokens stored in the
/// tenant row override it.
#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

// Manual Default impls: a derived Default would leave api_base empty when
// the whole section is absent, because serde only runs field-level defaults
// while parsing a present section.
impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api_base(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaxConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_max_api_base")]
    pub api_base: String,
}

impl Default for MaxConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_max_api_base(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("bridgebot.db")
}

fn default_connector_code() -> String {
    "bridgebot".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_max_api_base() -> String {
    "https://botapi.max.ru".to_string()
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind_addr: default_bind_addr(),
    }
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}
