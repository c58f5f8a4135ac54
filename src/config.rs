//! Application configuration, read from `config.toml` in the workbench's
//! config directory. Missing keys fall back to defaults, and a default file is
//! written on first start.

use crate::error::ConfigError;
use crate::mqtt::config::{ConnectOptions, KEEP_ALIVE};
use crate::mqtt::mqtt_handler::SessionSettings;
use crate::persistence::ContextDefaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};

pub const APP_NAME: &str = "mqtt-workbench";
pub const CONFIG_FILE: &str = "config.toml";
/// Overrides `defaults.endpoint` when set.
pub const ENDPOINT_ENV: &str = "MQTT_URL";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the stored contexts; the config directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// 0 disables the timeout
    pub connect_timeout_secs: u64,
    pub request_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_log_messages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autosave_secs: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub endpoint: String,
    pub client_id_prefix: String,
    pub publish_topic: String,
    pub subscribe_topics: Vec<String>,
    /// Context that is active when none was recorded
    pub context: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            key: "contexts".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_capacity: 100,
            max_log_messages: None,
            autosave_secs: None,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        let context = ContextDefaults::default();
        Self {
            endpoint: context.endpoint,
            client_id_prefix: context.client_id_prefix,
            publish_topic: context.publish_topic,
            subscribe_topics: context.subscribe_topics,
            context: "default".to_string(),
        }
    }
}

impl AppConfig {
    /// `<config dir>/mqtt-workbench`, falling back to `~/.config/mqtt-workbench`.
    pub fn config_dir() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join(APP_NAME),
            None => {
                let home = dirs::home_dir().unwrap_or_else(|| {
                    warn!("Could not determine home directory, using current directory");
                    PathBuf::from(".")
                });
                home.join(".config").join(APP_NAME)
            }
        }
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join(CONFIG_FILE)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    /// Loads `path`, writing a default config there first if it does not exist.
    pub async fn ensure_default_config(path: &Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path).await? {
            info!("Creating default configuration at {}", path.display());
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = toml::to_string_pretty(&AppConfig::default())?;
            tokio::fs::write(path, content).await?;
        }
        Self::load(path).await
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.parse::<Level>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level {:?}",
                self.log_level
            )));
        }
        if self.storage.key.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.key must not be empty".to_string()));
        }
        if self.session.request_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.request_capacity must be at least 1".to_string(),
            ));
        }
        if self.session.autosave_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "session.autosave_secs must be at least 1 when set".to_string(),
            ));
        }
        if self.defaults.context.trim().is_empty() {
            return Err(ConfigError::Invalid("defaults.context must not be empty".to_string()));
        }
        Ok(())
    }

    /// Applies environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            if !endpoint.trim().is_empty() {
                self.defaults.endpoint = endpoint.trim().to_string();
            }
        }
    }

    pub fn log_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage.dir.clone().unwrap_or_else(Self::config_dir)
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        self.session.autosave_secs.map(Duration::from_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect: ConnectOptions {
                keep_alive: KEEP_ALIVE,
                request_capacity: self.session.request_capacity,
            },
            connect_timeout: match self.session.connect_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_log_messages: self.session.max_log_messages,
        }
    }

    pub fn context_defaults(&self) -> ContextDefaults {
        ContextDefaults {
            endpoint: self.defaults.endpoint.clone(),
            client_id_prefix: self.defaults.client_id_prefix.clone(),
            publish_topic: self.defaults.publish_topic.clone(),
            subscribe_topics: self.defaults.subscribe_topics.clone(),
        }
    }
}
