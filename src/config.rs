//! Configuration for the link layer
//!
//! Broker endpoint and tuning knobs, loadable from a TOML file. Credentials
//! are indirected through environment variable names so configuration files
//! never carry secrets; the variables are resolved at connect time.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Link configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// Broker URL, `mqtt://host[:port]` or `mqtts://host[:port]` (TLS).
    pub broker_url: String,
    /// Environment variable containing the broker username.
    pub username_env: Option<String>,
    /// Environment variable containing the broker password.
    pub password_env: Option<String>,
    /// MQTT keep-alive interval in seconds (default: 3600).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Bound on the shutdown publish-drain wait in milliseconds
    /// (default: 1000). Shutdown proceeds regardless once it elapses.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_keep_alive_secs() -> u64 {
    3600
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

impl LinkConfig {
    /// Configuration with defaults for the given broker URL.
    pub fn for_broker(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive_secs(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }

    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the broker URL without opening a connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?;
        if url.scheme() != "mqtt" && url.scheme() != "mqtts" {
            return Err(ConfigError::InvalidBrokerUrl(self.broker_url.clone()));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidBrokerUrl(self.broker_url.clone()));
        }
        Ok(())
    }

    /// Broker username resolved from the environment, if configured.
    pub fn username(&self) -> Option<String> {
        resolve_env(self.username_env.as_ref())
    }

    /// Broker password resolved from the environment, if configured.
    pub fn password(&self) -> Option<String> {
        resolve_env(self.password_env.as_ref())
    }

    /// Drain bound as a [`std::time::Duration`].
    pub fn drain_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.drain_timeout_ms)
    }
}

fn resolve_env(name: Option<&String>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}
