//! Command router configuration.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. A TOML file (`CommandRouterConfig::load`)
//! 3. Environment variables (`CommandRouterConfig::apply_env`)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, RouterError};

/// Default values.
pub mod defaults {
    pub const CONNECTION_CHECK_TIMEOUT_MS: u64 = 1000;
    pub const RECREATE_CONSUMERS_DELAY_MS: u64 = 20;
    pub const INITIAL_CREDITS: u32 = 200;
    pub const SEND_TIMEOUT_MS: u64 = 1000;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONNECTION_CHECK_TIMEOUT_MS: &str = "COMMAND_ROUTER_CONNECTION_CHECK_TIMEOUT_MS";
    pub const RECREATE_CONSUMERS_DELAY_MS: &str = "COMMAND_ROUTER_RECREATE_CONSUMERS_DELAY_MS";
    pub const INITIAL_CREDITS: &str = "COMMAND_ROUTER_INITIAL_CREDITS";
    pub const SEND_TIMEOUT_MS: &str = "COMMAND_ROUTER_SEND_TIMEOUT_MS";
    pub const JMS_VENDOR_PROPS_ENABLED: &str = "COMMAND_ROUTER_JMS_VENDOR_PROPS_ENABLED";
}

/// Command router configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRouterConfig {
    /// Maximum wait for the connection to become live
    #[serde(default = "default_connection_check_timeout")]
    pub connection_check_timeout_ms: u64,

    /// Delay before a failed consumer recreation sweep is retried
    #[serde(default = "default_recreate_consumers_delay")]
    pub recreate_consumers_delay_ms: u64,

    /// Credits granted on tenant command receiver links
    #[serde(default = "default_initial_credits")]
    pub initial_credits: u32,

    /// Maximum wait for the outcome of a sent message
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Include JMS vendor properties in command response messages
    #[serde(default)]
    pub jms_vendor_props_enabled: bool,
}

fn default_connection_check_timeout() -> u64 {
    defaults::CONNECTION_CHECK_TIMEOUT_MS
}

fn default_recreate_consumers_delay() -> u64 {
    defaults::RECREATE_CONSUMERS_DELAY_MS
}

fn default_initial_credits() -> u32 {
    defaults::INITIAL_CREDITS
}

fn default_send_timeout() -> u64 {
    defaults::SEND_TIMEOUT_MS
}

impl Default for CommandRouterConfig {
    fn default() -> Self {
        Self {
            connection_check_timeout_ms: default_connection_check_timeout(),
            recreate_consumers_delay_ms: default_recreate_consumers_delay(),
            initial_credits: default_initial_credits(),
            send_timeout_ms: default_send_timeout(),
            jms_vendor_props_enabled: false,
        }
    }
}

impl CommandRouterConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RouterError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RouterError::InvalidConfiguration(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::info!(
            category = "config",
            "Loading command router config from: {}",
            path.display()
        );

        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults and environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse(env_vars::CONNECTION_CHECK_TIMEOUT_MS) {
            self.connection_check_timeout_ms = v;
        }
        if let Some(v) = env_parse(env_vars::RECREATE_CONSUMERS_DELAY_MS) {
            self.recreate_consumers_delay_ms = v;
        }
        if let Some(v) = env_parse(env_vars::INITIAL_CREDITS) {
            self.initial_credits = v;
        }
        if let Some(v) = env_parse(env_vars::SEND_TIMEOUT_MS) {
            self.send_timeout_ms = v;
        }
        if let Some(v) = env_parse(env_vars::JMS_VENDOR_PROPS_ENABLED) {
            self.jms_vendor_props_enabled = v;
        }
    }

    /// Check the configuration for unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.connection_check_timeout_ms == 0 {
            return Err(RouterError::InvalidConfiguration(
                "connection_check_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.send_timeout_ms == 0 {
            return Err(RouterError::InvalidConfiguration(
                "send_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.initial_credits == 0 {
            return Err(RouterError::InvalidConfiguration(
                "initial_credits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection_check_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_check_timeout_ms)
    }

    pub fn recreate_consumers_delay(&self) -> Duration {
        Duration::from_millis(self.recreate_consumers_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(category = "config", "Ignoring invalid value '{}' for {}", raw, name);
            None
        }
    }
}
