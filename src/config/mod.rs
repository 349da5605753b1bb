//! Configuration Module
//!
//! Provides TOML-based configuration for the relay with support for:
//! - Logging
//! - Broker session settings (address, identity, keep-alive, reconnect)
//! - Routing (subscription filter, result topic strategy)
//! - Environment variable overrides (VIBEMQ_RELAY__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat, Value};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub use broker::{BrokerAddress, BrokerConfig, BrokerProtocol};
pub use routing::{ResultStrategy, RoutingConfig};

use crate::protocol::MAX_PACKET_SIZE;
use crate::topic::{validate_topic_filter, validate_topic_name, SEPARATOR};

mod broker;
mod routing;


/// Environment override prefix
pub const ENV_PREFIX: &str = "VIBEMQ_RELAY";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Config crate error
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker session configuration
    pub broker: BrokerConfig,
    /// Routing configuration
    pub routing: RoutingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A single `key = value` override applied on top of file and environment,
/// e.g. `("broker.address", "tcp://localhost:1883".into())`
pub type Override = (&'static str, Value);

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEMQ_RELAY__` prefix with double underscores for nesting:
    ///    - `VIBEMQ_RELAY__BROKER__ADDRESS=tcp://localhost:1883` overrides `broker.address`
    ///    - `VIBEMQ_RELAY__ROUTING__SUBSCRIBE=sensors/#` overrides `routing.subscribe`
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, Vec::new())
    }

    /// Like [`Config::load`], with explicit overrides (command line) applied last.
    pub fn load_with_overrides<P: AsRef<Path>>(
        path: P,
        overrides: Vec<Override>,
    ) -> Result<Self, ConfigError> {
        let defaults = BrokerConfig::default();
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", default_log_level())?
            .set_default("broker.address", "")?
            .set_default("broker.client_id", "")?
            .set_default("broker.keep_alive", "30s")?
            .set_default("broker.ping_timeout", "10s")?
            .set_default("broker.connect_timeout", "30s")?
            .set_default("broker.ack_timeout", "10s")?
            .set_default("broker.auto_reconnect", defaults.auto_reconnect)?
            .set_default("broker.reconnect_interval", "1s")?
            .set_default("broker.max_reconnect_interval", "60s")?
            .set_default("broker.shutdown_grace", "250ms")?
            .set_default("broker.request_capacity", defaults.request_capacity as i64)?
            .set_default("broker.max_packet_size", defaults.max_packet_size as i64)?
            .set_default("routing.subscribe", "#")?
            .set_default("routing.subscribe_qos", 0)?
            .set_default("routing.strategy", "per_source_suffix")?
            .set_default("routing.suffix", routing::default_suffix())?
            .set_default("routing.qos", 0)?
            .set_default("routing.retain", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (VIBEMQ_RELAY__BROKER__ADDRESS, etc.)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder.set_override(key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;

        if broker.address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.address is required".to_string(),
            ));
        }
        broker.parse_address().map_err(ConfigError::Validation)?;

        if broker.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id is required".to_string(),
            ));
        }

        if !broker.keep_alive.is_zero() && broker.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "broker.keep_alive must be zero or at least 1s".to_string(),
            ));
        }

        for (name, value) in [
            ("broker.ping_timeout", broker.ping_timeout),
            ("broker.connect_timeout", broker.connect_timeout),
            ("broker.ack_timeout", broker.ack_timeout),
            ("broker.reconnect_interval", broker.reconnect_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{} must be non-zero", name)));
            }
        }

        if broker.max_reconnect_interval < broker.reconnect_interval {
            return Err(ConfigError::Validation(
                "broker.max_reconnect_interval must not be below broker.reconnect_interval"
                    .to_string(),
            ));
        }

        if broker.request_capacity == 0 {
            return Err(ConfigError::Validation(
                "broker.request_capacity must be non-zero".to_string(),
            ));
        }

        if broker.max_packet_size == 0 || broker.max_packet_size > MAX_PACKET_SIZE {
            return Err(ConfigError::Validation(format!(
                "broker.max_packet_size must be between 1 and {}",
                MAX_PACKET_SIZE
            )));
        }

        let routing = &self.routing;

        validate_topic_filter(&routing.subscribe)
            .map_err(|e| ConfigError::Validation(format!("routing.subscribe: {}", e)))?;

        validate_topic_name(&routing.suffix)
            .map_err(|e| ConfigError::Validation(format!("routing.suffix: {}", e)))?;
        if routing.suffix.contains(SEPARATOR) {
            return Err(ConfigError::Validation(
                "routing.suffix must be a single topic level".to_string(),
            ));
        }

        match (routing.strategy, &routing.fixed_topic) {
            (ResultStrategy::FixedTopic, None) => {
                return Err(ConfigError::Validation(
                    "routing.fixed_topic is required for the fixed_topic strategy".to_string(),
                ));
            }
            (_, Some(topic)) => {
                validate_topic_name(topic)
                    .map_err(|e| ConfigError::Validation(format!("routing.fixed_topic: {}", e)))?;
            }
            _ => {}
        }

        Ok(())
    }
}
