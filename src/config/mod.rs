//! Configuration Module
//!
//! Provides TOML-based configuration for RadioMQ with support for:
//! - Broker connection settings
//! - Subscription topic and QoS
//! - Reconnection budget
//! - Radio transport and addressing
//! - Environment variable overrides (RADIOMQ__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::BrokerConfig;
pub use radio::{ModemConfig, RadioConfig, RadioKind, UdpRadioConfig};

mod broker;
mod radio;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// What the bridge subscribes to
    pub bridge: BridgeConfig,
    /// Reconnection budget after a connection loss
    pub reconnect: ReconnectConfig,
    /// Radio transmitter
    pub radio: RadioConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
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

/// Subscription configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Topic filter to subscribe to
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Requested QoS level (0, 1, or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_topic() -> String {
    "/controlling-drone".to_string()
}

fn default_qos() -> u8 {
    1
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            qos: default_qos(),
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect attempts before giving up
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Seconds to wait after each failed attempt
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_attempts() -> u32 {
    30
}

fn default_interval() -> u64 {
    1
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval: default_interval(),
        }
    }
}

impl ReconnectConfig {
    /// Get the retry interval as Duration
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RADIOMQ__` prefix with double underscores for nesting:
    ///    - `RADIOMQ__BROKER__ADDRESS=10.0.0.5:1883` overrides `broker.address`
    ///    - `RADIOMQ__BRIDGE__TOPIC=/telemetry` overrides `bridge.topic`
    ///    - `RADIOMQ__RADIO__DESTINATION=2` overrides `radio.destination`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.address", "localhost:1883")?
            .set_default("broker.client_id", "transmitter")?
            .set_default("broker.keepalive", 20)?
            .set_default("broker.clean_session", true)?
            .set_default("bridge.topic", "/controlling-drone")?
            .set_default("bridge.qos", 1)?
            .set_default("reconnect.attempts", 30)?
            .set_default("reconnect.interval", 1)?
            .set_default("radio.transport", "udp")?
            .set_default("radio.node_id", 10)?
            .set_default("radio.destination", 1)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RADIOMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
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
        if self.broker.address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.address must not be empty".to_string(),
            ));
        }

        if self.bridge.topic.is_empty() {
            return Err(ConfigError::Validation(
                "bridge.topic must not be empty".to_string(),
            ));
        }

        if self.bridge.qos > 2 {
            return Err(ConfigError::Validation(
                "bridge.qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.reconnect.attempts == 0 {
            return Err(ConfigError::Validation(
                "reconnect.attempts must be at least 1".to_string(),
            ));
        }

        if self.reconnect.interval == 0 {
            return Err(ConfigError::Validation(
                "reconnect.interval must be at least 1 second".to_string(),
            ));
        }

        let radio = &self.radio;
        let limit = radio.frame_size_limit();
        if radio.max_frame_size == 0 || radio.max_frame_size > limit {
            return Err(ConfigError::Validation(format!(
                "radio.max_frame_size must be between 1 and {} for the {} transport",
                limit, radio.transport
            )));
        }

        if !(5..=23).contains(&radio.tx_power_dbm) {
            return Err(ConfigError::Validation(
                "radio.tx_power_dbm must be between 5 and 23".to_string(),
            ));
        }

        if radio.destination == radio.node_id {
            return Err(ConfigError::Validation(format!(
                "radio.destination must differ from radio.node_id ({})",
                radio.node_id
            )));
        }

        let modem = &radio.modem;
        if !(6..=12).contains(&modem.spreading_factor) {
            return Err(ConfigError::Validation(
                "radio.modem.spreading_factor must be between 6 and 12".to_string(),
            ));
        }
        if !(5..=8).contains(&modem.coding_rate) {
            return Err(ConfigError::Validation(
                "radio.modem.coding_rate must be between 5 and 8".to_string(),
            ));
        }
        if modem.bandwidth_hz == 0 {
            return Err(ConfigError::Validation(
                "radio.modem.bandwidth_hz must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
