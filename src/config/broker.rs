//! Broker Configuration
//!
//! Connection settings for the upstream MQTT broker.

use std::time::Duration;

use serde::Deserialize;

use crate::session::ConnectOptions;

/// Configuration for the broker connection
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker address (host:port or just host)
    #[serde(default = "default_address")]
    pub address: String,

    /// Client ID to use when connecting
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Start with a clean session (no broker-side session state)
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_address() -> String {
    "localhost:1883".to_string()
}

fn default_client_id() -> String {
    "transmitter".to_string()
}

fn default_keepalive() -> u16 {
    20
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_session: true,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl BrokerConfig {
    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Parse address into host and port, defaulting to 1883
    pub fn parse_address(&self) -> (String, u16) {
        let address = self
            .address
            .strip_prefix("tcp://")
            .or_else(|| self.address.strip_prefix("mqtt://"))
            .unwrap_or(&self.address);

        if let Some((host, port_str)) = address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (address.to_string(), 1883)
    }

    /// Options handed to the broker session for every (re)connection
    pub fn connect_options(&self) -> ConnectOptions {
        let (host, port) = self.parse_address();
        ConnectOptions {
            address: format!("{}:{}", host, port),
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: Duration::from_secs(self.keepalive as u64),
            clean_session: self.clean_session,
            connect_timeout: self.connect_timeout_duration(),
        }
    }
}
