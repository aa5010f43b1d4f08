//! Broker Session
//!
//! The bridge talks to the MQTT broker through the [`BrokerSession`] trait.
//! [`MqttSession`] is the TCP implementation; tests drive the bridge with
//! scripted sessions instead.

mod mqtt;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError, QoS};

pub use mqtt::MqttSession;

/// A publication received on the subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

/// Options used for every (re)connection of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker address as `host:port`
    pub address: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval announced in CONNECT; zero disables pings
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Upper bound for the TCP connect and each CONNACK/SUBACK wait
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: "transmitter".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(20),
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Error type for broker session operations
#[derive(Debug)]
pub enum SessionError {
    /// No connection is currently established
    NotConnected,
    /// The connection could not be established or was lost mid-operation
    ConnectionLost(String),
    /// Broker refused the CONNECT
    Refused(ConnectReturnCode),
    /// Broker answered SUBSCRIBE with a failure return code
    SubscriptionRejected(String),
    /// Operation timed out
    Timeout,
    /// Broker sent bytes that are not a valid packet
    Decode(DecodeError),
    /// Outgoing packet could not be encoded
    Encode(EncodeError),
    /// Broker sent a packet that is not valid at this point of the exchange
    UnexpectedPacket(&'static str),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "Not connected"),
            SessionError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            SessionError::Refused(code) => write!(f, "Connection refused: {}", code),
            SessionError::SubscriptionRejected(topic) => {
                write!(f, "Subscription to '{}' rejected", topic)
            }
            SessionError::Timeout => write!(f, "Operation timed out"),
            SessionError::Decode(e) => write!(f, "Decode error: {}", e),
            SessionError::Encode(e) => write!(f, "Encode error: {}", e),
            SessionError::UnexpectedPacket(what) => write!(f, "Unexpected packet: {}", what),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::ConnectionLost(e.to_string())
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Decode(e)
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        SessionError::Encode(e)
    }
}

/// Client-side view of a broker connection
///
/// `next_message` is the bridge's only suspension point in steady state. It
/// returns `None` when the connection drops (then `is_connected` is false)
/// or when the session has nothing more to deliver while still connected.
#[async_trait]
pub trait BrokerSession: Send {
    /// Establish the initial connection
    async fn connect(&mut self) -> Result<(), SessionError>;

    /// Subscribe to a topic filter and wait for the broker's acknowledgement
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError>;

    /// Wait for the next publication on any subscribed topic
    async fn next_message(&mut self) -> Option<InboundMessage>;

    /// Whether the session currently holds a usable connection
    fn is_connected(&self) -> bool;

    /// Drop any existing connection and connect again with the same options
    async fn reconnect(&mut self) -> Result<(), SessionError>;

    /// Disconnect gracefully
    async fn disconnect(&mut self) -> Result<(), SessionError>;
}
