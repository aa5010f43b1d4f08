//! RadioMQ - MQTT to packet radio bridge
//!
//! Subscribes to one topic on an MQTT v3.1.1 broker and transmits every
//! message it receives as a single frame over a half-duplex packet radio,
//! reconnecting to the broker within a bounded retry budget.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod radio;
pub mod session;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod mock;

pub use bridge::{BridgeError, BridgeExit, BridgeSettings, BridgeStats, MessageBridge};
pub use config::Config;
pub use protocol::QoS;
pub use radio::{LogRadio, RadioFrame, RadioTransport, UdpRadio};
pub use session::{BrokerSession, InboundMessage, MqttSession};
pub use status::{LinkStatus, StatusCallback};
pub use supervisor::{ConnectionSupervisor, RetryBudget, RetryPolicy, SupervisorOutcome};
