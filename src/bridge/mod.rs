//! Message Bridge
//!
//! Pulls publications from the broker session and puts each one on air as a
//! single radio frame. Frames go out strictly one at a time, in arrival
//! order: the bridge waits for the radio to finish a frame before it asks
//! the broker for the next message.
//!
//! Connection losses are handed to the [`ConnectionSupervisor`]. When it
//! gives up the bridge stops with [`BridgeError::BrokerUnrecoverable`].

#[cfg(test)]
mod tests;

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RadioConfig};
use crate::protocol::{QoS, Subscription};
use crate::radio::{hex_dump, FrameError, NodeId, RadioError, RadioFrame, RadioTransport};
use crate::session::{BrokerSession, InboundMessage, SessionError};
use crate::status::{notify, LinkStatus, StatusCallback};
use crate::supervisor::{ConnectionSupervisor, RetryPolicy, SupervisorOutcome};

/// Error type for the bridge
#[derive(Debug)]
pub enum BridgeError {
    /// Initial connect or subscribe failed
    Connect(SessionError),
    /// Radio could not be brought up
    Radio(RadioError),
    /// Reconnection budget exhausted
    BrokerUnrecoverable,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Connect(e) => write!(f, "Broker connection failed: {}", e),
            BridgeError::Radio(e) => write!(f, "Radio initialization failed: {}", e),
            BridgeError::BrokerUnrecoverable => {
                write!(f, "Broker unreachable, reconnect attempts exhausted")
            }
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<SessionError> for BridgeError {
    fn from(e: SessionError) -> Self {
        BridgeError::Connect(e)
    }
}

impl From<RadioError> for BridgeError {
    fn from(e: RadioError) -> Self {
        BridgeError::Radio(e)
    }
}

/// Why [`MessageBridge::run`] returned without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// Stop token fired
    Cancelled,
    /// Session ended while still connected
    BrokerClosed,
}

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Transmitted,
    DroppedOversized,
    TransmitFailed,
}

/// Message counters, logged at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub received: u64,
    pub transmitted: u64,
    pub dropped_oversized: u64,
    pub transmit_failed: u64,
    pub reconnects: u64,
}

impl fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} transmitted={} oversized={} failed={} reconnects={}",
            self.received,
            self.transmitted,
            self.dropped_oversized,
            self.transmit_failed,
            self.reconnects
        )
    }
}

/// Bridge settings that do not belong to either collaborator
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub subscription: Subscription,
    pub retry: RetryPolicy,
    pub radio: RadioConfig,
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            subscription: Subscription {
                filter: config.bridge.topic.clone(),
                qos: QoS::from_u8(config.bridge.qos).unwrap_or(QoS::AtLeastOnce),
            },
            retry: RetryPolicy::from(&config.reconnect),
            radio: config.radio.clone(),
        }
    }
}

/// Forwards broker publications to the radio
pub struct MessageBridge<S, R> {
    session: S,
    radio: R,
    supervisor: ConnectionSupervisor,
    radio_config: RadioConfig,
    destination: NodeId,
    inter_frame_delay: Duration,
    stats: BridgeStats,
    status_callback: Option<StatusCallback>,
}

impl<S, R> MessageBridge<S, R>
where
    S: BrokerSession,
    R: RadioTransport,
{
    pub fn new(session: S, radio: R, settings: BridgeSettings) -> Self {
        Self {
            session,
            radio,
            supervisor: ConnectionSupervisor::new(settings.retry, settings.subscription),
            destination: settings.radio.destination,
            inter_frame_delay: settings.radio.inter_frame_delay(),
            radio_config: settings.radio,
            stats: BridgeStats::default(),
            status_callback: None,
        }
    }

    /// Install a callback for link and transmitter status changes
    pub fn set_status_callback(&mut self, callback: StatusCallback) {
        self.supervisor.set_status_callback(callback.clone());
        self.status_callback = Some(callback);
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Bring the radio up, then connect and subscribe
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        self.radio.initialize(&self.radio_config).await?;
        info!(
            "Radio ready: node {} -> {}, {:.2} MHz, {} dBm, max frame {} bytes",
            self.radio_config.node_id,
            self.destination,
            self.radio_config.frequency_mhz,
            self.radio_config.tx_power_dbm,
            self.radio.max_frame_size()
        );

        self.supervisor.establish(&mut self.session).await?;
        let sub = self.supervisor.subscription();
        info!("Subscribed to '{}' with QoS {:?}", sub.filter, sub.qos);
        Ok(())
    }

    /// `start` then `run`. A stop during startup ends it as `Cancelled`.
    pub async fn serve(&mut self, cancel: &CancellationToken) -> Result<BridgeExit, BridgeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stop requested during startup");
                return Ok(BridgeExit::Cancelled);
            }
            result = self.start() => result?,
        }
        self.run(cancel).await
    }

    /// Forward messages until stopped or the broker is lost for good
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<BridgeExit, BridgeError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stop requested");
                    return Ok(BridgeExit::Cancelled);
                }
                msg = self.session.next_message() => msg,
            };

            let Some(msg) = next else {
                if self.session.is_connected() {
                    // Nothing more will arrive on a live session
                    info!("Broker session ended");
                    self.supervisor.mark_disconnected();
                    return Ok(BridgeExit::BrokerClosed);
                }

                match self.supervisor.supervise(&mut self.session, cancel).await {
                    SupervisorOutcome::Recovered => {
                        self.stats.reconnects += 1;
                        continue;
                    }
                    SupervisorOutcome::Cancelled => return Ok(BridgeExit::Cancelled),
                    SupervisorOutcome::GiveUp => return Err(BridgeError::BrokerUnrecoverable),
                }
            };

            self.handle_message(&msg).await;
        }
    }

    /// Turn one message into a frame and put it on air
    pub async fn handle_message(&mut self, msg: &InboundMessage) -> Delivery {
        self.stats.received += 1;
        debug!(
            "Received {} bytes on '{}' (QoS {:?})",
            msg.payload.len(),
            msg.topic,
            msg.qos
        );

        let max = self.radio.max_frame_size();
        let frame = match RadioFrame::from_payload(self.destination, msg.payload.clone(), max) {
            Ok(frame) => frame,
            Err(FrameError::Oversized { len, max }) => {
                warn!(
                    "Dropping {} byte message on '{}': exceeds radio frame limit of {}",
                    len, msg.topic, max
                );
                self.stats.dropped_oversized += 1;
                return Delivery::DroppedOversized;
            }
        };

        notify(&self.status_callback, LinkStatus::Transmitting);
        let delivery = match self.radio.transmit(&frame).await {
            Ok(()) => {
                info!(
                    "Sent {} bytes to node {}",
                    frame.len(),
                    frame.destination()
                );
                debug!("Frame: {}", hex_dump(frame.payload()));
                self.stats.transmitted += 1;
                Delivery::Transmitted
            }
            Err(e) => {
                error!("Transmit to node {} failed: {}", frame.destination(), e);
                self.stats.transmit_failed += 1;
                Delivery::TransmitFailed
            }
        };

        if let Err(e) = self.radio.await_transmit_complete().await {
            error!("Waiting for transmit completion failed: {}", e);
        }
        notify(&self.status_callback, LinkStatus::Idle);

        if !self.inter_frame_delay.is_zero() {
            tokio::time::sleep(self.inter_frame_delay).await;
        }

        delivery
    }

    /// Disconnect from the broker and release the radio.
    ///
    /// Runs both steps even if the first fails.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.session.disconnect().await {
            warn!("Broker disconnect failed: {}", e);
        }
        if let Err(e) = self.radio.shutdown().await {
            warn!("Radio shutdown failed: {}", e);
        }
        info!("Bridge stopped: {}", self.stats);
    }
}
