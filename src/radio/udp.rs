//! RadioHead-over-UDP transport
//!
//! Each frame becomes one datagram laid out exactly as the RF95 FIFO would
//! be loaded (`to, from, id, flags, payload`). Completion is reported once
//! the LoRa time-on-air for the packet has elapsed, so the bridge is paced
//! like a real half-duplex radio.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::{
    hex_dump, time_on_air, NodeId, RadioError, RadioFrame, RadioTransport,
    RADIOHEAD_HEADER_LEN, RF95_MAX_MESSAGE_LEN,
};
use crate::config::{ModemConfig, RadioConfig};

/// UDP packet-radio transport
pub struct UdpRadio {
    socket: Option<UdpSocket>,
    node_id: NodeId,
    modem: ModemConfig,
    simulate_airtime: bool,
    max_frame_size: usize,
    /// RadioHead header id, incremented per packet
    sequence: u8,
    /// When the frame currently on air finishes
    in_flight_until: Option<Instant>,
}

impl UdpRadio {
    pub fn new() -> Self {
        Self {
            socket: None,
            node_id: 0,
            modem: ModemConfig::default(),
            simulate_airtime: true,
            max_frame_size: RF95_MAX_MESSAGE_LEN,
            sequence: 0,
            in_flight_until: None,
        }
    }

    /// Local address of the bound socket, once initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Default for UdpRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for UdpRadio {
    async fn initialize(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        let udp = &config.udp;
        let target: SocketAddr = udp.target.parse().map_err(|_| {
            RadioError::InvalidConfig(format!("invalid udp target '{}'", udp.target))
        })?;

        let socket = UdpSocket::bind(udp.bind).await?;
        socket.connect(target).await?;

        self.node_id = config.node_id;
        self.modem = config.modem.clone();
        self.simulate_airtime = udp.simulate_airtime;
        self.max_frame_size = config.max_frame_size.min(RF95_MAX_MESSAGE_LEN);
        self.sequence = 0;
        self.in_flight_until = None;

        info!(
            "UDP radio node #{} up @ {:.2}MHz, {}dBm, SF{} -> {}",
            config.node_id,
            config.frequency_mhz,
            config.tx_power_dbm,
            config.modem.spreading_factor,
            target
        );
        self.socket = Some(socket);
        Ok(())
    }

    async fn transmit(&mut self, frame: &RadioFrame) -> Result<(), RadioError> {
        if self.in_flight_until.is_some() {
            return Err(RadioError::Busy);
        }
        if frame.len() > self.max_frame_size {
            return Err(RadioError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_size,
            });
        }
        let socket = self.socket.as_ref().ok_or(RadioError::NotInitialized)?;

        let packet = frame.to_radiohead(self.node_id, self.sequence, 0);
        socket.send(&packet).await?;
        debug!("TX id={} [{}]", self.sequence, hex_dump(&packet));

        self.sequence = self.sequence.wrapping_add(1);
        let airtime = if self.simulate_airtime {
            time_on_air(&self.modem, RADIOHEAD_HEADER_LEN + frame.len())
        } else {
            Duration::ZERO
        };
        self.in_flight_until = Some(Instant::now() + airtime);
        Ok(())
    }

    async fn await_transmit_complete(&mut self) -> Result<(), RadioError> {
        if let Some(deadline) = self.in_flight_until.take() {
            sleep_until(deadline).await;
        }
        Ok(())
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    async fn shutdown(&mut self) -> Result<(), RadioError> {
        self.await_transmit_complete().await?;
        if self.socket.take().is_some() {
            info!("UDP radio node #{} down", self.node_id);
        }
        Ok(())
    }
}
