//! Packet Radio Transport
//!
//! The bridge hands each frame to a [`RadioTransport`] and waits for the
//! transport to confirm the packet left the transmitter before fetching the
//! next message. Two transports ship with the crate:
//!
//! - [`UdpRadio`]: RadioHead-framed datagrams for a packet forwarder or a
//!   radio simulator, paced by the LoRa time-on-air of each packet
//! - [`LogRadio`]: dry run that only logs frames

mod airtime;
mod frame;
mod log;
mod udp;


use std::fmt;

use async_trait::async_trait;

use crate::config::RadioConfig;

pub use airtime::time_on_air;
pub use frame::{hex_dump, FrameError, NodeId, RadioFrame, RADIOHEAD_HEADER_LEN};
pub use log::LogRadio;
pub use udp::UdpRadio;

/// Largest payload an RFM95 can carry behind the 4-byte RadioHead header
pub const RF95_MAX_MESSAGE_LEN: usize = 255 - RADIOHEAD_HEADER_LEN;

/// Error type for radio transport operations
#[derive(Debug)]
pub enum RadioError {
    /// `transmit` called before `initialize`
    NotInitialized,
    /// `transmit` called while a previous frame is still in flight
    Busy,
    /// Frame exceeds what the transport can put on air
    FrameTooLarge { len: usize, max: usize },
    /// Radio configuration rejected by the transport
    InvalidConfig(String),
    /// Underlying I/O failure
    Io(std::io::Error),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioError::NotInitialized => write!(f, "Radio not initialized"),
            RadioError::Busy => write!(f, "Previous frame still in flight"),
            RadioError::FrameTooLarge { len, max } => {
                write!(f, "Frame of {} bytes exceeds maximum of {}", len, max)
            }
            RadioError::InvalidConfig(msg) => write!(f, "Invalid radio config: {}", msg),
            RadioError::Io(e) => write!(f, "Radio I/O error: {}", e),
        }
    }
}

impl std::error::Error for RadioError {}

impl From<std::io::Error> for RadioError {
    fn from(e: std::io::Error) -> Self {
        RadioError::Io(e)
    }
}

/// A half-duplex packet radio that sends one frame at a time
#[async_trait]
pub trait RadioTransport: Send {
    /// Apply the radio configuration and bring the transmitter up
    async fn initialize(&mut self, config: &RadioConfig) -> Result<(), RadioError>;

    /// Queue one frame for transmission
    async fn transmit(&mut self, frame: &RadioFrame) -> Result<(), RadioError>;

    /// Wait until the frame passed to `transmit` has left the antenna
    async fn await_transmit_complete(&mut self) -> Result<(), RadioError>;

    /// Largest payload accepted by `transmit`
    fn max_frame_size(&self) -> usize;

    /// Release the transmitter
    async fn shutdown(&mut self) -> Result<(), RadioError> {
        Ok(())
    }
}
