//! Dry-run transport that logs frames instead of keying a transmitter

use async_trait::async_trait;
use tracing::info;

use super::{hex_dump, RadioError, RadioFrame, RadioTransport};
use crate::config::RadioConfig;

/// Largest frame the log transport accepts (one RadioHead length byte)
const LOG_MAX_FRAME: usize = 255;

/// Logs every frame at info level
pub struct LogRadio {
    node_id: Option<u8>,
    max_frame_size: usize,
    sent: u64,
}

impl LogRadio {
    pub fn new() -> Self {
        Self {
            node_id: None,
            max_frame_size: LOG_MAX_FRAME,
            sent: 0,
        }
    }

    /// Frames accepted so far
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Default for LogRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for LogRadio {
    async fn initialize(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        self.node_id = Some(config.node_id);
        self.max_frame_size = config.max_frame_size.min(LOG_MAX_FRAME);
        info!(
            "Log radio node #{} ready (max frame {} bytes)",
            config.node_id, self.max_frame_size
        );
        Ok(())
    }

    async fn transmit(&mut self, frame: &RadioFrame) -> Result<(), RadioError> {
        let node_id = self.node_id.ok_or(RadioError::NotInitialized)?;
        if frame.len() > self.max_frame_size {
            return Err(RadioError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_size,
            });
        }
        self.sent += 1;
        info!(
            "[dry-run] #{} -> #{} ({} bytes): {}",
            node_id,
            frame.destination(),
            frame.len(),
            hex_dump(frame.payload())
        );
        Ok(())
    }

    async fn await_transmit_complete(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}
