//! Link status notifications
//!
//! Peripheral feedback such as a status LED hooks in here.
//! Nothing in the bridge depends on a callback being installed.

use std::sync::Arc;

/// State transitions reported to the status callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    /// Broker session connected and subscribed
    Connected,
    /// Broker connection lost or closed
    Disconnected,
    /// A frame is on air
    Transmitting,
    /// Transmission finished
    Idle,
}

/// Callback invoked on every status transition
pub type StatusCallback = Arc<dyn Fn(LinkStatus) + Send + Sync>;

pub(crate) fn notify(callback: &Option<StatusCallback>, status: LinkStatus) {
    if let Some(ref callback) = callback {
        callback(status);
    }
}
