//! Radio Configuration
//!
//! Settings for the packet radio transmitter. Defaults match an RFM95 on
//! the EU868 band addressing gateway node 1 from node 10.

use std::net::SocketAddr;

use serde::Deserialize;

/// Which transport carries the frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioKind {
    /// RadioHead frames as UDP datagrams
    #[default]
    Udp,
    /// Log frames only (no transmitter)
    Log,
}

impl std::fmt::Display for RadioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RadioKind::Udp => write!(f, "udp"),
            RadioKind::Log => write!(f, "log"),
        }
    }
}

/// LoRa modem settings, used for time-on-air pacing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModemConfig {
    /// Spreading factor (6-12)
    #[serde(default = "default_spreading_factor")]
    pub spreading_factor: u8,
    /// Signal bandwidth in Hz
    #[serde(default = "default_bandwidth_hz")]
    pub bandwidth_hz: u32,
    /// Coding rate denominator: 5 means 4/5, up to 8 for 4/8
    #[serde(default = "default_coding_rate")]
    pub coding_rate: u8,
}

fn default_spreading_factor() -> u8 {
    7
}

fn default_bandwidth_hz() -> u32 {
    125_000
}

fn default_coding_rate() -> u8 {
    5
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            spreading_factor: default_spreading_factor(),
            bandwidth_hz: default_bandwidth_hz(),
            coding_rate: default_coding_rate(),
        }
    }
}

/// UDP transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct UdpRadioConfig {
    /// Where datagrams are sent
    #[serde(default = "default_udp_target")]
    pub target: String,
    /// Local bind address
    #[serde(default = "default_udp_bind")]
    pub bind: SocketAddr,
    /// Hold each frame for its LoRa time-on-air before reporting completion
    #[serde(default = "default_true")]
    pub simulate_airtime: bool,
}

fn default_udp_target() -> String {
    "127.0.0.1:1700".to_string()
}

fn default_udp_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_true() -> bool {
    true
}

impl Default for UdpRadioConfig {
    fn default() -> Self {
        Self {
            target: default_udp_target(),
            bind: default_udp_bind(),
            simulate_airtime: true,
        }
    }
}

/// Radio configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RadioConfig {
    /// Transport used to send frames
    #[serde(default)]
    pub transport: RadioKind,

    /// This node's address
    #[serde(default = "default_node_id")]
    pub node_id: u8,

    /// Node every frame is sent to
    #[serde(default = "default_destination")]
    pub destination: u8,

    /// Carrier frequency in MHz
    #[serde(default = "default_frequency")]
    pub frequency_mhz: f64,

    /// Transmit power in dBm (PA_BOOST: 5-23)
    #[serde(default = "default_tx_power")]
    pub tx_power_dbm: i8,

    /// Largest payload put in one frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Pause after each frame in milliseconds, 0 to disable
    #[serde(default = "default_inter_frame_delay")]
    pub inter_frame_delay_ms: u64,

    #[serde(default)]
    pub modem: ModemConfig,

    #[serde(default)]
    pub udp: UdpRadioConfig,
}

fn default_node_id() -> u8 {
    10
}

fn default_destination() -> u8 {
    1
}

fn default_frequency() -> f64 {
    868.10
}

fn default_tx_power() -> i8 {
    23
}

fn default_max_frame_size() -> usize {
    crate::radio::RF95_MAX_MESSAGE_LEN
}

fn default_inter_frame_delay() -> u64 {
    100
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            transport: RadioKind::default(),
            node_id: default_node_id(),
            destination: default_destination(),
            frequency_mhz: default_frequency(),
            tx_power_dbm: default_tx_power(),
            max_frame_size: default_max_frame_size(),
            inter_frame_delay_ms: default_inter_frame_delay(),
            modem: ModemConfig::default(),
            udp: UdpRadioConfig::default(),
        }
    }
}

impl RadioConfig {
    /// Get the inter-frame delay as Duration
    pub fn inter_frame_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.inter_frame_delay_ms)
    }

    /// Largest max_frame_size the selected transport can honour
    pub fn frame_size_limit(&self) -> usize {
        match self.transport {
            RadioKind::Udp => crate::radio::RF95_MAX_MESSAGE_LEN,
            RadioKind::Log => 255,
        }
    }
}
