//! LoRa time-on-air
//!
//! Semtech AN1200.13 formula, explicit header and CRC on, as configured by
//! RadioHead's RF95 driver.

use std::time::Duration;

use crate::config::ModemConfig;

const PREAMBLE_SYMBOLS: f64 = 8.0;

/// Time the transmitter is keyed for a packet of `packet_len` bytes
/// (RadioHead header included).
pub fn time_on_air(modem: &ModemConfig, packet_len: usize) -> Duration {
    let sf = modem.spreading_factor as f64;
    let symbol_secs = 2f64.powi(modem.spreading_factor as i32) / modem.bandwidth_hz as f64;

    // Low data rate optimisation is mandated once a symbol lasts over 16 ms
    let low_data_rate = if symbol_secs > 0.016 { 1.0 } else { 0.0 };
    let coding_rate = (modem.coding_rate - 4) as f64;

    let numerator = 8.0 * packet_len as f64 - 4.0 * sf + 28.0 + 16.0;
    let denominator = 4.0 * (sf - 2.0 * low_data_rate);
    let payload_symbols = 8.0 + ((numerator / denominator).ceil() * (coding_rate + 4.0)).max(0.0);

    let preamble_secs = (PREAMBLE_SYMBOLS + 4.25) * symbol_secs;
    Duration::from_secs_f64(preamble_secs + payload_symbols * symbol_secs)
}
