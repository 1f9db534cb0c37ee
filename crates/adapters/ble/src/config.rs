//! BLE adapter configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the btleplug transport (`[ble]` section).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Only report advertisements that carry the Pixels service UUID.
    ///
    /// Some platforms omit service UUIDs from advertisements; disable this if
    /// dice are never seen.
    pub scan_filter_service: bool,
    /// How long `open` waits for the peripheral to accept a connection.
    pub connect_timeout_secs: u16,
}

impl BleConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_secs))
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_filter_service: true,
            connect_timeout_secs: 10,
        }
    }
}
