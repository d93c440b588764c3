//! Bridge configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::BAUD_DEFAULT;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Tunable timing and session parameters. The defaults match a bridge
/// clocked for a 16 MHz reference and a host that retries on a 12 second
/// cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Deadline for receiving the rest of a frame once its start byte
    /// arrived, and for the idle gap between frames of a signed-on host.
    pub host_timeout_ticks: u32,
    /// Deadline for any single device-side operation.
    pub device_timeout_ticks: u32,
    /// Device attach attempts at sign-on before giving up.
    pub attach_attempts: u8,
    /// Settle delay after the sign-on bring-up, before the identity
    /// answer goes out.
    pub signon_settle_ms: u32,
    /// Extra supply settle before a high-voltage pulse.
    pub hv_settle_ms: u32,
    /// Width of the high-voltage pulse on the reset pad.
    pub hv_pulse_us: u32,
    /// Host baud id at power-on and after sign-off.
    pub default_baud_id: u8,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host_timeout_ticks: 12_000,
            device_timeout_ticks: 1_200,
            attach_attempts: 3,
            signon_settle_ms: 200,
            hv_settle_ms: 0,
            hv_pulse_us: 800,
            default_baud_id: BAUD_DEFAULT,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: BridgeConfig = toml::from_str("device_timeout_ticks = 500").unwrap();
        assert_eq!(config.device_timeout_ticks, 500);
        assert_eq!(config.host_timeout_ticks, 12_000);
        assert_eq!(config.default_baud_id, BAUD_DEFAULT);
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = BridgeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: BridgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.host_timeout_ticks, config.host_timeout_ticks);
        assert_eq!(back.hv_pulse_us, config.hv_pulse_us);
    }
}
