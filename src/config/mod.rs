//! Link, serial and poller configuration
//!
//! Configuration is plain serde data, loadable from a TOML file under the
//! platform config directory and overridable from the CLI.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Default poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Shortest allowed poll interval
pub const MIN_POLL_INTERVAL_MS: u64 = 200;

/// Longest allowed poll interval
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial port settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port name (e.g. `/dev/ttyUSB0`, `COM3`)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5..=8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
}

impl SerialSettings {
    /// Settings for the given port with protocol defaults (8N1)
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
        }
    }

    /// `tokio-serial` data bits value
    pub fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    /// `tokio-serial` stop bits value
    pub fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    /// `tokio-serial` parity value
    pub fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Odd => tokio_serial::Parity::Odd,
            SerialParity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 115_200)
    }
}

/// Transaction-layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Per-operation response timeout in milliseconds
    pub timeout_ms: u64,
    /// Perform a verification read-back after each write
    pub verify_writes: bool,
    /// Register probed by `connect()` to establish connectivity
    pub probe_address: u16,
}

impl LinkConfig {
    /// Response timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            verify_writes: true,
            // fully_charged_voltage_mv: present on every firmware revision
            probe_address: 0x012C,
        }
    }
}

/// Polling service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Poll interval in milliseconds, clamped to the allowed range
    pub interval_ms: u64,
    /// Register keys to poll each cycle
    pub registers: Vec<String>,
}

impl PollerConfig {
    /// Poll interval clamped to `[MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS]`
    pub fn interval(&self) -> Duration {
        Duration::from_millis(
            self.interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            registers: vec![
                "pack_voltage_v".to_string(),
                "pack_current_a".to_string(),
                "state_of_charge_pct".to_string(),
                "internal_temperature_c".to_string(),
                "online_status".to_string(),
            ],
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Serial port settings
    pub serial: SerialSettings,
    /// Transaction settings
    pub link: LinkConfig,
    /// Poller settings
    pub poller: PollerConfig,
}

impl AppConfig {
    /// Load configuration from the platform config directory, falling back
    /// to defaults when no file exists
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = config_path().ok_or("could not determine config directory")?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the platform config directory
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = config_path().ok_or("could not determine config directory")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "tinybms-link", "tinybms-link")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_clamped() {
        let mut config = PollerConfig::default();
        config.interval_ms = 1;
        assert_eq!(config.interval(), Duration::from_millis(MIN_POLL_INTERVAL_MS));
        config.interval_ms = 10_000_000;
        assert_eq!(config.interval(), Duration::from_millis(MAX_POLL_INTERVAL_MS));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).expect("serializes");
        let back: AppConfig = toml::from_str(&text).expect("parses");
        assert_eq!(back.serial.baud_rate, config.serial.baud_rate);
        assert_eq!(back.link.timeout_ms, config.link.timeout_ms);
        assert_eq!(back.poller.registers, config.poller.registers);
    }
}
