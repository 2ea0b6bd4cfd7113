//! Controller configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use stimlink_shared::protocol::MIN_PACKET_LENGTH;

/// FTDI USB vendor id used by the instrument's serial bridge.
pub const DEFAULT_VENDOR_ID: u16 = 0x0403;
pub const DEFAULT_BAUD_RATE: u32 = 4_000_000;
pub const DEFAULT_VIRTUAL_ADDRESS: &str = "127.0.0.1:56575";

/// Longest accepted timeout or period (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// USB vendor id probed when no serial port is given
    pub vendor_id: u16,

    /// Explicit serial port path, skipping vendor id probing
    pub serial_port: Option<String>,

    pub baud_rate: u32,

    /// Simulator address tried when no serial device is found
    pub virtual_address: String,

    pub handshake_period_secs: u64,
    pub status_beacon_timeout_secs: u64,
    pub command_response_timeout_secs: u64,

    /// Time allowed to find the first magic word after connecting
    pub registration_timeout_secs: u64,

    /// Capacity of the command and event mailboxes
    pub mailbox_capacity: usize,

    /// Bytes requested per transport read
    pub read_chunk_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            vendor_id: std::env::var("STIMLINK_VENDOR_ID")
                .ok()
                .and_then(|s| parse_vendor_id(&s))
                .unwrap_or(DEFAULT_VENDOR_ID),
            serial_port: std::env::var("STIMLINK_SERIAL_PORT").ok(),
            baud_rate: std::env::var("STIMLINK_BAUD_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BAUD_RATE),
            virtual_address: std::env::var("STIMLINK_VIRTUAL_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_VIRTUAL_ADDRESS.to_string()),
            handshake_period_secs: 5,
            status_beacon_timeout_secs: 10,
            command_response_timeout_secs: std::env::var("STIMLINK_COMMAND_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            registration_timeout_secs: 8,
            mailbox_capacity: 64,
            read_chunk_size: 4096,
        }
    }
}

/// Accepts `0x0403` or plain decimal.
fn parse_vendor_id(s: &str) -> Option<u16> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl ControllerConfig {
    /// Load from a TOML file; missing keys take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn handshake_period(&self) -> Duration {
        Duration::from_secs(self.handshake_period_secs)
    }

    pub fn status_beacon_timeout(&self) -> Duration {
        Duration::from_secs(self.status_beacon_timeout_secs)
    }

    pub fn command_response_timeout(&self) -> Duration {
        Duration::from_secs(self.command_response_timeout_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            anyhow::bail!("Baud rate must be greater than 0");
        }

        self.virtual_address
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid virtual address '{}'", self.virtual_address))?;

        if self.handshake_period_secs == 0 {
            anyhow::bail!("Handshake period must be greater than 0");
        }

        // a handshake response counts as liveness, so it must come before the watchdog fires
        if self.handshake_period_secs >= self.status_beacon_timeout_secs {
            anyhow::bail!(
                "Handshake period ({}s) must be shorter than the status beacon timeout ({}s)",
                self.handshake_period_secs,
                self.status_beacon_timeout_secs
            );
        }

        if self.command_response_timeout_secs == 0 || self.registration_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be greater than 0");
        }

        let timeouts = [
            ("Status beacon timeout", self.status_beacon_timeout_secs),
            ("Command response timeout", self.command_response_timeout_secs),
            ("Registration timeout", self.registration_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs > MAX_TIMEOUT_SECS {
                anyhow::bail!("{} ({}s) must not exceed {}s", name, secs, MAX_TIMEOUT_SECS);
            }
        }

        if self.mailbox_capacity == 0 {
            anyhow::bail!("Mailbox capacity must be greater than 0");
        }

        if self.read_chunk_size < MIN_PACKET_LENGTH {
            anyhow::bail!(
                "Read chunk size must be at least {} bytes",
                MIN_PACKET_LENGTH
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.handshake_period(), Duration::from_secs(5));
        assert_eq!(config.status_beacon_timeout(), Duration::from_secs(10));
        assert_eq!(config.mailbox_capacity, 64);
    }

    #[test]
    fn test_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "serial_port = \"/dev/ttyUSB3\"").unwrap();
        writeln!(file, "virtual_address = \"127.0.0.1:4000\"").unwrap();
        writeln!(file, "command_response_timeout_secs = 3").unwrap();

        let config = ControllerConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.serial_port.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(config.virtual_address, "127.0.0.1:4000");
        assert_eq!(config.command_response_timeout(), Duration::from_secs(3));
        assert_eq!(config.registration_timeout_secs, 8);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = ControllerConfig {
            handshake_period_secs: 10,
            status_beacon_timeout_secs: 10,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());

        config.handshake_period_secs = 5;
        config.virtual_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config.virtual_address = DEFAULT_VIRTUAL_ADDRESS.to_string();
        config.read_chunk_size = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_are_bounded() {
        let config = ControllerConfig {
            status_beacon_timeout_secs: u64::MAX,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ControllerConfig {
            command_response_timeout_secs: MAX_TIMEOUT_SECS + 1,
            ..ControllerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Command response timeout"));

        let config = ControllerConfig {
            command_response_timeout_secs: MAX_TIMEOUT_SECS,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "baud_rate = \"fast\"").unwrap();
        assert!(ControllerConfig::from_toml_file(file.path()).is_err());
    }

    #[test]
    fn test_parse_vendor_id() {
        assert_eq!(parse_vendor_id("0x0403"), Some(0x0403));
        assert_eq!(parse_vendor_id("1027"), Some(1027));
        assert_eq!(parse_vendor_id("0xzz"), None);
    }
}
