// ABOUTME: Command-line configuration surface (spec.md §6), parsed with clap's derive API
// ABOUTME: Resolves per-leg baud/format overrides that fall back to the shared defaults

use crate::serial::{LineConfig, SerialParity};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Single-master arbiter for a Modbus/RTU bus shared by TCP clients and a
/// vendor passthrough dongle.
#[derive(Debug, Parser)]
#[command(name = "rtu-broker")]
#[command(version)]
pub struct Config {
    /// Serial device for the inverter leg of the bus.
    #[arg(long)]
    pub inverter_port: PathBuf,

    /// Serial device for the vendor dongle. May equal `inverter-port` to
    /// disable passthrough.
    #[arg(long)]
    pub shine_port: PathBuf,

    /// Shared baud rate, used by both legs unless overridden.
    #[arg(long, default_value_t = 9600)]
    pub baud: u32,

    /// Shared serial format string, e.g. "8E1", "8N1", "8O1".
    #[arg(long, default_value = "8E1")]
    pub bytes: String,

    /// Inverter-leg baud override.
    #[arg(long)]
    pub inv_baud: Option<u32>,

    /// Inverter-leg format override.
    #[arg(long)]
    pub inv_bytes: Option<String>,

    /// Shine-leg baud override.
    #[arg(long)]
    pub shine_baud: Option<u32>,

    /// Shine-leg format override.
    #[arg(long)]
    pub shine_bytes: Option<String>,

    /// Primary Modbus/TCP endpoint.
    #[arg(long, default_value = "0.0.0.0:5020")]
    pub tcp_bind: SocketAddr,

    /// Secondary Modbus/TCP endpoint for ad-hoc tools.
    #[arg(long)]
    pub tcp_alt_bind: Option<SocketAddr>,

    /// Observer endpoint for the sniff stream.
    #[arg(long)]
    pub sniff_bind: Option<SocketAddr>,

    /// Minimum inter-transaction period, in seconds.
    #[arg(long, default_value_t = 1.0)]
    pub min_period: f64,

    /// Per-transaction read timeout, in seconds.
    #[arg(long, default_value_t = 1.5)]
    pub read_timeout: f64,

    /// Filesystem path for JSON-lines event archival, or "-" to disable.
    #[arg(long, default_value = "-")]
    pub log_path: String,
}

/// A parsed "8E1"-style format string: data bits, parity letter, stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialFormat {
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid serial format string {0:?}, expected e.g. \"8E1\"")]
    BadFormat(String),
}

impl SerialFormat {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            return Err(ConfigError::BadFormat(s.to_string()));
        }
        let data_bits = (bytes[0] as char)
            .to_digit(10)
            .ok_or_else(|| ConfigError::BadFormat(s.to_string()))? as u8;
        let parity = match bytes[1].to_ascii_uppercase() {
            b'N' => SerialParity::None,
            b'E' => SerialParity::Even,
            b'O' => SerialParity::Odd,
            _ => return Err(ConfigError::BadFormat(s.to_string())),
        };
        let stop_bits = (bytes[2] as char)
            .to_digit(10)
            .ok_or_else(|| ConfigError::BadFormat(s.to_string()))? as u8;
        Ok(SerialFormat {
            data_bits,
            parity,
            stop_bits,
        })
    }
}

impl Config {
    /// Resolves the inverter leg's line configuration, applying per-leg
    /// overrides on top of the shared `baud`/`bytes` defaults.
    pub fn inverter_line(&self) -> Result<LineConfig, ConfigError> {
        let baud = self.inv_baud.unwrap_or(self.baud);
        let format = SerialFormat::parse(self.inv_bytes.as_deref().unwrap_or(&self.bytes))?;
        Ok(LineConfig {
            baud,
            data_bits: format.data_bits,
            parity: format.parity,
            stop_bits: format.stop_bits,
        })
    }

    /// Resolves the Shine leg's line configuration, applying per-leg
    /// overrides on top of the shared `baud`/`bytes` defaults.
    pub fn shine_line(&self) -> Result<LineConfig, ConfigError> {
        let baud = self.shine_baud.unwrap_or(self.baud);
        let format = SerialFormat::parse(self.shine_bytes.as_deref().unwrap_or(&self.bytes))?;
        Ok(LineConfig {
            baud,
            data_bits: format.data_bits,
            parity: format.parity,
            stop_bits: format.stop_bits,
        })
    }

    pub fn min_period(&self) -> Duration {
        Duration::from_secs_f64(self.min_period)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        if self.log_path == "-" {
            None
        } else {
            Some(PathBuf::from(&self.log_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_8e1() {
        let format = SerialFormat::parse("8E1").unwrap();
        assert_eq!(format.data_bits, 8);
        assert_eq!(format.parity, SerialParity::Even);
        assert_eq!(format.stop_bits, 1);
    }

    #[test]
    fn parses_8n1_and_8o1() {
        assert_eq!(SerialFormat::parse("8N1").unwrap().parity, SerialParity::None);
        assert_eq!(SerialFormat::parse("8O1").unwrap().parity, SerialParity::Odd);
    }

    #[test]
    fn rejects_bad_length() {
        assert!(SerialFormat::parse("81").is_err());
    }

    #[test]
    fn rejects_unknown_parity_letter() {
        assert!(SerialFormat::parse("8X1").is_err());
    }

    #[test]
    fn log_path_dash_disables_archival() {
        let config = Config::parse_from([
            "rtu-broker",
            "--inverter-port",
            "/dev/ttyUSB0",
            "--shine-port",
            "/dev/ttyUSB1",
        ]);
        assert!(config.log_path().is_none());
    }
}
