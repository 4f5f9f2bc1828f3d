use clap::ArgMatches;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::services::correlator::DEFAULT_CAPACITY;
use crate::utils::error::BridgeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub serial: SerialConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub bridge: BridgeTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParityConfig,
    /// Host Link unit number of the downstream device.
    #[serde(default)]
    pub unit_number: u8,
    /// Timeout of a single blocking read on the port.
    pub read_slice_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind_address: IpAddr,
    pub udp_port: u16,
    /// FINS node number of this bridge; the last octet of `bind_address` when unset.
    #[serde(default)]
    pub node: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTuning {
    pub udp_timeout_ms: u64,
    pub serial_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub idle_yield_ms: u64,
    pub max_pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

impl ParityConfig {
    pub fn parse(value: &str) -> Result<Self, BridgeError> {
        match value.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(ParityConfig::None),
            "even" | "e" => Ok(ParityConfig::Even),
            "odd" | "o" => Ok(ParityConfig::Odd),
            other => Err(BridgeError::ConfigError(format!("unknown parity '{}'", other))),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: ParityConfig::None,
            unit_number: 0,
            read_slice_ms: 20,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 9600,
            node: None,
        }
    }
}

impl Default for BridgeTuning {
    fn default() -> Self {
        Self {
            udp_timeout_ms: 100,
            serial_timeout_ms: 100,
            reply_timeout_ms: 2000,
            idle_yield_ms: 10,
            max_pending: DEFAULT_CAPACITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            network: NetworkConfig::default(),
            bridge: BridgeTuning::default(),
        }
    }
}

impl BridgeTuning {
    pub fn udp_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_timeout_ms)
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn idle_yield(&self) -> Duration {
        Duration::from_millis(self.idle_yield_ms)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BridgeError::ConfigError(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), BridgeError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overrides file or default values with whatever was given on the command line.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), BridgeError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.serial.port = port.clone();
        }
        if let Some(baud) = matches.get_one::<String>("baud") {
            self.serial.baud_rate = parse_arg(baud, "baud")?;
        }
        if let Some(bits) = matches.get_one::<String>("data-bits") {
            self.serial.data_bits = parse_arg(bits, "data-bits")?;
        }
        if let Some(bits) = matches.get_one::<String>("stop-bits") {
            self.serial.stop_bits = parse_arg(bits, "stop-bits")?;
        }
        if let Some(parity) = matches.get_one::<String>("parity") {
            self.serial.parity = ParityConfig::parse(parity)?;
        }
        if let Some(unit) = matches.get_one::<String>("unit") {
            self.serial.unit_number = parse_arg(unit, "unit")?;
        }
        if let Some(bind) = matches.get_one::<String>("bind") {
            self.network.bind_address = parse_arg(bind, "bind")?;
        }
        if let Some(port) = matches.get_one::<String>("udp-port") {
            self.network.udp_port = parse_arg(port, "udp-port")?;
        }
        if let Some(node) = matches.get_one::<String>("node") {
            self.network.node = Some(parse_arg(node, "node")?);
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.serial.port.trim().is_empty() {
            return Err(BridgeError::ConfigError("no serial port selected".to_string()));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(BridgeError::ConfigError(format!(
                "data bits must be 5-8, got {}",
                self.serial.data_bits
            )));
        }
        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(BridgeError::ConfigError(format!(
                "stop bits must be 1 or 2, got {}",
                self.serial.stop_bits
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(BridgeError::ConfigError("baud rate must be positive".to_string()));
        }
        if self.bridge.max_pending == 0 {
            return Err(BridgeError::ConfigError("max_pending must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn bind_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.bind_address, self.network.udp_port)
    }

    /// FINS node number of this bridge.
    pub fn own_node(&self) -> u8 {
        if let Some(node) = self.network.node {
            return node;
        }
        match self.network.bind_address {
            IpAddr::V4(addr) => {
                if addr.is_unspecified() {
                    warn!("⚠️  Bound to 0.0.0.0, FINS node defaults to 0; set network.node to override");
                }
                addr.octets()[3]
            }
            IpAddr::V6(_) => {
                warn!("⚠️  IPv6 bind address has no node octet, FINS node defaults to 0");
                0
            }
        }
    }

    pub fn log_summary(&self) {
        info!(
            "🔌 Serial: {} @ {} baud, {} data bits, {} stop bits, parity {:?}, unit {:02}",
            self.serial.port,
            self.serial.baud_rate,
            self.serial.data_bits,
            self.serial.stop_bits,
            self.serial.parity,
            self.serial.unit_number
        );
        info!("🌐 UDP: {} (FINS node {})", self.bind_socket_addr(), self.own_node());
    }
}

fn parse_arg<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, BridgeError> {
    value
        .trim()
        .parse()
        .map_err(|_| BridgeError::ConfigError(format!("invalid value '{}' for --{}", value, name)))
}
