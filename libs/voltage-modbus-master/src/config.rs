//! Master configuration
//!
//! Connection parameters and engine defaults, layered with figment:
//! serde defaults, then an optional YAML/TOML/JSON file, then
//! `MODBUS_`-prefixed environment variables (`MODBUS_TCP__HOST=10.0.0.5`).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::codec::DataConverter;
use crate::error::{MasterError, Result};
use crate::types::{ByteOrder, Parity, TransportKind, WordOrder};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MODBUS_";

// ============================================================================
// Endpoints
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    #[serde(default = "default_tcp_host", alias = "ip")]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    #[serde(default = "default_unit_id", alias = "slave_id")]
    pub unit_id: u8,
}

impl Default for TcpEndpoint {
    fn default() -> Self {
        Self {
            host: default_tcp_host(),
            port: default_tcp_port(),
            unit_id: default_unit_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtuEndpoint {
    #[serde(default = "default_serial_device", alias = "port")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_unit_id", alias = "slave_id")]
    pub unit_id: u8,
}

impl Default for RtuEndpoint {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            unit_id: default_unit_id(),
        }
    }
}

/// Where and how to reach the slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointConfig {
    Tcp(TcpEndpoint),
    Rtu(RtuEndpoint),
}

impl EndpointConfig {
    pub fn tcp(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        EndpointConfig::Tcp(TcpEndpoint {
            host: host.into(),
            port,
            unit_id,
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            EndpointConfig::Tcp(_) => TransportKind::Tcp,
            EndpointConfig::Rtu(_) => TransportKind::Rtu,
        }
    }

    /// Unit configured alongside the endpoint; each request may still name its own
    pub fn unit_id(&self) -> u8 {
        match self {
            EndpointConfig::Tcp(tcp) => tcp.unit_id,
            EndpointConfig::Rtu(rtu) => rtu.unit_id,
        }
    }

    /// Reject parameters no transport could open
    pub fn validate(&self) -> Result<()> {
        match self {
            EndpointConfig::Tcp(tcp) => {
                if tcp.host.trim().is_empty() {
                    return Err(MasterError::config("TCP host not specified"));
                }
            },
            EndpointConfig::Rtu(rtu) => {
                if rtu.device.trim().is_empty() {
                    return Err(MasterError::config("Serial device not specified"));
                }
                if rtu.baud_rate == 0 {
                    return Err(MasterError::config("Baud rate must be positive"));
                }
                if !(5..=8).contains(&rtu.data_bits) {
                    return Err(MasterError::config(format!(
                        "Data bits must be 5-8, got {}",
                        rtu.data_bits
                    )));
                }
                if !(1..=2).contains(&rtu.stop_bits) {
                    return Err(MasterError::config(format!(
                        "Stop bits must be 1 or 2, got {}",
                        rtu.stop_bits
                    )));
                }
            },
        }
        Ok(())
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointConfig::Tcp(tcp) => write!(f, "{}:{}", tcp.host, tcp.port),
            EndpointConfig::Rtu(rtu) => write!(
                f,
                "{} {} {}{}{}",
                rtu.device,
                rtu.baud_rate,
                rtu.data_bits,
                match rtu.parity {
                    Parity::None => 'N',
                    Parity::Even => 'E',
                    Parity::Odd => 'O',
                },
                rtu.stop_bits
            ),
        }
    }
}

// ============================================================================
// Master Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default, alias = "default_connection_type")]
    pub transport: TransportKind,

    #[serde(default)]
    pub tcp: TcpEndpoint,

    #[serde(default)]
    pub rtu: RtuEndpoint,

    #[serde(default = "default_polling_interval_ms", alias = "polling_interval")]
    pub polling_interval_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub byte_order: ByteOrder,

    #[serde(default)]
    pub word_order: WordOrder,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            tcp: TcpEndpoint::default(),
            rtu: RtuEndpoint::default(),
            polling_interval_ms: default_polling_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            byte_order: ByteOrder::AB,
            word_order: WordOrder::W1234,
            log_level: default_log_level(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from defaults, an optional file and the environment
    ///
    /// Priority (highest to lowest):
    /// 1. `MODBUS_*` environment variables
    /// 2. The file at `path` (format picked by extension)
    /// 3. Built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Fields missing from every provider fall back to their serde defaults
        let mut figment = Figment::new();

        if let Some(path) = path {
            if !path.exists() {
                return Err(MasterError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| MasterError::config("Config file must have an extension"))?;
            figment = match extension {
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "json" => figment.merge(Json::file(path)),
                _ => {
                    return Err(MasterError::config(format!(
                        "Unsupported config file format: {extension}"
                    )))
                },
            };
        }

        let config: MasterConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_ms == 0 {
            return Err(MasterError::config("polling_interval_ms must be positive"));
        }
        if self.request_timeout_ms == 0 {
            return Err(MasterError::config("request_timeout_ms must be positive"));
        }
        self.endpoint().validate()
    }

    /// Endpoint for the selected transport
    pub fn endpoint(&self) -> EndpointConfig {
        match self.transport {
            TransportKind::Tcp => EndpointConfig::Tcp(self.tcp.clone()),
            TransportKind::Rtu => EndpointConfig::Rtu(self.rtu.clone()),
        }
    }

    pub fn default_unit_id(&self) -> u8 {
        self.endpoint().unit_id()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn converter(&self) -> DataConverter {
        DataConverter::new(self.byte_order, self.word_order)
    }
}

// Default value functions
fn default_tcp_host() -> String {
    "192.168.0.31".to_string()
}

fn default_tcp_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_serial_device() -> String {
    "COM1".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_polling_interval_ms() -> u64 {
    crate::constants::DEFAULT_POLLING_INTERVAL.as_millis() as u64
}

fn default_request_timeout_ms() -> u64 {
    crate::constants::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}
