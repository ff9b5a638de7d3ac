//! Shared vocabulary: data types, byte/word ordering, register spaces and
//! transport parameters.
//!
//! All enums round-trip through their textual names (`Display` / `FromStr`)
//! so configuration files and operator input use the same spelling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MasterError;

// ============================================================================
// Data Type
// ============================================================================

/// Application-level interpretation of a register array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    #[serde(rename = "BYTE")]
    Byte,
    #[serde(rename = "INT16")]
    Int16,
    #[default]
    #[serde(rename = "UINT16")]
    UInt16,
    #[serde(rename = "INT32")]
    Int32,
    #[serde(rename = "UINT32")]
    UInt32,
    #[serde(rename = "INT64")]
    Int64,
    #[serde(rename = "UINT64")]
    UInt64,
    #[serde(rename = "FLOAT32")]
    Float32,
    #[serde(rename = "FLOAT64")]
    Float64,
    #[serde(rename = "BOOL")]
    Bool,
    #[serde(rename = "ASCII")]
    Ascii,
    #[serde(rename = "UNIX_TIMESTAMP")]
    UnixTimestamp,
}

impl DataType {
    pub const ALL: [DataType; 12] = [
        DataType::Byte,
        DataType::Int16,
        DataType::UInt16,
        DataType::Int32,
        DataType::UInt32,
        DataType::Int64,
        DataType::UInt64,
        DataType::Float32,
        DataType::Float64,
        DataType::Bool,
        DataType::Ascii,
        DataType::UnixTimestamp,
    ];

    /// Number of 16-bit registers that make up one value of this type
    pub fn registers_per_value(&self) -> usize {
        match self {
            DataType::Byte
            | DataType::Int16
            | DataType::UInt16
            | DataType::Bool
            | DataType::Ascii => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 | DataType::UnixTimestamp => 2,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Byte => "BYTE",
            DataType::Int16 => "INT16",
            DataType::UInt16 => "UINT16",
            DataType::Int32 => "INT32",
            DataType::UInt32 => "UINT32",
            DataType::Int64 => "INT64",
            DataType::UInt64 => "UINT64",
            DataType::Float32 => "FLOAT32",
            DataType::Float64 => "FLOAT64",
            DataType::Bool => "BOOL",
            DataType::Ascii => "ASCII",
            DataType::UnixTimestamp => "UNIX_TIMESTAMP",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str() == normalized)
            .ok_or_else(|| MasterError::config(format!("unknown data type: {s}")))
    }
}

// ============================================================================
// Byte / Word Order
// ============================================================================

/// Order of the two bytes inside one register
///
/// Only BYTE and ASCII values are packed byte-wise, so this setting has no
/// effect on numeric types.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ByteOrder {
    /// High byte first: 0x4142 -> [0x41, 0x42]
    #[default]
    AB,
    /// Low byte first: 0x4142 -> [0x42, 0x41]
    BA,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ByteOrder::AB => "AB",
            ByteOrder::BA => "BA",
        }
    }

    /// Split one register into its two bytes in this order
    #[inline]
    pub fn split(&self, register: u16) -> [u8; 2] {
        match self {
            ByteOrder::AB => register.to_be_bytes(),
            ByteOrder::BA => register.to_le_bytes(),
        }
    }

    /// Join two bytes taken in this order back into a register
    #[inline]
    pub fn join(&self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::AB => u16::from_be_bytes(bytes),
            ByteOrder::BA => u16::from_le_bytes(bytes),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ByteOrder {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AB" => Ok(ByteOrder::AB),
            "BA" => Ok(ByteOrder::BA),
            _ => Err(MasterError::config(format!("unknown byte order: {s}"))),
        }
    }
}

/// Order of registers when assembling 32/64-bit values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WordOrder {
    /// Most-significant register first
    #[default]
    #[serde(rename = "1234")]
    W1234,
    /// Least-significant register first
    #[serde(rename = "4321")]
    W4321,
}

impl WordOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            WordOrder::W1234 => "1234",
            WordOrder::W4321 => "4321",
        }
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WordOrder {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1234" => Ok(WordOrder::W1234),
            "4321" => Ok(WordOrder::W4321),
            _ => Err(MasterError::config(format!("unknown word order: {s}"))),
        }
    }
}

// ============================================================================
// Register Space
// ============================================================================

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    #[default]
    HoldingRegister,
    InputRegister,
    DiscreteInput,
    Coil,
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterType::HoldingRegister => "Holding Register",
            RegisterType::InputRegister => "Input Register",
            RegisterType::DiscreteInput => "Discrete Input",
            RegisterType::Coil => "Coil",
        };
        f.write_str(name)
    }
}

impl FromStr for RegisterType {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "holding_register" | "holding" => Ok(RegisterType::HoldingRegister),
            "input_register" | "input" => Ok(RegisterType::InputRegister),
            "discrete_input" | "discrete" => Ok(RegisterType::DiscreteInput),
            "coil" => Ok(RegisterType::Coil),
            _ => Err(MasterError::config(format!("unknown register type: {s}"))),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Modbus transport flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Rtu,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("Modbus TCP"),
            TransportKind::Rtu => f.write_str("Modbus RTU"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "modbus tcp" => Ok(TransportKind::Tcp),
            "rtu" | "modbus rtu" => Ok(TransportKind::Rtu),
            _ => Err(MasterError::config(format!("unknown transport: {s}"))),
        }
    }
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => f.write_str("None"),
            Parity::Even => f.write_str("Even"),
            Parity::Odd => f.write_str("Odd"),
        }
    }
}

impl FromStr for Parity {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            _ => Err(MasterError::config(format!("unknown parity: {s}"))),
        }
    }
}

// ============================================================================
// Client State
// ============================================================================

/// Connection lifecycle of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ClientState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ClientState::Connected)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Disconnected => f.write_str("DISCONNECTED"),
            ClientState::Connecting => f.write_str("CONNECTING"),
            ClientState::Connected => f.write_str("CONNECTED"),
        }
    }
}
