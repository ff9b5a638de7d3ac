//! Modbus Master Error Types
//!
//! Every fallible operation in the crate returns [`MasterError`]. Transport
//! and protocol errors are handed back to the caller as-is; nothing in the
//! crate retries on its own.

use thiserror::Error;

use crate::types::DataType;

/// Result type for master operations
pub type Result<T> = std::result::Result<T, MasterError>;

/// Modbus master errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MasterError {
    /// Opening the transport or a transport-level I/O failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response within the transaction deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The slave answered with a Modbus exception response
    #[error("Modbus exception 0x{code:02X} ({}) for function 0x{function:02X}", exception_description(*.code))]
    ProtocolException { function: u8, code: u8 },

    /// Malformed or inconsistent frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Conversion requested for a value shape the target type cannot hold
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Textual input that does not parse as the requested type
    #[error("Cannot parse '{token}' as {data_type}")]
    Parse { data_type: DataType, token: String },

    /// Caller-supplied data outside what the protocol allows
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation attempted while the client is not connected
    #[error("Device not connected")]
    NotConnected,

    /// Configuration loading or endpoint parameter errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => MasterError::Timeout(err.to_string()),
            _ => MasterError::Connection(err.to_string()),
        }
    }
}

impl From<figment::Error> for MasterError {
    fn from(err: figment::Error) -> Self {
        MasterError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl MasterError {
    pub fn connection(msg: impl Into<String>) -> Self {
        MasterError::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        MasterError::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        MasterError::Protocol(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        MasterError::UnsupportedType(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        MasterError::InvalidInput(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        MasterError::Config(msg.into())
    }

    pub fn parse(data_type: DataType, token: impl Into<String>) -> Self {
        MasterError::Parse {
            data_type,
            token: token.into(),
        }
    }

    /// Check if this error means the transport is gone and must be reopened
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, MasterError::Connection(_) | MasterError::NotConnected)
    }

    /// Exception code carried by a slave exception response, if any
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            MasterError::ProtocolException { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Human-readable name of a standard Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
