//! Modbus master engine
//!
//! Talks to Modbus slaves over TCP (MBAP framing) or a serial line (RTU
//! framing), converts register blocks to and from typed values, and polls
//! reads on a fixed interval:
//! - `codec`: typed values and the register/value/text conversions
//! - `pdu` / `transport`: PDU building and ADU framing, CRC16, response decoding
//! - `connection`: the byte stream session with per-request timeouts
//! - `client`: connection lifecycle, reads, writes and the last exchange
//! - `polling`: the periodic read loop

pub mod audit;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod logging;
pub mod pdu;
pub mod polling;
pub mod transport;
pub mod types;

pub use audit::{Exchange, ExchangeLogger, NoopExchangeLogger, TracingExchangeLogger};
pub use client::{ModbusClient, ReadRequest};
pub use codec::{DataConverter, ModbusValue};
pub use config::{EndpointConfig, MasterConfig, RtuEndpoint, TcpEndpoint};
pub use connection::TransportSession;
pub use error::{MasterError, Result};
pub use logging::init_logging;
pub use pdu::{FunctionCode, ModbusPdu, PduBuilder};
pub use polling::PollingScheduler;
pub use transport::{crc16, Framing, ModbusFrameProcessor};
pub use types::{
    ByteOrder, ClientState, DataType, Parity, RegisterType, TransportKind, WordOrder,
};
