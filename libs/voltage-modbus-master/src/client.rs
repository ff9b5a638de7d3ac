//! Modbus master client
//!
//! Drives the connection lifecycle and the per-operation transactions:
//! build the PDU, frame it for the unit named by the call, exchange it over
//! the session, decode the response and convert register payloads into
//! typed values. Every transaction that reaches the wire updates the
//! last-exchange record.
//!
//! Transactions are serialised on the session lock, so a polling task and a
//! manual call sharing one client queue up rather than interleave frames.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::audit::{Exchange, ExchangeLogger, TracingExchangeLogger};
use crate::codec::{DataConverter, ModbusValue};
use crate::config::{EndpointConfig, MasterConfig};
use crate::connection::TransportSession;
use crate::constants::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{MasterError, Result};
use crate::pdu::{
    self, parse_bit_payload, parse_register_payload, read_request, verify_write_echo,
    FunctionCode, ModbusPdu,
};
use crate::transport::decode_response;
use crate::types::{ByteOrder, ClientState, DataType, RegisterType, TransportKind, WordOrder};

/// A read the caller wants performed, possibly repeatedly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub unit_id: u8,
    pub register_type: RegisterType,
    pub address: u16,
    pub count: u16,
    /// Ignored for coils and discrete inputs, which always yield booleans
    #[serde(default)]
    pub data_type: DataType,
}

impl ReadRequest {
    pub fn holding(unit_id: u8, address: u16, count: u16, data_type: DataType) -> Self {
        Self {
            unit_id,
            register_type: RegisterType::HoldingRegister,
            address,
            count,
            data_type,
        }
    }
}

pub struct ModbusClient {
    session: Mutex<Option<TransportSession>>,
    state: RwLock<ClientState>,
    converter: RwLock<DataConverter>,
    last_exchange: RwLock<Option<Exchange>>,
    request_timeout: RwLock<Duration>,
    logger: Arc<dyn ExchangeLogger>,
}

impl Default for ModbusClient {
    fn default() -> Self {
        Self::new(Arc::new(TracingExchangeLogger::default()))
    }
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("state", &*self.state.read())
            .field("converter", &*self.converter.read())
            .finish()
    }
}

impl ModbusClient {
    pub fn new(logger: Arc<dyn ExchangeLogger>) -> Self {
        Self {
            session: Mutex::new(None),
            state: RwLock::new(ClientState::Disconnected),
            converter: RwLock::new(DataConverter::default()),
            last_exchange: RwLock::new(None),
            request_timeout: RwLock::new(DEFAULT_REQUEST_TIMEOUT),
            logger,
        }
    }

    /// Client carrying the data order and timeout from `config`
    pub fn from_config(config: &MasterConfig, logger: Arc<dyn ExchangeLogger>) -> Self {
        let client = Self::new(logger);
        *client.converter.write() = config.converter();
        *client.request_timeout.write() = config.request_timeout();
        client
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open `endpoint`, replacing any session already held
    pub async fn connect(&self, endpoint: &EndpointConfig) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(mut old) = session.take() {
            old.close().await;
        }

        self.set_state(ClientState::Connecting, &format!("connecting to {endpoint}"));
        let timeout = *self.request_timeout.read();
        match TransportSession::open(endpoint, timeout).await {
            Ok(opened) => {
                *session = Some(opened);
                self.set_state(ClientState::Connected, &format!("{} {}", endpoint.kind(), endpoint));
                Ok(())
            },
            Err(e) => {
                self.set_state(ClientState::Disconnected, &e.to_string());
                Err(e)
            },
        }
    }

    /// Adopt an already-open session
    pub async fn attach(&self, opened: TransportSession) {
        let mut session = self.session.lock().await;
        if let Some(mut old) = session.take() {
            old.close().await;
        }
        let reason = format!("attached {} {}", opened.kind(), opened.peer());
        *session = Some(opened);
        self.set_state(ClientState::Connected, &reason);
    }

    /// Close the session if any; always ends Disconnected
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if let Some(mut old) = session.take() {
            old.close().await;
        }
        self.set_state(ClientState::Disconnected, "disconnect requested");
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Transport of the open session
    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.session.lock().await.as_ref().map(TransportSession::kind)
    }

    /// Applies to the next connect and to the open session
    pub async fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.write() = timeout;
        if let Some(session) = self.session.lock().await.as_mut() {
            session.set_request_timeout(timeout);
        }
    }

    // ========================================================================
    // Data order / audit
    // ========================================================================

    /// Affects conversions performed after this call only
    pub fn set_data_order(&self, byte_order: ByteOrder, word_order: WordOrder) {
        *self.converter.write() = DataConverter::new(byte_order, word_order);
        info!("Data order: {} / {}", byte_order, word_order);
    }

    pub fn data_converter(&self) -> DataConverter {
        *self.converter.read()
    }

    /// Request and response of the most recent transaction, `None` before the first
    pub fn last_exchange(&self) -> Option<Exchange> {
        self.last_exchange.read().clone()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn read_holding_registers(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
        data_type: DataType,
    ) -> Result<ModbusValue> {
        self.read_registers(FunctionCode::ReadHoldingRegisters, unit_id, address, count, data_type)
            .await
    }

    pub async fn read_input_registers(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
        data_type: DataType,
    ) -> Result<ModbusValue> {
        self.read_registers(FunctionCode::ReadInputRegisters, unit_id, address, count, data_type)
            .await
    }

    pub async fn read_coils(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        self.read_bits(FunctionCode::ReadCoils, unit_id, address, count)
            .await
    }

    pub async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>> {
        self.read_bits(FunctionCode::ReadDiscreteInputs, unit_id, address, count)
            .await
    }

    /// Dispatch on the request's register table
    pub async fn read(&self, request: &ReadRequest) -> Result<ModbusValue> {
        let ReadRequest {
            unit_id,
            register_type,
            address,
            count,
            data_type,
        } = *request;
        match register_type {
            RegisterType::HoldingRegister => {
                self.read_holding_registers(unit_id, address, count, data_type)
                    .await
            },
            RegisterType::InputRegister => {
                self.read_input_registers(unit_id, address, count, data_type)
                    .await
            },
            RegisterType::Coil => self
                .read_coils(unit_id, address, count)
                .await
                .map(ModbusValue::Bool),
            RegisterType::DiscreteInput => self
                .read_discrete_inputs(unit_id, address, count)
                .await
                .map(ModbusValue::Bool),
        }
    }

    async fn read_registers(
        &self,
        function: FunctionCode,
        unit_id: u8,
        address: u16,
        count: u16,
        data_type: DataType,
    ) -> Result<ModbusValue> {
        let per_value = data_type.registers_per_value();
        if (count as usize) < per_value && data_type != DataType::UnixTimestamp {
            return Err(MasterError::invalid_input(format!(
                "{data_type} needs {per_value} registers per value, count is {count}"
            )));
        }
        let pdu = read_request(function, address, count)?;
        let registers = self
            .transaction(unit_id, pdu, |_, payload| parse_register_payload(payload, count))
            .await?;
        let converter = self.data_converter();
        converter.convert_from_registers(&registers, data_type)
    }

    async fn read_bits(
        &self,
        function: FunctionCode,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>> {
        let pdu = read_request(function, address, count)?;
        self.transaction(unit_id, pdu, |_, payload| parse_bit_payload(payload, count))
            .await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Encode `value` with the current data order and write it from `address`
    ///
    /// One register goes out as FC06, more as FC16.
    pub async fn write_holding_registers(
        &self,
        unit_id: u8,
        address: u16,
        value: &ModbusValue,
    ) -> Result<()> {
        let registers = self.data_converter().convert_to_registers(value)?;
        let pdu = match registers.as_slice() {
            [] => return Err(MasterError::invalid_input("nothing to write")),
            [single] => pdu::write_single_register(address, *single)?,
            many => pdu::write_multiple_registers(address, many)?,
        };
        self.transaction(unit_id, pdu, verify_write_echo).await
    }

    /// Parse `text` as `data_type`, then write it; bad input never reaches the wire
    pub async fn write_holding_text(
        &self,
        unit_id: u8,
        address: u16,
        text: &str,
        data_type: DataType,
    ) -> Result<()> {
        let value = self.data_converter().parse_text(text, data_type)?;
        self.write_holding_registers(unit_id, address, &value).await
    }

    /// One coil goes out as FC05, more as FC15
    pub async fn write_coils(&self, unit_id: u8, address: u16, values: &[bool]) -> Result<()> {
        let pdu = match values {
            [] => return Err(MasterError::invalid_input("nothing to write")),
            [single] => pdu::write_single_coil(address, *single)?,
            many => pdu::write_multiple_coils(address, many)?,
        };
        self.transaction(unit_id, pdu, verify_write_echo).await
    }

    // ========================================================================
    // Transaction engine
    // ========================================================================

    /// Exchange `pdu` with `unit_id` and hand the response payload to `handle`
    ///
    /// The response ADU is recorded only when the slave answered normally and
    /// `handle` accepted the payload.
    async fn transaction<T, F>(&self, unit_id: u8, pdu: ModbusPdu, handle: F) -> Result<T>
    where
        F: FnOnce(&ModbusPdu, &[u8]) -> Result<T>,
    {
        if !self.is_connected() {
            return Err(MasterError::NotConnected);
        }
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(MasterError::NotConnected)?;

        let request = session.prepare(unit_id, &pdu)?;
        self.logger.frame_sent(unit_id, &request.adu);

        let outcome = match session.transact(&request).await {
            Ok(response) => {
                self.logger.frame_received(unit_id, &response.raw);
                decode_response(&response.adu.pdu, request.function)
                    .and_then(|payload| handle(&pdu, payload))
                    .map(|value| (value, response.raw))
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok((value, raw)) => {
                self.record(request.adu, Some(raw));
                debug!("{} unit={} ok", request.function, unit_id);
                Ok(value)
            },
            Err(e) => {
                self.record(request.adu, None);
                self.logger.transaction_failed(unit_id, &e);
                if e.needs_reconnect() {
                    if let Some(mut dead) = guard.take() {
                        dead.close().await;
                    }
                    self.set_state(ClientState::Disconnected, &e.to_string());
                }
                Err(e)
            },
        }
    }

    fn record(&self, sent: Vec<u8>, received: Option<Vec<u8>>) {
        *self.last_exchange.write() = Some(Exchange { sent, received });
    }

    fn set_state(&self, to: ClientState, reason: &str) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from != to {
            self.logger.state_changed(from, to, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopExchangeLogger;

    fn client() -> ModbusClient {
        ModbusClient::new(Arc::new(NoopExchangeLogger))
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = client();
        assert_eq!(client.state(), ClientState::Disconnected);

        let err = client
            .read_holding_registers(1, 0, 2, DataType::UInt32)
            .await
            .unwrap_err();
        assert_eq!(err, MasterError::NotConnected);
        let err = client.write_coils(1, 0, &[true]).await.unwrap_err();
        assert_eq!(err, MasterError::NotConnected);

        // nothing reached the wire
        assert_eq!(client.last_exchange(), None);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = client();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.transport_kind().await, None);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let client = client();
        // port 1 on localhost is closed on any sane test host
        let err = client
            .connect(&EndpointConfig::tcp("127.0.0.1", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::Connection(_)));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejected_before_io() {
        let client = client();
        let err = client
            .connect(&EndpointConfig::tcp("  ", 502, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::Config(_)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_bad_text_fails_before_connection_check() {
        let client = client();
        let err = client
            .write_holding_text(1, 0, "12,abc", DataType::Int16)
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::Parse { ref token, .. } if token == "abc"));
    }

    #[test]
    fn test_set_data_order() {
        let client = client();
        client.set_data_order(ByteOrder::BA, WordOrder::W4321);
        assert_eq!(
            client.data_converter(),
            DataConverter::new(ByteOrder::BA, WordOrder::W4321)
        );
    }

    #[test]
    fn test_from_config_applies_order_and_timeout() {
        let config = MasterConfig {
            word_order: WordOrder::W4321,
            request_timeout_ms: 250,
            ..MasterConfig::default()
        };
        let client = ModbusClient::from_config(&config, Arc::new(NoopExchangeLogger));
        assert_eq!(client.data_converter().word_order, WordOrder::W4321);
        assert_eq!(*client.request_timeout.read(), Duration::from_millis(250));
    }

    #[test]
    fn test_read_request_from_json() {
        let request: ReadRequest = serde_json::from_str(
            r#"{"unit_id":3,"register_type":"coil","address":4,"count":8}"#,
        )
        .unwrap();
        assert_eq!(request.register_type, RegisterType::Coil);
        assert_eq!(request.data_type, DataType::UInt16);

        let request = ReadRequest::holding(1, 0, 2, DataType::Float32);
        let json = serde_json::to_value(request).unwrap();
        assert_eq!(json["register_type"], "holding_register");
        assert_eq!(json["data_type"], "FLOAT32");
    }
}
