//! ADU framing for Modbus TCP (MBAP header) and RTU (address + CRC16)
//!
//! Builds request frames, parses and validates response frames, and turns a
//! response PDU into either its payload or a typed exception.

use tracing::debug;

use crate::constants::{
    rtu_frame_size, tcp_frame_size, MAX_MBAP_LENGTH, MAX_RTU_FRAME_SIZE, MBAP_HEADER_LEN,
    MBAP_PREFIX_LEN, MODBUS_PROTOCOL_ID,
};
use crate::error::{MasterError, Result};
use crate::pdu::{FunctionCode, ModbusPdu, EXCEPTION_FLAG};
use crate::types::TransportKind;

/// Framing parameters for one ADU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// MBAP header carrying the transaction ID
    Tcp { transaction_id: u16 },
    /// Unit address and trailing CRC16
    Rtu,
}

impl Framing {
    pub fn kind(&self) -> TransportKind {
        match self {
            Framing::Tcp { .. } => TransportKind::Tcp,
            Framing::Rtu => TransportKind::Rtu,
        }
    }

    pub fn transaction_id(&self) -> Option<u16> {
        match self {
            Framing::Tcp { transaction_id } => Some(*transaction_id),
            Framing::Rtu => None,
        }
    }
}

/// A received frame split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAdu {
    pub transaction_id: Option<u16>,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

// ============================================================================
// Build
// ============================================================================

/// Wrap `pdu` for the wire
pub fn build_adu(pdu: &ModbusPdu, unit_id: u8, framing: Framing) -> Vec<u8> {
    match framing {
        Framing::Tcp { transaction_id } => {
            // length covers unit id + PDU
            let length = (pdu.len() + 1) as u16;
            let mut frame = Vec::with_capacity(tcp_frame_size(pdu.len()));
            frame.extend_from_slice(&transaction_id.to_be_bytes());
            frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
            frame.extend_from_slice(&length.to_be_bytes());
            frame.push(unit_id);
            frame.extend_from_slice(pdu.as_slice());
            debug!(
                "TCP frame: tid={:04X} unit={} fc={:02X} len={}",
                transaction_id,
                unit_id,
                pdu.function_code().unwrap_or(0),
                pdu.len()
            );
            frame
        },
        Framing::Rtu => {
            let mut frame = Vec::with_capacity(rtu_frame_size(pdu.len()));
            frame.push(unit_id);
            frame.extend_from_slice(pdu.as_slice());
            let crc = crc16(&frame);
            frame.extend_from_slice(&crc.to_le_bytes());
            debug!(
                "RTU frame: unit={} fc={:02X} len={} crc={:04X}",
                unit_id,
                pdu.function_code().unwrap_or(0),
                pdu.len(),
                crc
            );
            frame
        },
    }
}

/// Modbus CRC16 (poly 0xA001, init 0xFFFF). Appended to RTU frames low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

// ============================================================================
// Parse
// ============================================================================

pub fn parse_adu(data: &[u8], kind: TransportKind) -> Result<ParsedAdu> {
    match kind {
        TransportKind::Tcp => parse_tcp_adu(data),
        TransportKind::Rtu => parse_rtu_adu(data),
    }
}

/// Validate MBAP header and extract the PDU
pub fn parse_tcp_adu(data: &[u8]) -> Result<ParsedAdu> {
    if data.len() < MBAP_HEADER_LEN + 1 {
        return Err(MasterError::protocol(format!(
            "TCP frame too short: {} bytes",
            data.len()
        )));
    }

    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    let protocol_id = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    let unit_id = data[6];

    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(MasterError::protocol(format!(
            "Invalid protocol ID: expected 0, got {protocol_id}"
        )));
    }
    if length == 0 || length > MAX_MBAP_LENGTH {
        return Err(MasterError::protocol(format!("Invalid MBAP length: {length}")));
    }
    if data.len() != MBAP_PREFIX_LEN + length {
        return Err(MasterError::protocol(format!(
            "Invalid TCP frame length: expected {}, got {}",
            MBAP_PREFIX_LEN + length,
            data.len()
        )));
    }

    Ok(ParsedAdu {
        transaction_id: Some(transaction_id),
        unit_id,
        pdu: ModbusPdu::from_slice(&data[MBAP_HEADER_LEN..])?,
    })
}

/// Check the trailing CRC and extract the PDU
pub fn parse_rtu_adu(data: &[u8]) -> Result<ParsedAdu> {
    if data.len() < 4 {
        return Err(MasterError::protocol(format!(
            "RTU frame too short: {} bytes",
            data.len()
        )));
    }
    if data.len() > MAX_RTU_FRAME_SIZE {
        return Err(MasterError::protocol(format!(
            "RTU frame too long: {} bytes",
            data.len()
        )));
    }

    let (body, crc_bytes) = data.split_at(data.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let calculated = crc16(body);
    if received != calculated {
        return Err(MasterError::protocol(format!(
            "CRC mismatch: expected {calculated:04X}, got {received:04X}"
        )));
    }

    Ok(ParsedAdu {
        transaction_id: None,
        unit_id: body[0],
        pdu: ModbusPdu::from_slice(&body[1..])?,
    })
}

/// Total RTU response length announced by the first bytes of a frame
///
/// Needs at least unit id and function code; read responses also need the
/// byte count. Returns `None` until enough bytes are present or when the
/// function code is not one this master issues.
pub fn rtu_response_length(prefix: &[u8]) -> Option<usize> {
    let fc = *prefix.get(1)?;
    if fc & EXCEPTION_FLAG != 0 {
        // unit + fc + code + crc
        return Some(5);
    }
    match FunctionCode::try_from(fc).ok()? {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => prefix.get(2).map(|n| 3 + *n as usize + 2),
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => Some(8),
    }
}

/// Payload of a response to `expected`, or the slave's exception
pub fn decode_response(pdu: &ModbusPdu, expected: FunctionCode) -> Result<&[u8]> {
    let fc = pdu
        .function_code()
        .ok_or_else(|| MasterError::protocol("empty response PDU"))?;

    if fc == expected.exception_code() {
        let code = pdu
            .exception_code()
            .ok_or_else(|| MasterError::protocol("exception response without code"))?;
        debug!("Exception fc={:02X} code={:02X}", expected.code(), code);
        return Err(MasterError::ProtocolException {
            function: expected.code(),
            code,
        });
    }
    if fc != expected.code() {
        return Err(MasterError::protocol(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            expected.code(),
            fc
        )));
    }
    Ok(pdu.payload())
}

// ============================================================================
// Frame Processor
// ============================================================================

/// Per-session framing state: the transport kind and, for TCP, the
/// transaction ID counter.
#[derive(Debug)]
pub struct ModbusFrameProcessor {
    kind: TransportKind,
    next_transaction_id: u16,
}

impl ModbusFrameProcessor {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            next_transaction_id: 1,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Wraps from 0xFFFF to 0x0000
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    /// Frame the next request, consuming a transaction ID on TCP
    pub fn build_request(&mut self, unit_id: u8, pdu: &ModbusPdu) -> (Vec<u8>, Framing) {
        let framing = match self.kind {
            TransportKind::Tcp => Framing::Tcp {
                transaction_id: self.next_transaction_id(),
            },
            TransportKind::Rtu => Framing::Rtu,
        };
        (build_adu(pdu, unit_id, framing), framing)
    }

    pub fn parse_response(&self, data: &[u8]) -> Result<ParsedAdu> {
        parse_adu(data, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_pdu() -> ModbusPdu {
        ModbusPdu::from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap()
    }

    // ========================================================================
    // CRC
    // ========================================================================

    #[test]
    fn test_crc16_reference_vectors() {
        // Reference frame 01 03 00 00 00 01 -> CRC bytes 84 0A on the wire
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        // Reference frame 01 03 00 00 00 0A -> C5 CD
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
        // Check value of CRC-16/MODBUS over "123456789"
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    // ========================================================================
    // Build
    // ========================================================================

    #[test]
    fn test_build_tcp_adu() {
        let frame = build_adu(&read_pdu(), 1, Framing::Tcp { transaction_id: 0x1234 });
        assert_eq!(
            frame,
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(frame.len(), tcp_frame_size(read_pdu().len()));
    }

    #[test]
    fn test_build_rtu_adu_crc_low_byte_first() {
        let frame = build_adu(&read_pdu(), 1, Framing::Rtu);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert_eq!(frame.len(), rtu_frame_size(read_pdu().len()));
    }

    #[test]
    fn test_transaction_ids_increment_and_wrap() {
        let mut processor = ModbusFrameProcessor::new(TransportKind::Tcp);
        let first = processor.next_transaction_id();
        assert_eq!(processor.next_transaction_id(), first + 1);

        processor.next_transaction_id = 0xFFFF;
        assert_eq!(processor.next_transaction_id(), 0xFFFF);
        assert_eq!(processor.next_transaction_id(), 0x0000);
    }

    #[test]
    fn test_rtu_processor_has_no_transaction_id() {
        let mut processor = ModbusFrameProcessor::new(TransportKind::Rtu);
        let (frame, framing) = processor.build_request(7, &read_pdu());
        assert_eq!(framing, Framing::Rtu);
        assert_eq!(framing.transaction_id(), None);
        assert_eq!(frame[0], 7);
    }

    // ========================================================================
    // Parse
    // ========================================================================

    #[test]
    fn test_parse_tcp_adu() {
        let data = [0x00, 0x05, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A];
        let adu = parse_tcp_adu(&data).unwrap();
        assert_eq!(adu.transaction_id, Some(5));
        assert_eq!(adu.unit_id, 1);
        assert_eq!(adu.pdu.as_slice(), &[0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_parse_tcp_rejects_bad_header() {
        // protocol id 1
        let data = [0x00, 0x05, 0x00, 0x01, 0x00, 0x03, 0x01, 0x83, 0x02];
        assert!(parse_tcp_adu(&data).is_err());
        // length disagrees with frame size
        let data = [0x00, 0x05, 0x00, 0x00, 0x00, 0x09, 0x01, 0x83, 0x02];
        assert!(parse_tcp_adu(&data).is_err());
    }

    #[test]
    fn test_parse_rtu_adu() {
        let frame = build_adu(
            &ModbusPdu::from_slice(&[0x03, 0x02, 0x00, 0x2A]).unwrap(),
            1,
            Framing::Rtu,
        );
        let adu = parse_rtu_adu(&frame).unwrap();
        assert_eq!(adu.transaction_id, None);
        assert_eq!(adu.pdu.payload(), &[0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_parse_rtu_rejects_bad_crc() {
        let mut frame = build_adu(&read_pdu(), 1, Framing::Rtu);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = parse_rtu_adu(&frame).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn test_rtu_response_length() {
        assert_eq!(rtu_response_length(&[0x01]), None);
        assert_eq!(rtu_response_length(&[0x01, 0x83]), Some(5));
        assert_eq!(rtu_response_length(&[0x01, 0x03]), None);
        assert_eq!(rtu_response_length(&[0x01, 0x03, 0x04]), Some(9));
        assert_eq!(rtu_response_length(&[0x01, 0x10]), Some(8));
        assert_eq!(rtu_response_length(&[0x01, 0x2B]), None);
    }

    // ========================================================================
    // Decode
    // ========================================================================

    #[test]
    fn test_decode_response_payload() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x02, 0x00, 0x2A]).unwrap();
        let payload = decode_response(&pdu, FunctionCode::ReadHoldingRegisters).unwrap();
        assert_eq!(payload, &[0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_decode_response_exception_is_typed() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        let err = decode_response(&pdu, FunctionCode::ReadHoldingRegisters).unwrap_err();
        assert_eq!(
            err,
            MasterError::ProtocolException {
                function: 0x03,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_decode_response_function_mismatch() {
        let pdu = ModbusPdu::from_slice(&[0x04, 0x02, 0x00, 0x2A]).unwrap();
        let err = decode_response(&pdu, FunctionCode::ReadHoldingRegisters).unwrap_err();
        assert!(matches!(err, MasterError::Protocol(_)));
    }
}
