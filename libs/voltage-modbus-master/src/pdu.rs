//! Modbus PDU: function code plus payload
//!
//! Uses a fixed-size stack array since no PDU can exceed 253 bytes.
//! Request builders for the eight supported function codes live here too,
//! along with the payload checks applied to their responses.

use std::fmt;

use tracing::{debug, warn};

use crate::constants::{
    COIL_OFF, COIL_ON, MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use crate::error::{MasterError, Result};

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Function Codes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Function code a slave uses to report an exception for this request
    #[inline]
    pub fn exception_code(self) -> u8 {
        self.code() | EXCEPTION_FLAG
    }

    pub fn description(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = MasterError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(MasterError::protocol(format!(
                "unsupported function code 0x{other:02X}"
            ))),
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02X} ({})", self.code(), self.description())
    }
}

// ============================================================================
// PDU Buffer
// ============================================================================

#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Function code followed by `payload`
    pub fn encode(function: FunctionCode, payload: &[u8]) -> Result<Self> {
        let mut pdu = Self::new();
        pdu.push(function.code())?;
        pdu.extend(payload)?;
        Ok(pdu)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(MasterError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(MasterError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Big-endian, as every Modbus field is
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.extend(&value.to_be_bytes())
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(MasterError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Bytes after the function code
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.as_slice().get(1..).unwrap_or(&[])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .is_some_and(|fc| fc & EXCEPTION_FLAG != 0)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload().first().copied()
        } else {
            None
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusPdu")
            .field("data", &hex::encode_upper(self.as_slice()))
            .finish()
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ModbusPdu {}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: FunctionCode) -> Result<Self> {
        self.pdu.push(fc.code())?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> Result<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> Result<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }
}

// ============================================================================
// Request Builders
// ============================================================================

fn check_quantity(what: &str, count: u16, max: u16) -> Result<()> {
    if count == 0 || count > max {
        return Err(MasterError::invalid_input(format!(
            "{what} quantity {count} out of range 1..={max}"
        )));
    }
    Ok(())
}

/// FC01-FC04 request: start address and quantity
pub fn read_request(function: FunctionCode, address: u16, count: u16) -> Result<ModbusPdu> {
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            check_quantity("read bit", count, MAX_READ_COILS)?
        },
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            check_quantity("read register", count, MAX_READ_REGISTERS)?
        },
        other => {
            return Err(MasterError::invalid_input(format!(
                "{other} is not a read function"
            )))
        },
    }
    PduBuilder::new()
        .function_code(function)?
        .address(address)?
        .quantity(count)
        .map(PduBuilder::build)
}

/// FC06
pub fn write_single_register(address: u16, value: u16) -> Result<ModbusPdu> {
    PduBuilder::new()
        .function_code(FunctionCode::WriteSingleRegister)?
        .address(address)?
        .word(value)
        .map(PduBuilder::build)
}

/// FC05, encoding the coil state as 0xFF00 / 0x0000
pub fn write_single_coil(address: u16, on: bool) -> Result<ModbusPdu> {
    PduBuilder::new()
        .function_code(FunctionCode::WriteSingleCoil)?
        .address(address)?
        .word(if on { COIL_ON } else { COIL_OFF })
        .map(PduBuilder::build)
}

/// FC16 with byte count prefix
pub fn write_multiple_registers(address: u16, values: &[u16]) -> Result<ModbusPdu> {
    let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
    check_quantity("write register", count, MAX_WRITE_REGISTERS)?;
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    PduBuilder::new()
        .function_code(FunctionCode::WriteMultipleRegisters)?
        .address(address)?
        .quantity(count)?
        .byte(data.len() as u8)?
        .data(&data)
        .map(PduBuilder::build)
}

/// FC15 with byte count prefix; bits packed LSB first
pub fn write_multiple_coils(address: u16, values: &[bool]) -> Result<ModbusPdu> {
    let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
    check_quantity("write coil", count, MAX_WRITE_COILS)?;
    let data = pack_bits(values);
    PduBuilder::new()
        .function_code(FunctionCode::WriteMultipleCoils)?
        .address(address)?
        .quantity(count)?
        .byte(data.len() as u8)?
        .data(&data)
        .map(PduBuilder::build)
}

pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, on)| if *on { acc | (1 << i) } else { acc })
        })
        .collect()
}

pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|b| (0..8).map(move |bit| b & (1 << bit) != 0))
        .take(count)
        .collect()
}

// ============================================================================
// Response Payloads
// ============================================================================

/// FC03/FC04 response payload: byte count followed by registers
pub fn parse_register_payload(payload: &[u8], expected_count: u16) -> Result<Vec<u16>> {
    let (&byte_count, data) = payload
        .split_first()
        .ok_or_else(|| MasterError::protocol("register response missing byte count"))?;
    let byte_count = byte_count as usize;

    if byte_count != data.len() || byte_count % 2 != 0 {
        return Err(MasterError::protocol(format!(
            "register response byte count {} inconsistent with {} data bytes",
            byte_count,
            data.len()
        )));
    }
    let expected_bytes = expected_count as usize * 2;
    if byte_count != expected_bytes {
        warn!(
            "Byte count mismatch: expected {} bytes for {} registers, got {}",
            expected_bytes, expected_count, byte_count
        );
    }

    let registers: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    debug!("Parsed {} registers", registers.len());
    Ok(registers)
}

/// FC01/FC02 response payload, truncated to the requested bit count
pub fn parse_bit_payload(payload: &[u8], expected_count: u16) -> Result<Vec<bool>> {
    let (&byte_count, data) = payload
        .split_first()
        .ok_or_else(|| MasterError::protocol("bit response missing byte count"))?;
    let byte_count = byte_count as usize;

    if byte_count != data.len() {
        return Err(MasterError::protocol(format!(
            "bit response byte count {} inconsistent with {} data bytes",
            byte_count,
            data.len()
        )));
    }
    let needed = (expected_count as usize).div_ceil(8);
    if byte_count < needed {
        return Err(MasterError::protocol(format!(
            "bit response too short: {byte_count} bytes for {expected_count} bits"
        )));
    }
    Ok(unpack_bits(data, expected_count as usize))
}

/// FC05/06/15/16 responses echo address and value/quantity
pub fn verify_write_echo(request: &ModbusPdu, payload: &[u8]) -> Result<()> {
    let expected = request.payload().get(..4).ok_or_else(|| {
        MasterError::invalid_input(format!(
            "write request too short to echo: {} payload bytes",
            request.payload().len()
        ))
    })?;
    if payload != expected {
        return Err(MasterError::protocol(format!(
            "write response echo mismatch: sent {}, got {}",
            hex::encode_upper(expected),
            hex::encode_upper(payload)
        )));
    }
    Ok(())
}
