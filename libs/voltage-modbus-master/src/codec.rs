//! Register data conversion
//!
//! [`DataConverter`] turns raw 16-bit register arrays into typed
//! [`ModbusValue`]s and back, honouring the configured byte order (BYTE and
//! ASCII packing) and word order (32/64-bit assembly). It also parses the
//! comma-separated text operators type in for writes.

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MasterError, Result};
use crate::types::{ByteOrder, DataType, WordOrder};

/// Calendar rendering used for UNIX_TIMESTAMP values (UTC)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Rendered in place of a timestamp when fewer than two registers were read
pub const INVALID_TIMESTAMP: &str = "invalid timestamp";

// ============================================================================
// Typed Values
// ============================================================================

/// A decoded register payload, tagged by its data type
///
/// Every variant except `Ascii` holds one element per value group, so a read
/// of 4 registers as `Float32` yields two floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ModbusValue {
    Bytes(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Bool(Vec<bool>),
    /// Raw character bytes as packed in the registers, trailing NULs removed
    Ascii(Vec<u8>),
    /// Epoch seconds; empty when the source held fewer than two registers
    Timestamp(Vec<u32>),
}

impl ModbusValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ModbusValue::Bytes(_) => DataType::Byte,
            ModbusValue::Int16(_) => DataType::Int16,
            ModbusValue::UInt16(_) => DataType::UInt16,
            ModbusValue::Int32(_) => DataType::Int32,
            ModbusValue::UInt32(_) => DataType::UInt32,
            ModbusValue::Int64(_) => DataType::Int64,
            ModbusValue::UInt64(_) => DataType::UInt64,
            ModbusValue::Float32(_) => DataType::Float32,
            ModbusValue::Float64(_) => DataType::Float64,
            ModbusValue::Bool(_) => DataType::Bool,
            ModbusValue::Ascii(_) => DataType::Ascii,
            ModbusValue::Timestamp(_) => DataType::UnixTimestamp,
        }
    }

    /// Number of elements (bytes for ASCII)
    pub fn len(&self) -> usize {
        match self {
            ModbusValue::Bytes(v) => v.len(),
            ModbusValue::Int16(v) => v.len(),
            ModbusValue::UInt16(v) => v.len(),
            ModbusValue::Int32(v) => v.len(),
            ModbusValue::UInt32(v) => v.len(),
            ModbusValue::Int64(v) => v.len(),
            ModbusValue::UInt64(v) => v.len(),
            ModbusValue::Float32(v) => v.len(),
            ModbusValue::Float64(v) => v.len(),
            ModbusValue::Bool(v) => v.len(),
            ModbusValue::Ascii(s) => s.len(),
            ModbusValue::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn join_display<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Format epoch seconds as a UTC calendar string
pub fn format_timestamp(secs: u32) -> String {
    DateTime::from_timestamp(i64::from(secs), 0)
        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| INVALID_TIMESTAMP.to_string())
}

/// Comma-joined rendering; feeding it back to [`DataConverter::parse_text`]
/// with the same data type yields the same value. ASCII bytes that are not
/// valid UTF-8 render as U+FFFD.
impl fmt::Display for ModbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusValue::Bytes(v) => join_display(f, v),
            ModbusValue::Int16(v) => join_display(f, v),
            ModbusValue::UInt16(v) => join_display(f, v),
            ModbusValue::Int32(v) => join_display(f, v),
            ModbusValue::UInt32(v) => join_display(f, v),
            ModbusValue::Int64(v) => join_display(f, v),
            ModbusValue::UInt64(v) => join_display(f, v),
            ModbusValue::Float32(v) => join_display(f, v),
            ModbusValue::Float64(v) => join_display(f, v),
            ModbusValue::Bool(v) => join_display(f, v),
            ModbusValue::Ascii(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            ModbusValue::Timestamp(v) if v.is_empty() => f.write_str(INVALID_TIMESTAMP),
            ModbusValue::Timestamp(v) => {
                let rendered: Vec<String> = v.iter().map(|s| format_timestamp(*s)).collect();
                f.write_str(&rendered.join(","))
            },
        }
    }
}

// ============================================================================
// Converter
// ============================================================================

/// Register <-> value converter for one byte/word order setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataConverter {
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,
}

impl DataConverter {
    pub fn new(byte_order: ByteOrder, word_order: WordOrder) -> Self {
        Self {
            byte_order,
            word_order,
        }
    }

    /// Decode `registers` as `data_type`
    ///
    /// Registers past the last complete value group are dropped with a
    /// warning. An input holding no complete group at all is rejected with
    /// `InvalidInput`, except for UNIX_TIMESTAMP which degrades to an empty
    /// (placeholder) value.
    pub fn convert_from_registers(
        &self,
        registers: &[u16],
        data_type: DataType,
    ) -> Result<ModbusValue> {
        if registers.is_empty() {
            return Err(MasterError::invalid_input("register data is empty"));
        }

        let per_value = data_type.registers_per_value();
        let usable = registers.len() - registers.len() % per_value;
        if usable == 0 {
            if data_type == DataType::UnixTimestamp {
                warn!("Timestamp needs 2 registers, got {}", registers.len());
                return Ok(ModbusValue::Timestamp(Vec::new()));
            }
            return Err(MasterError::invalid_input(format!(
                "{} needs {} registers per value, got {}",
                data_type,
                per_value,
                registers.len()
            )));
        }
        if usable < registers.len() {
            warn!(
                "{}: {} trailing register(s) dropped, not a multiple of {}",
                data_type,
                registers.len() - usable,
                per_value
            );
        }
        let registers = &registers[..usable];

        let value = match data_type {
            DataType::Byte => ModbusValue::Bytes(self.registers_to_bytes(registers)),
            DataType::Int16 => ModbusValue::Int16(registers.iter().map(|r| *r as i16).collect()),
            DataType::UInt16 => ModbusValue::UInt16(registers.to_vec()),
            DataType::Int32 => ModbusValue::Int32(
                registers
                    .chunks_exact(2)
                    .map(|w| self.assemble_u32(w) as i32)
                    .collect(),
            ),
            DataType::UInt32 => ModbusValue::UInt32(
                registers
                    .chunks_exact(2)
                    .map(|w| self.assemble_u32(w))
                    .collect(),
            ),
            DataType::Int64 => ModbusValue::Int64(
                registers
                    .chunks_exact(4)
                    .map(|w| self.assemble_u64(w) as i64)
                    .collect(),
            ),
            DataType::UInt64 => ModbusValue::UInt64(
                registers
                    .chunks_exact(4)
                    .map(|w| self.assemble_u64(w))
                    .collect(),
            ),
            DataType::Float32 => ModbusValue::Float32(
                registers
                    .chunks_exact(2)
                    .map(|w| f32::from_bits(self.assemble_u32(w)))
                    .collect(),
            ),
            DataType::Float64 => ModbusValue::Float64(
                registers
                    .chunks_exact(4)
                    .map(|w| f64::from_bits(self.assemble_u64(w)))
                    .collect(),
            ),
            DataType::Bool => ModbusValue::Bool(
                registers
                    .iter()
                    .flat_map(|r| (0..16).map(move |bit| r & (1 << bit) != 0))
                    .collect(),
            ),
            DataType::Ascii => {
                let mut bytes = self.registers_to_bytes(registers);
                while bytes.last() == Some(&0) {
                    bytes.pop();
                }
                ModbusValue::Ascii(bytes)
            },
            DataType::UnixTimestamp => ModbusValue::Timestamp(
                registers
                    .chunks_exact(2)
                    .map(|w| self.assemble_u32(w))
                    .collect(),
            ),
        };
        Ok(value)
    }

    /// Encode a typed value into registers, the inverse of
    /// [`convert_from_registers`](Self::convert_from_registers)
    pub fn convert_to_registers(&self, value: &ModbusValue) -> Result<Vec<u16>> {
        let registers = match value {
            ModbusValue::Bytes(v) => self.bytes_to_registers(v),
            ModbusValue::Int16(v) => v.iter().map(|x| *x as u16).collect(),
            ModbusValue::UInt16(v) => v.clone(),
            ModbusValue::Int32(v) => v.iter().flat_map(|x| self.split_u32(*x as u32)).collect(),
            ModbusValue::UInt32(v) => v.iter().flat_map(|x| self.split_u32(*x)).collect(),
            ModbusValue::Int64(v) => v.iter().flat_map(|x| self.split_u64(*x as u64)).collect(),
            ModbusValue::UInt64(v) => v.iter().flat_map(|x| self.split_u64(*x)).collect(),
            ModbusValue::Float32(v) => v.iter().flat_map(|x| self.split_u32(x.to_bits())).collect(),
            ModbusValue::Float64(v) => v.iter().flat_map(|x| self.split_u64(x.to_bits())).collect(),
            ModbusValue::Bool(v) => v
                .chunks(16)
                .map(|bits| {
                    bits.iter()
                        .enumerate()
                        .fold(0u16, |acc, (i, on)| if *on { acc | (1 << i) } else { acc })
                })
                .collect(),
            ModbusValue::Ascii(bytes) => self.bytes_to_registers(bytes),
            ModbusValue::Timestamp(v) if v.is_empty() => {
                return Err(MasterError::unsupported(
                    "placeholder timestamp has no register form",
                ));
            },
            ModbusValue::Timestamp(v) => v.iter().flat_map(|x| self.split_u32(*x)).collect(),
        };
        Ok(registers)
    }

    /// Parse operator text as `data_type`
    ///
    /// The text is split on commas and each trimmed token parsed on its own;
    /// the first bad token is reported. ASCII is taken verbatim.
    pub fn parse_text(&self, text: &str, data_type: DataType) -> Result<ModbusValue> {
        let tokens: Vec<&str> = text.split(',').map(str::trim).collect();
        let value = match data_type {
            DataType::Byte => ModbusValue::Bytes(parse_tokens(&tokens, data_type, parse_number)?),
            DataType::Int16 => ModbusValue::Int16(parse_tokens(&tokens, data_type, parse_number)?),
            DataType::UInt16 => ModbusValue::UInt16(parse_tokens(&tokens, data_type, parse_number)?),
            DataType::Int32 => ModbusValue::Int32(parse_tokens(&tokens, data_type, parse_number)?),
            DataType::UInt32 => ModbusValue::UInt32(parse_tokens(&tokens, data_type, parse_number)?),
            DataType::Int64 => ModbusValue::Int64(parse_tokens(&tokens, data_type, parse_number)?),
            DataType::UInt64 => ModbusValue::UInt64(parse_tokens(&tokens, data_type, parse_number)?),
            DataType::Float32 => {
                ModbusValue::Float32(parse_tokens(&tokens, data_type, parse_number)?)
            },
            DataType::Float64 => {
                ModbusValue::Float64(parse_tokens(&tokens, data_type, parse_number)?)
            },
            DataType::Bool => ModbusValue::Bool(parse_tokens(&tokens, data_type, parse_bool)?),
            DataType::UnixTimestamp => {
                ModbusValue::Timestamp(parse_tokens(&tokens, data_type, parse_timestamp)?)
            },
            DataType::Ascii => ModbusValue::Ascii(text.as_bytes().to_vec()),
        };
        Ok(value)
    }

    fn registers_to_bytes(&self, registers: &[u16]) -> Vec<u8> {
        registers
            .iter()
            .flat_map(|r| self.byte_order.split(*r))
            .collect()
    }

    /// Odd-length input gets one zero pad byte
    fn bytes_to_registers(&self, bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks(2)
            .map(|pair| self.byte_order.join([pair[0], pair.get(1).copied().unwrap_or(0)]))
            .collect()
    }

    #[inline]
    fn assemble_u32(&self, words: &[u16]) -> u32 {
        let (hi, lo) = match self.word_order {
            WordOrder::W1234 => (words[0], words[1]),
            WordOrder::W4321 => (words[1], words[0]),
        };
        (u32::from(hi) << 16) | u32::from(lo)
    }

    #[inline]
    fn assemble_u64(&self, words: &[u16]) -> u64 {
        let fold = |acc: u64, w: &u16| (acc << 16) | u64::from(*w);
        match self.word_order {
            WordOrder::W1234 => words.iter().fold(0, fold),
            WordOrder::W4321 => words.iter().rev().fold(0, fold),
        }
    }

    #[inline]
    fn split_u32(&self, value: u32) -> [u16; 2] {
        let hi = (value >> 16) as u16;
        let lo = value as u16;
        match self.word_order {
            WordOrder::W1234 => [hi, lo],
            WordOrder::W4321 => [lo, hi],
        }
    }

    #[inline]
    fn split_u64(&self, value: u64) -> [u16; 4] {
        let mut words = [
            (value >> 48) as u16,
            (value >> 32) as u16,
            (value >> 16) as u16,
            value as u16,
        ];
        if self.word_order == WordOrder::W4321 {
            words.reverse();
        }
        words
    }
}

// ============================================================================
// Text Parsing
// ============================================================================

fn parse_tokens<T>(
    tokens: &[&str],
    data_type: DataType,
    parse: fn(&str) -> Option<T>,
) -> Result<Vec<T>> {
    tokens
        .iter()
        .map(|token| parse(token).ok_or_else(|| MasterError::parse(data_type, *token)))
        .collect()
}

fn parse_number<T: std::str::FromStr>(token: &str) -> Option<T> {
    token.parse().ok()
}

fn parse_bool(token: &str) -> Option<bool> {
    match token {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Epoch seconds, or a UTC calendar string in [`TIMESTAMP_FORMAT`]
fn parse_timestamp(token: &str) -> Option<u32> {
    if let Ok(secs) = token.parse::<u32>() {
        return Some(secs);
    }
    let naive = NaiveDateTime::parse_from_str(token, TIMESTAMP_FORMAT).ok()?;
    u32::try_from(naive.and_utc().timestamp()).ok()
}
