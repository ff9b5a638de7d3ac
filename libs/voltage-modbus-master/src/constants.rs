//! Modbus framing limits and engine defaults
//!
//! Frame limits follow the 256-byte RS485 ADU that every Modbus transport
//! inherits; quantity limits are the largest counts whose request or
//! response PDU still fits inside `MAX_PDU_SIZE`.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Bytes of the MBAP header that precede the length-counted part of a TCP ADU
/// (Transaction ID(2) + Protocol ID(2) + Length(2)).
pub const MBAP_PREFIX_LEN: usize = 6;

/// Full MBAP header including the unit identifier.
pub const MBAP_HEADER_LEN: usize = MBAP_PREFIX_LEN + 1;

/// Maximum PDU size: RS485 ADU (256) - slave address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Largest RTU ADU: address(1) + PDU(253) + CRC(2)
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Protocol identifier carried in every MBAP header
pub const MODBUS_PROTOCOL_ID: u16 = 0;

// ============================================================================
// Quantity Limits
// ============================================================================

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC01/FC02 practical limit (0x7D0)
pub const MAX_READ_COILS: u16 = 2000;

/// FC15 practical limit (0x7B0)
pub const MAX_WRITE_COILS: u16 = 1968;

// ============================================================================
// Engine Defaults
// ============================================================================

/// Per-transaction deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling interval used when the configuration does not name one
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1000);

/// Silence between RTU bytes after which a partial frame is abandoned
pub const RTU_INTER_FRAME_GAP: Duration = Duration::from_millis(50);

/// Value written by FC05 to switch a coil on
pub const COIL_ON: u16 = 0xFF00;

/// Value written by FC05 to switch a coil off
pub const COIL_OFF: u16 = 0x0000;

#[inline]
pub const fn tcp_frame_size(pdu_len: usize) -> usize {
    MBAP_HEADER_LEN + pdu_len
}

#[inline]
pub const fn rtu_frame_size(pdu_len: usize) -> usize {
    1 + pdu_len + 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 7);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(MAX_RTU_FRAME_SIZE, 256);
        assert_eq!(tcp_frame_size(5), 12);
        assert_eq!(rtu_frame_size(5), 8);
    }

    #[test]
    fn test_quantity_limits_fit_pdu() {
        assert!(2 + 2 * MAX_READ_REGISTERS as usize <= MAX_PDU_SIZE);
        assert!(6 + 2 * MAX_WRITE_REGISTERS as usize <= MAX_PDU_SIZE);
        assert!(2 + (MAX_READ_COILS as usize).div_ceil(8) <= MAX_PDU_SIZE);
        assert!(6 + (MAX_WRITE_COILS as usize).div_ceil(8) <= MAX_PDU_SIZE);
    }
}
