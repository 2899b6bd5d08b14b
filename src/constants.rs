//! Protocol constants derived from the Modbus RTU framing rules
//!
//! - Maximum ADU size: 256 bytes (RS485 limit)
//! - Maximum PDU size: 253 bytes (ADU minus address and CRC)
//! - Register limits are calculated to fit within the PDU size constraint

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum legal ADU (Application Data Unit) on the wire
/// Format: Address(1) + Function(1) + PDU payload(0..251) + CRC(2)
pub const MAX_ADU_LEN: usize = 256;

/// Minimum legal ADU: Address(1) + Function(1) + CRC(2), an empty-payload frame
pub const MIN_ADU_LEN: usize = 4;

/// Receive buffer capacity: one byte beyond the maximum legal ADU.
/// A reception that fills the buffer completely can only be an overrun,
/// which the driver reports through the receive-error event.
pub const ADU_BUFFER_LEN: usize = MAX_ADU_LEN + 1;

/// Maximum PDU (Protocol Data Unit) size
/// = 256 (ADU) - 1 (address) - 2 (CRC) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// CRC trailer length
pub const CRC_LEN: usize = 2;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: Function(1) + Byte Count(1) + N x 2 <= 253, so N <= 125
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: Function(1) + Start(2) + Quantity(2) + Byte Count(1) + N x 2 <= 253,
/// so N <= 123
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum payload of a data-packet transfer (FC 0x64/0x65)
///
/// Response PDU: Function(1) + Length(1) + N <= 253, so N <= 251
pub const MAX_PACKET_LEN: usize = 251;

// ============================================================================
// Addressing
// ============================================================================

/// Broadcast station address; all slaves act on it and none answers
pub const BROADCAST_ADDRESS: u8 = 0;

/// Highest legal unicast station address
pub const MAX_UNICAST_ADDRESS: u8 = 247;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_DIAGNOSTIC: u8 = 0x08;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
#[cfg(feature = "data-packets")]
pub const FC_READ_DATA_PACKET: u8 = 0x64;
#[cfg(feature = "data-packets")]
pub const FC_WRITE_DATA_PACKET: u8 = 0x65;

/// High bit of the function byte, set on exception responses
pub const EXCEPTION_FLAG: u8 = 0x80;

/// The only diagnostic subfunction this stack serves (loopback echo)
pub const DIAG_SUB_ECHO: u16 = 0x0000;

// ============================================================================
// Timing
// ============================================================================

/// Default master answer timeout, measured from the moment the receiver
/// was armed after the request finished transmitting
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 100;
