//! Collaborator contracts
//!
//! The engines own no hardware. Everything physical — the UART, the
//! direction toggle, the register backing store, the time source — sits
//! behind these traits, captured once at stack construction.
//!
//! `SerialLink::send` and `SerialLink::arm_receive` may be invoked from a
//! transmission-complete callback (the master re-arms its receiver there),
//! so implementations must be safe to call from interrupt context.

use std::time::Instant;

use crate::error::Result;
use crate::frame::ExceptionCode;

/// Half-duplex serial driver surface consumed by both engines
///
/// `send` hands a complete frame to the driver; the driver reports
/// completion through the owning engine's `tx_done`. `arm_receive` prepares
/// the driver for one inbound frame, completed via `rx_done` or `rx_error`.
pub trait SerialLink {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn arm_receive(&mut self) -> Result<()>;
}

/// Register and packet backing store of a slave station
///
/// Methods return the Modbus exception to put on the wire instead of a
/// normal answer; address-range gaps finer than the stack's upper bound
/// are rejected here with [`ExceptionCode::IllegalDataAddress`].
pub trait SlaveDevice {
    /// Read one holding register (function 0x03)
    fn read_register(&mut self, address: u16) -> std::result::Result<u16, ExceptionCode>;

    /// Read one input register (function 0x04); devices with a single
    /// register space leave the default in place
    fn read_input_register(&mut self, address: u16) -> std::result::Result<u16, ExceptionCode> {
        self.read_register(address)
    }

    /// Write one holding register (function 0x10)
    fn write_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> std::result::Result<(), ExceptionCode>;

    /// Produce the outbound data packet (function 0x64): fill `out` and
    /// return the number of bytes written
    #[cfg(feature = "data-packets")]
    fn read_packet(&mut self, out: &mut [u8]) -> std::result::Result<usize, ExceptionCode>;

    /// Accept an inbound data packet (function 0x65)
    #[cfg(feature = "data-packets")]
    fn write_packet(&mut self, data: &[u8]) -> std::result::Result<(), ExceptionCode>;
}

/// Monotonic millisecond time source
///
/// Both the cooperative tick and the transmission-complete callback read
/// it, so implementations must be callable from either context.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Process-monotonic clock for hosted targets
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
