//! Slave (server) engine
//!
//! A cooperative state machine serving one station address on a half-duplex
//! link. The main loop drives [`SlaveStack::poll`]; the serial driver
//! delivers completion events through [`rx_done`](SlaveStack::rx_done),
//! [`rx_error`](SlaveStack::rx_error) and [`tx_done`](SlaveStack::tx_done),
//! which only move the state word and never parse or call into the device.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, error, warn};

use crate::config::SlaveConfig;
use crate::constants::{
    BROADCAST_ADDRESS, CRC_LEN, DIAG_SUB_ECHO, EXCEPTION_FLAG, FC_DIAGNOSTIC,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    MAX_ADU_LEN, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS, MIN_ADU_LEN,
};
#[cfg(feature = "data-packets")]
use crate::constants::{FC_READ_DATA_PACKET, FC_WRITE_DATA_PACKET, MAX_PACKET_LEN};
use crate::constants::ADU_BUFFER_LEN;
use crate::device::{SerialLink, SlaveDevice};
use crate::error::Result;
use crate::frame::{AduBuffer, ExceptionCode};

/// Slave engine states
///
/// The receive and transmit completion events are honored only in their
/// matching armed state; anything else is dropped on the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlaveState {
    /// Idle; the next poll arms the receiver
    Standby = 0,
    /// Receiver armed, waiting for a frame
    Receiving = 1,
    /// A frame arrived; the next poll parses it
    Received = 2,
    /// Parse and dispatch in progress (main context only)
    Processing = 3,
    /// Answer handed to the driver, waiting for completion
    Transmitting = 4,
}

impl SlaveState {
    fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::Receiving,
            2 => Self::Received,
            3 => Self::Processing,
            4 => Self::Transmitting,
            _ => Self::Standby,
        }
    }
}

/// Why an inbound frame was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Shorter than the minimum ADU
    TooShort,
    /// Longer than any legal ADU (receive overrun)
    Overrun,
    /// Addressed to another station
    NotAddressed,
    /// CRC trailer does not match the content
    CrcMismatch,
}

/// Result of one slave poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveOutcome {
    /// Nothing to do this tick
    Idle,
    /// An answer (normal or exception) was handed to the driver
    Answered {
        function: u8,
        exception: Option<ExceptionCode>,
    },
    /// A broadcast request was processed; broadcasts are never answered
    Broadcast { function: u8 },
    /// The driver refused the answer frame
    SendFailed { function: u8 },
    /// The frame was dropped without dispatch
    Discarded(DiscardReason),
}

/// Slave engine counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SlaveStats {
    pub frames_received: u64,
    pub answers_sent: u64,
    pub exceptions_sent: u64,
    pub broadcasts_handled: u64,
    pub frames_discarded: u64,
    pub send_failures: u64,
}

/// Modbus RTU slave engine
pub struct SlaveStack<D: SlaveDevice, L: SerialLink> {
    address: u8,
    last_register: u16,
    buf: AduBuffer,
    /// Sole cross-context variable; relaxed single-word loads and stores
    /// from the tick and the driver callbacks
    state: AtomicU8,
    device: D,
    link: L,
    stats: SlaveStats,
}

impl<D: SlaveDevice, L: SerialLink> SlaveStack<D, L> {
    /// Build a slave engine; refuses an illegal station address
    pub fn new(config: SlaveConfig, device: D, link: L) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            address: config.address,
            last_register: config.last_register,
            buf: AduBuffer::new(),
            state: AtomicU8::new(SlaveState::Standby as u8),
            device,
            link,
            stats: SlaveStats::default(),
        })
    }

    /// Current engine state
    pub fn state(&self) -> SlaveState {
        SlaveState::from_raw(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: SlaveState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Own station address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Engine counters
    pub fn stats(&self) -> &SlaveStats {
        &self.stats
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Raw frame storage for drivers that receive in place. Only valid to
    /// fill while the engine is in [`SlaveState::Receiving`]; complete the
    /// reception with [`rx_done_in_place`](Self::rx_done_in_place).
    pub fn rx_storage(&mut self) -> &mut [u8; ADU_BUFFER_LEN] {
        self.buf.storage_mut()
    }

    // ------------------------------------------------------------------
    // Driver completion events (interrupt context)
    // ------------------------------------------------------------------

    /// Reception complete; copies the frame unless the driver already
    /// deposited it via [`rx_storage`](Self::rx_storage)
    pub fn rx_done(&mut self, frame: &[u8]) {
        if self.state() != SlaveState::Receiving {
            return;
        }
        if frame.is_empty() || frame.len() > ADU_BUFFER_LEN {
            self.set_state(SlaveState::Standby);
            return;
        }
        // Infallible: length was just checked against the capacity
        if self.buf.load(frame).is_err() {
            self.set_state(SlaveState::Standby);
            return;
        }
        self.set_state(SlaveState::Received);
    }

    /// Reception complete, frame already in the engine buffer (zero-copy)
    pub fn rx_done_in_place(&mut self, len: usize) {
        if self.state() != SlaveState::Receiving {
            return;
        }
        if len == 0 || len > ADU_BUFFER_LEN || self.buf.set_len(len).is_err() {
            self.set_state(SlaveState::Standby);
            return;
        }
        self.set_state(SlaveState::Received);
    }

    /// Framing or overrun error while receiving
    pub fn rx_error(&mut self) {
        if self.state() == SlaveState::Receiving {
            self.set_state(SlaveState::Standby);
        }
    }

    /// Answer transmission complete
    pub fn tx_done(&mut self) {
        if self.state() == SlaveState::Transmitting {
            self.set_state(SlaveState::Standby);
        }
    }

    // ------------------------------------------------------------------
    // Cooperative tick (main context)
    // ------------------------------------------------------------------

    /// Advance the engine: arm the receiver from standby, or parse,
    /// dispatch and answer a received frame
    pub fn poll(&mut self) -> SlaveOutcome {
        match self.state() {
            SlaveState::Standby => {
                match self.link.arm_receive() {
                    Ok(()) => self.set_state(SlaveState::Receiving),
                    // No fault state on the slave side; retried next poll
                    Err(e) => error!("Failed to arm receiver: {}", e),
                }
                SlaveOutcome::Idle
            }
            SlaveState::Received => {
                self.set_state(SlaveState::Processing);
                self.process_frame()
            }
            _ => SlaveOutcome::Idle,
        }
    }

    fn discard(&mut self, reason: DiscardReason) -> SlaveOutcome {
        debug!("Frame discarded: {:?}", reason);
        self.stats.frames_discarded += 1;
        self.set_state(SlaveState::Standby);
        SlaveOutcome::Discarded(reason)
    }

    fn process_frame(&mut self) -> SlaveOutcome {
        let len = self.buf.len();
        self.stats.frames_received += 1;
        debug!(
            "Processing received frame: {}",
            hex::encode(self.buf.as_slice())
        );

        if len < MIN_ADU_LEN {
            return self.discard(DiscardReason::TooShort);
        }
        if len > MAX_ADU_LEN {
            return self.discard(DiscardReason::Overrun);
        }

        let address = self.buf.as_slice()[0];
        if address != self.address && address != BROADCAST_ADDRESS {
            return self.discard(DiscardReason::NotAddressed);
        }
        if !self.buf.verify_crc() {
            return self.discard(DiscardReason::CrcMismatch);
        }

        let broadcast = address == BROADCAST_ADDRESS;
        let function = self.buf.as_slice()[1];

        let dispatched = match function {
            FC_READ_HOLDING_REGISTERS => self.handle_read_registers(false),
            FC_READ_INPUT_REGISTERS => self.handle_read_registers(true),
            FC_WRITE_MULTIPLE_REGISTERS => self.handle_write_registers(),
            FC_DIAGNOSTIC => self.handle_diagnostic(),
            #[cfg(feature = "data-packets")]
            FC_READ_DATA_PACKET => self.handle_read_packet(),
            #[cfg(feature = "data-packets")]
            FC_WRITE_DATA_PACKET => self.handle_write_packet(),
            _ => Err(ExceptionCode::IllegalFunction),
        };

        if broadcast {
            // Processed for side effects; never answered, errors included
            self.stats.broadcasts_handled += 1;
            self.set_state(SlaveState::Standby);
            return SlaveOutcome::Broadcast { function };
        }

        let exception = match dispatched {
            Ok(()) => None,
            Err(code) => {
                warn!(
                    "Answering FC{:02X} with exception code {:02X}",
                    function, code as u8
                );
                self.build_exception(function, code);
                Some(code)
            }
        };

        if let Err(e) = self.buf.seal() {
            error!("Answer frame rejected by sealer: {}", e);
            self.set_state(SlaveState::Standby);
            return SlaveOutcome::SendFailed { function };
        }

        self.set_state(SlaveState::Transmitting);
        match self.link.send(self.buf.as_slice()) {
            Ok(()) => {
                if exception.is_some() {
                    self.stats.exceptions_sent += 1;
                } else {
                    self.stats.answers_sent += 1;
                }
                SlaveOutcome::Answered {
                    function,
                    exception,
                }
            }
            Err(e) => {
                error!("Answer transmission failed: {}", e);
                self.stats.send_failures += 1;
                self.set_state(SlaveState::Standby);
                SlaveOutcome::SendFailed { function }
            }
        }
    }

    /// Overwrite the buffered request with an exception answer
    fn build_exception(&mut self, function: u8, code: ExceptionCode) {
        self.buf.truncate(1);
        let _ = self.buf.push(function | EXCEPTION_FLAG);
        let _ = self.buf.push(code as u8);
    }

    /// Functions 0x03/0x04: read a run of registers
    fn handle_read_registers(&mut self, input: bool) -> std::result::Result<(), ExceptionCode> {
        let body = self.buf.pdu_body();
        if body.len() != 4 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([body[0], body[1]]);
        // Count is narrowed to one byte on this stack; a nonzero high
        // byte is a malformed request
        if body[2] != 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let count = u16::from(body[3]);
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let end = start
            .checked_add(count - 1)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        if end > self.last_register {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        let mut values = [0u16; MAX_READ_REGISTERS as usize];
        for i in 0..count {
            values[i as usize] = if input {
                self.device.read_input_register(start + i)?
            } else {
                self.device.read_register(start + i)?
            };
        }

        self.buf.truncate(2);
        let overflow = |_| ExceptionCode::ServerDeviceFailure;
        self.buf.push((count * 2) as u8).map_err(overflow)?;
        for &value in &values[..count as usize] {
            self.buf.push_u16(value).map_err(overflow)?;
        }
        Ok(())
    }

    /// Function 0x10: write a run of registers, echo start and count
    fn handle_write_registers(&mut self) -> std::result::Result<(), ExceptionCode> {
        let body = self.buf.pdu_body();
        if body.len() < 5 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([body[0], body[1]]);
        if body[2] != 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let count = u16::from(body[3]);
        let byte_count = usize::from(body[4]);
        if count == 0
            || count > MAX_WRITE_REGISTERS
            || byte_count != 2 * count as usize
            || body.len() != 5 + byte_count
        {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let end = start
            .checked_add(count - 1)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        if end > self.last_register {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        // Data bytes start after addr(1) fc(1) start(2) count(2) byte_count(1)
        for i in 0..count {
            let off = 7 + 2 * i as usize;
            let bytes = self.buf.as_slice();
            let value = u16::from_be_bytes([bytes[off], bytes[off + 1]]);
            self.device.write_register(start + i, value)?;
        }

        self.buf.truncate(2);
        let overflow = |_| ExceptionCode::ServerDeviceFailure;
        self.buf.push_u16(start).map_err(overflow)?;
        self.buf.push_u16(count).map_err(overflow)?;
        Ok(())
    }

    /// Function 0x08: loopback echo, subfunction 0x0000 only
    fn handle_diagnostic(&mut self) -> std::result::Result<(), ExceptionCode> {
        let body = self.buf.pdu_body();
        if body.len() < 2 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let subfunction = u16::from_be_bytes([body[0], body[1]]);
        if subfunction != DIAG_SUB_ECHO {
            return Err(ExceptionCode::IllegalFunction);
        }
        // Echo the request unchanged; the send path re-appends the CRC
        let len = self.buf.len();
        self.buf.truncate(len - CRC_LEN);
        Ok(())
    }

    /// Function 0x64: produce a device-defined data packet
    #[cfg(feature = "data-packets")]
    fn handle_read_packet(&mut self) -> std::result::Result<(), ExceptionCode> {
        if !self.buf.pdu_body().is_empty() {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let mut packet = [0u8; MAX_PACKET_LEN];
        let len = self.device.read_packet(&mut packet)?;
        if len > MAX_PACKET_LEN {
            return Err(ExceptionCode::ServerDeviceFailure);
        }

        self.buf.truncate(2);
        let overflow = |_| ExceptionCode::ServerDeviceFailure;
        self.buf.push(len as u8).map_err(overflow)?;
        self.buf.extend(&packet[..len]).map_err(overflow)?;
        Ok(())
    }

    /// Function 0x65: accept a data packet, echo its length
    #[cfg(feature = "data-packets")]
    fn handle_write_packet(&mut self) -> std::result::Result<(), ExceptionCode> {
        let body = self.buf.pdu_body();
        if body.is_empty() {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let declared = usize::from(body[0]);
        if declared != body.len() - 1 {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let data_start = 3; // addr(1) fc(1) length(1)
        let data_end = data_start + declared;
        self.device
            .write_packet(&self.buf.as_slice()[data_start..data_end])?;

        self.buf.truncate(2);
        self.buf
            .push(declared as u8)
            .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
        Ok(())
    }
}
