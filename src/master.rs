//! Master (client) engine
//!
//! Issues one request at a time and tracks it to a terminal outcome. The
//! request builders run in main context; the driver reports completions
//! through [`tx_done`](MasterStack::tx_done), [`rx_done`](MasterStack::rx_done)
//! and [`rx_error`](MasterStack::rx_error). [`MasterStack::poll`] surfaces
//! each transaction's outcome exactly once and returns the engine to
//! standby on the same tick, so the caller may issue the next request
//! immediately.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, error, warn};

use crate::config::MasterConfig;
use crate::constants::{
    ADU_BUFFER_LEN, EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, MAX_ADU_LEN, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
    MIN_ADU_LEN,
};
#[cfg(feature = "data-packets")]
use crate::constants::{FC_READ_DATA_PACKET, FC_WRITE_DATA_PACKET, MAX_PACKET_LEN};
use crate::device::{Clock, SerialLink};
use crate::error::{Result, RtuError};
use crate::frame::AduBuffer;

/// Master engine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MasterState {
    /// Idle; a request may be issued
    Standby = 0,
    /// Request handed to the driver, waiting for completion
    Transmitting = 1,
    /// Receiver armed, answer pending
    WaitingAnswer = 2,
    /// An answer arrived; the next poll parses it
    Received = 3,
    /// Parse in progress (main context only)
    Processing = 4,
    /// Terminal: no answer within the timeout
    TimedOut = 5,
    /// Terminal: unusable answer (framing, CRC, wrong peer, wrong shape)
    Corrupted = 6,
    /// Terminal: the peer answered with a Modbus exception
    ErrReported = 7,
    /// Terminal: the answer parsed clean
    Processed = 8,
    /// Terminal: the driver refused to send or to arm the receiver
    HwError = 9,
}

impl MasterState {
    fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::Transmitting,
            2 => Self::WaitingAnswer,
            3 => Self::Received,
            4 => Self::Processing,
            5 => Self::TimedOut,
            6 => Self::Corrupted,
            7 => Self::ErrReported,
            8 => Self::Processed,
            9 => Self::HwError,
            _ => Self::Standby,
        }
    }
}

/// Register values carried back from a read transaction
#[derive(Debug, Clone, Copy)]
pub struct RegisterValues {
    values: [u16; MAX_READ_REGISTERS as usize],
    count: usize,
}

impl RegisterValues {
    pub fn as_slice(&self) -> &[u16] {
        &self.values[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Packet bytes carried back from a data-packet read
#[cfg(feature = "data-packets")]
#[derive(Debug, Clone, Copy)]
pub struct PacketBytes {
    data: [u8; MAX_PACKET_LEN],
    len: usize,
}

#[cfg(feature = "data-packets")]
impl PacketBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Payload of a cleanly parsed answer
#[derive(Debug, Clone)]
pub enum Response {
    /// Function 0x03/0x04 answer, unpacked big-endian
    Registers(RegisterValues),
    /// Function 0x10 echo, verified against the request
    WriteConfirmed { start: u16, count: u16 },
    /// Function 0x64 answer
    #[cfg(feature = "data-packets")]
    Packet(PacketBytes),
    /// Function 0x65 echo
    #[cfg(feature = "data-packets")]
    PacketWritten { len: u8 },
}

/// Terminal result of a transaction, reported exactly once
#[derive(Debug, Clone)]
pub enum MasterOutcome {
    /// The slave answered and the answer checked out
    Processed(Response),
    /// The slave reported a Modbus exception (raw wire byte; see
    /// [`exception_description`](crate::frame::exception_description))
    ExceptionReported(u8),
    /// The answer was unusable
    Corrupted,
    /// No answer within the configured timeout
    TimedOut,
    /// The driver failed while sending or arming the receiver
    HardwareFault,
}

/// Master engine counters
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterStats {
    pub requests_sent: u64,
    pub responses_processed: u64,
    pub exceptions_reported: u64,
    pub corrupted_answers: u64,
    pub timeouts: u64,
    pub hardware_faults: u64,
}

/// The request being tracked to completion
#[derive(Debug, Clone, Copy, Default)]
struct Transaction {
    slave: u8,
    function: u8,
    start: u16,
    count: u16,
    #[cfg(feature = "data-packets")]
    packet_len: u8,
}

/// Modbus RTU master engine
pub struct MasterStack<L: SerialLink, C: Clock> {
    buf: AduBuffer,
    /// Sole cross-context variable; relaxed single-word loads and stores
    /// from the tick and the driver callbacks
    state: AtomicU8,
    txn: Transaction,
    rx_started_at: u64,
    response_timeout_ms: u64,
    link: L,
    clock: C,
    stats: MasterStats,
}

impl<L: SerialLink, C: Clock> MasterStack<L, C> {
    /// Build a master engine
    pub fn new(config: MasterConfig, link: L, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            buf: AduBuffer::new(),
            state: AtomicU8::new(MasterState::Standby as u8),
            txn: Transaction::default(),
            rx_started_at: 0,
            response_timeout_ms: config.response_timeout_ms,
            link,
            clock,
            stats: MasterStats::default(),
        })
    }

    /// Current engine state
    pub fn state(&self) -> MasterState {
        MasterState::from_raw(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: MasterState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Engine counters
    pub fn stats(&self) -> &MasterStats {
        &self.stats
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Raw frame storage for drivers that receive in place. Only valid to
    /// fill while the engine is in [`MasterState::WaitingAnswer`]; complete
    /// the reception with [`rx_done_in_place`](Self::rx_done_in_place).
    pub fn rx_storage(&mut self) -> &mut [u8; ADU_BUFFER_LEN] {
        self.buf.storage_mut()
    }

    // ------------------------------------------------------------------
    // Request API (main context)
    // ------------------------------------------------------------------

    /// Read a run of holding registers (function 0x03)
    pub fn read_holding_registers(&mut self, slave: u8, start: u16, count: u16) -> Result<()> {
        self.read_registers(FC_READ_HOLDING_REGISTERS, slave, start, count)
    }

    /// Read a run of input registers (function 0x04)
    pub fn read_input_registers(&mut self, slave: u8, start: u16, count: u16) -> Result<()> {
        self.read_registers(FC_READ_INPUT_REGISTERS, slave, start, count)
    }

    fn read_registers(&mut self, function: u8, slave: u8, start: u16, count: u16) -> Result<()> {
        self.ensure_standby()?;
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(RtuError::invalid_request(format!(
                "register count {} outside 1..={}",
                count, MAX_READ_REGISTERS
            )));
        }

        self.txn = Transaction {
            slave,
            function,
            start,
            count,
            ..Default::default()
        };
        self.buf.clear();
        self.buf.push(slave)?;
        self.buf.push(function)?;
        self.buf.push_u16(start)?;
        self.buf.push_u16(count)?;
        self.dispatch()
    }

    /// Write a run of holding registers (function 0x10)
    pub fn write_registers(&mut self, slave: u8, start: u16, values: &[u16]) -> Result<()> {
        self.ensure_standby()?;
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(RtuError::invalid_request(format!(
                "register count {} outside 1..={}",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }

        let count = values.len() as u16;
        self.txn = Transaction {
            slave,
            function: FC_WRITE_MULTIPLE_REGISTERS,
            start,
            count,
            ..Default::default()
        };
        self.buf.clear();
        self.buf.push(slave)?;
        self.buf.push(FC_WRITE_MULTIPLE_REGISTERS)?;
        self.buf.push_u16(start)?;
        self.buf.push_u16(count)?;
        self.buf.push((count * 2) as u8)?;
        for &value in values {
            self.buf.push_u16(value)?;
        }
        self.dispatch()
    }

    /// Fetch the slave's data packet (function 0x64)
    #[cfg(feature = "data-packets")]
    pub fn read_packet(&mut self, slave: u8) -> Result<()> {
        self.ensure_standby()?;

        self.txn = Transaction {
            slave,
            function: FC_READ_DATA_PACKET,
            ..Default::default()
        };
        self.buf.clear();
        self.buf.push(slave)?;
        self.buf.push(FC_READ_DATA_PACKET)?;
        self.dispatch()
    }

    /// Deliver a data packet to the slave (function 0x65)
    #[cfg(feature = "data-packets")]
    pub fn write_packet(&mut self, slave: u8, data: &[u8]) -> Result<()> {
        self.ensure_standby()?;
        if data.len() > MAX_PACKET_LEN {
            return Err(RtuError::invalid_request(format!(
                "packet length {} exceeds {}",
                data.len(),
                MAX_PACKET_LEN
            )));
        }

        self.txn = Transaction {
            slave,
            function: FC_WRITE_DATA_PACKET,
            packet_len: data.len() as u8,
            ..Default::default()
        };
        self.buf.clear();
        self.buf.push(slave)?;
        self.buf.push(FC_WRITE_DATA_PACKET)?;
        self.buf.push(data.len() as u8)?;
        self.buf.extend(data)?;
        self.dispatch()
    }

    fn ensure_standby(&self) -> Result<()> {
        let state = self.state();
        if state != MasterState::Standby {
            return Err(RtuError::busy(format!(
                "transaction in flight (state {:?})",
                state
            )));
        }
        Ok(())
    }

    /// Seal and transmit the built request. A driver refusal parks the
    /// engine in the hardware-fault terminal; the call itself succeeds.
    fn dispatch(&mut self) -> Result<()> {
        self.buf.seal()?;
        debug!(
            "Sending request: slave={}, FC={:02X}, frame={}",
            self.txn.slave,
            self.txn.function,
            hex::encode(self.buf.as_slice())
        );
        self.stats.requests_sent += 1;
        self.set_state(MasterState::Transmitting);
        if let Err(e) = self.link.send(self.buf.as_slice()) {
            error!("Request transmission failed: {}", e);
            self.set_state(MasterState::HwError);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Driver completion events (interrupt context)
    // ------------------------------------------------------------------

    /// Request transmission complete; arms the receiver and starts the
    /// answer timeout
    pub fn tx_done(&mut self) {
        if self.state() != MasterState::Transmitting {
            return;
        }
        self.rx_started_at = self.clock.now_ms();
        self.set_state(MasterState::WaitingAnswer);
        if self.link.arm_receive().is_err() {
            self.set_state(MasterState::HwError);
        }
    }

    /// Reception complete; copies the frame unless the driver already
    /// deposited it via [`rx_storage`](Self::rx_storage)
    pub fn rx_done(&mut self, frame: &[u8]) {
        if self.state() != MasterState::WaitingAnswer {
            return;
        }
        if frame.is_empty() || frame.len() > ADU_BUFFER_LEN || self.buf.load(frame).is_err() {
            self.set_state(MasterState::Corrupted);
            return;
        }
        self.set_state(MasterState::Received);
    }

    /// Reception complete, frame already in the engine buffer (zero-copy)
    pub fn rx_done_in_place(&mut self, len: usize) {
        if self.state() != MasterState::WaitingAnswer {
            return;
        }
        if len == 0 || len > ADU_BUFFER_LEN || self.buf.set_len(len).is_err() {
            self.set_state(MasterState::Corrupted);
            return;
        }
        self.set_state(MasterState::Received);
    }

    /// Framing or overrun error while waiting for the answer
    pub fn rx_error(&mut self) {
        if self.state() == MasterState::WaitingAnswer {
            self.set_state(MasterState::Corrupted);
        }
    }

    // ------------------------------------------------------------------
    // Cooperative tick (main context)
    // ------------------------------------------------------------------

    /// Advance the engine. Returns `None` while idle or in progress, and
    /// the transaction outcome exactly once when it terminates; the engine
    /// is back in standby when `Some` is returned.
    pub fn poll(&mut self) -> Option<MasterOutcome> {
        match self.state() {
            MasterState::Standby | MasterState::Transmitting => None,
            MasterState::WaitingAnswer => {
                let waited = self.clock.now_ms().saturating_sub(self.rx_started_at);
                if waited > self.response_timeout_ms {
                    warn!(
                        "Answer timeout: slave={}, waited {} ms",
                        self.txn.slave, waited
                    );
                    Some(self.report(MasterState::TimedOut, MasterOutcome::TimedOut))
                } else {
                    None
                }
            }
            MasterState::Received => {
                self.set_state(MasterState::Processing);
                let outcome = self.parse_answer();
                let terminal = match &outcome {
                    MasterOutcome::Processed(_) => MasterState::Processed,
                    MasterOutcome::ExceptionReported(_) => MasterState::ErrReported,
                    _ => MasterState::Corrupted,
                };
                Some(self.report(terminal, outcome))
            }
            MasterState::Corrupted => {
                Some(self.report(MasterState::Corrupted, MasterOutcome::Corrupted))
            }
            MasterState::HwError => {
                Some(self.report(MasterState::HwError, MasterOutcome::HardwareFault))
            }
            // Terminal states are consumed on the tick that produces them;
            // anything still here is stale and quietly cleared
            _ => {
                self.set_state(MasterState::Standby);
                None
            }
        }
    }

    /// Record a terminal state, count it, and reset to standby
    fn report(&mut self, terminal: MasterState, outcome: MasterOutcome) -> MasterOutcome {
        self.set_state(terminal);
        match &outcome {
            MasterOutcome::Processed(_) => self.stats.responses_processed += 1,
            MasterOutcome::ExceptionReported(_) => self.stats.exceptions_reported += 1,
            MasterOutcome::Corrupted => self.stats.corrupted_answers += 1,
            MasterOutcome::TimedOut => self.stats.timeouts += 1,
            MasterOutcome::HardwareFault => self.stats.hardware_faults += 1,
        }
        self.set_state(MasterState::Standby);
        outcome
    }

    fn corrupted(&self, why: &str) -> MasterOutcome {
        warn!(
            "Answer rejected ({}): slave={}, FC={:02X}, frame={}",
            why,
            self.txn.slave,
            self.txn.function,
            hex::encode(self.buf.as_slice())
        );
        MasterOutcome::Corrupted
    }

    fn parse_answer(&mut self) -> MasterOutcome {
        let len = self.buf.len();
        debug!("Parsing answer: {}", hex::encode(self.buf.as_slice()));

        if len < MIN_ADU_LEN || len > MAX_ADU_LEN {
            return self.corrupted("length outside legal ADU bounds");
        }
        if self.buf.as_slice()[0] != self.txn.slave {
            return self.corrupted("answer from unexpected station");
        }
        if !self.buf.verify_crc() {
            return self.corrupted("CRC mismatch");
        }

        let function = self.buf.as_slice()[1];
        if function & !EXCEPTION_FLAG != self.txn.function {
            return self.corrupted("function code mismatch");
        }

        let body = self.buf.pdu_body();
        if function & EXCEPTION_FLAG != 0 {
            return match body {
                [code] => {
                    debug!("Peer reported exception code {:02X}", code);
                    MasterOutcome::ExceptionReported(*code)
                }
                _ => self.corrupted("malformed exception answer"),
            };
        }

        match self.txn.function {
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => self.parse_registers_answer(),
            FC_WRITE_MULTIPLE_REGISTERS => self.parse_write_echo(),
            #[cfg(feature = "data-packets")]
            FC_READ_DATA_PACKET => self.parse_packet_answer(),
            #[cfg(feature = "data-packets")]
            FC_WRITE_DATA_PACKET => self.parse_packet_echo(),
            _ => self.corrupted("unsupported function in transaction record"),
        }
    }

    fn parse_registers_answer(&mut self) -> MasterOutcome {
        let body = self.buf.pdu_body();
        let expected = 2 * self.txn.count as usize;
        if body.len() != 1 + expected || usize::from(body[0]) != expected {
            return self.corrupted("byte count does not match request");
        }

        let mut values = RegisterValues {
            values: [0; MAX_READ_REGISTERS as usize],
            count: self.txn.count as usize,
        };
        for (i, pair) in body[1..].chunks_exact(2).enumerate() {
            values.values[i] = u16::from_be_bytes([pair[0], pair[1]]);
        }
        MasterOutcome::Processed(Response::Registers(values))
    }

    fn parse_write_echo(&mut self) -> MasterOutcome {
        let body = self.buf.pdu_body();
        if body.len() != 4 {
            return self.corrupted("write echo has wrong length");
        }
        let start = u16::from_be_bytes([body[0], body[1]]);
        let count = u16::from_be_bytes([body[2], body[3]]);
        // The function byte already matched; this is a safety echo
        if start != self.txn.start || count != self.txn.count {
            return self.corrupted("write echo does not match request");
        }
        MasterOutcome::Processed(Response::WriteConfirmed { start, count })
    }

    #[cfg(feature = "data-packets")]
    fn parse_packet_answer(&mut self) -> MasterOutcome {
        let body = self.buf.pdu_body();
        let Some((&declared, data)) = body.split_first() else {
            return self.corrupted("packet answer missing length byte");
        };
        if usize::from(declared) != data.len() {
            return self.corrupted("packet length byte does not match payload");
        }

        let mut packet = PacketBytes {
            data: [0; MAX_PACKET_LEN],
            len: data.len(),
        };
        packet.data[..data.len()].copy_from_slice(data);
        MasterOutcome::Processed(Response::Packet(packet))
    }

    #[cfg(feature = "data-packets")]
    fn parse_packet_echo(&mut self) -> MasterOutcome {
        let body = self.buf.pdu_body();
        if body.len() != 1 || body[0] != self.txn.packet_len {
            return self.corrupted("packet echo does not match request");
        }
        MasterOutcome::Processed(Response::PacketWritten { len: body[0] })
    }
}
