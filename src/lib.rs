//! Modbus RTU Protocol Stack
//!
//! Two symmetric, callback-driven state machines for half-duplex serial
//! links (RS-485 and friends): a master that issues requests and parses
//! answers, and a slave that serves requests addressed to its station.
//! The crate owns the framing, CRC discipline, validation and dispatch;
//! the UART, timer, register store and transceiver direction toggle stay
//! behind traits supplied by the embedder.
//!
//! Supported function codes: 0x03/0x04 (read holding/input registers),
//! 0x10 (write multiple registers), 0x08 (diagnostic loopback), and the
//! vendor packet transfer pair 0x64/0x65 behind the `data-packets`
//! feature.
//!
//! # Architecture
//!
//! ```text
//! modbus_rtu
//!     ├── MasterStack (request FSM: build / transmit / await / validate)
//!     ├── SlaveStack  (serve FSM: receive / validate / dispatch / answer)
//!     ├── AduBuffer   (fixed 257-byte frame buffer, CRC seal/verify)
//!     ├── crc         (restartable Modbus CRC16)
//!     └── device      (SerialLink / SlaveDevice / Clock contracts)
//! ```
//!
//! Each engine is driven from two sides: a cooperative `poll()` called
//! from the main loop, and completion events (`tx_done`, `rx_done`,
//! `rx_error`) called from the driver's interrupt context. The event
//! side only moves the state word — parsing and device callbacks run
//! strictly in `poll()`.

mod config;
mod constants;
mod crc;
mod device;
mod error;
mod frame;
mod master;
mod slave;

// Re-export main types
pub use config::{MasterConfig, SlaveConfig};
pub use constants::{
    ADU_BUFFER_LEN, BROADCAST_ADDRESS, DEFAULT_RESPONSE_TIMEOUT_MS, MAX_ADU_LEN,
    MAX_READ_REGISTERS, MAX_UNICAST_ADDRESS, MAX_WRITE_REGISTERS, MIN_ADU_LEN,
};
#[cfg(feature = "data-packets")]
pub use constants::MAX_PACKET_LEN;
pub use crc::{crc16, crc16_with_seed, CRC_INITIAL};
pub use device::{Clock, SerialLink, SlaveDevice, SystemClock};
pub use error::{Result, RtuError};
pub use frame::{exception_description, AduBuffer, ExceptionCode};
pub use master::{
    MasterOutcome, MasterStack, MasterState, MasterStats, RegisterValues, Response,
};
#[cfg(feature = "data-packets")]
pub use master::PacketBytes;
pub use slave::{DiscardReason, SlaveOutcome, SlaveStack, SlaveState, SlaveStats};
