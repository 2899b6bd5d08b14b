//! RTU frame buffer and exception codes
//!
//! One `AduBuffer` holds the single in-flight ADU of an engine. It is a
//! fixed stack array sized one byte beyond the largest legal frame, so the
//! driver may DMA into it directly and a completely filled buffer is
//! unambiguously an overrun.

use tracing::debug;

use crate::constants::{ADU_BUFFER_LEN, CRC_LEN, MAX_ADU_LEN, MIN_ADU_LEN};
use crate::crc::crc16;
use crate::error::{Result, RtuError};

/// Fixed-capacity buffer for one Application Data Unit
///
/// Layout of a sealed frame: `address(1) | function(1) | payload | crc_lo | crc_hi`.
#[derive(Debug, Clone)]
pub struct AduBuffer {
    /// Fixed-size backing storage (stack)
    data: [u8; ADU_BUFFER_LEN],
    /// Actual frame length
    len: usize,
}

impl AduBuffer {
    /// Create an empty buffer
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; ADU_BUFFER_LEN],
            len: 0,
        }
    }

    /// Copy a received frame into the buffer
    pub fn load(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > ADU_BUFFER_LEN {
            return Err(RtuError::protocol(format!(
                "frame too large: {} bytes (max {})",
                frame.len(),
                ADU_BUFFER_LEN
            )));
        }
        self.data[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        Ok(())
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= ADU_BUFFER_LEN {
            return Err(RtuError::protocol("frame buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push a u16 in big-endian field order
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > ADU_BUFFER_LEN {
            return Err(RtuError::protocol(format!(
                "frame would exceed buffer: {} + {} > {}",
                self.len,
                data.len(),
                ADU_BUFFER_LEN
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Get the frame as a slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get the frame as a mutable slice
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Raw backing storage, for drivers that deposit frames in place.
    /// Pair with [`set_len`](Self::set_len) once the reception completes.
    #[inline]
    pub fn storage_mut(&mut self) -> &mut [u8; ADU_BUFFER_LEN] {
        &mut self.data
    }

    /// Declare how many bytes of the backing storage hold a frame
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > ADU_BUFFER_LEN {
            return Err(RtuError::protocol(format!(
                "frame length {} exceeds buffer capacity {}",
                len, ADU_BUFFER_LEN
            )));
        }
        self.len = len;
        Ok(())
    }

    /// Shorten the frame; no effect if `len` is not smaller
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Current frame length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clear the buffer
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Station address field (first byte)
    #[inline]
    pub fn address(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Function code field (second byte)
    #[inline]
    pub fn function(&self) -> Option<u8> {
        if self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Payload of a sealed frame: the bytes between the function code and
    /// the CRC trailer. Empty for frames shorter than the minimum ADU.
    #[inline]
    pub fn pdu_body(&self) -> &[u8] {
        if self.len >= MIN_ADU_LEN {
            &self.data[2..self.len - CRC_LEN]
        } else {
            &[]
        }
    }

    /// Append the CRC trailer, little-endian, over the current content
    pub fn seal(&mut self) -> Result<()> {
        if self.len < 2 {
            return Err(RtuError::protocol("cannot seal a headerless frame"));
        }
        if self.len > MAX_ADU_LEN - CRC_LEN {
            return Err(RtuError::protocol(format!(
                "frame too long to seal: {} bytes (max {})",
                self.len,
                MAX_ADU_LEN - CRC_LEN
            )));
        }

        let crc = crc16(self.as_slice());
        self.data[self.len] = (crc & 0xFF) as u8;
        self.data[self.len + 1] = (crc >> 8) as u8;
        self.len += CRC_LEN;

        debug!("Frame sealed: len={}, CRC={:04X}", self.len, crc);
        Ok(())
    }

    /// Check the CRC trailer of a received frame
    pub fn verify_crc(&self) -> bool {
        if self.len < MIN_ADU_LEN {
            return false;
        }
        let received = u16::from_le_bytes([self.data[self.len - 2], self.data[self.len - 1]]);
        let calculated = crc16(&self.data[..self.len - CRC_LEN]);
        received == calculated
    }
}

impl Default for AduBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Modbus exception codes (wire values fixed by the protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ExceptionCode {
    /// Parse a wire byte into a known exception code
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            _ => None,
        }
    }
}

/// Human-readable description of an exception byte, including codes this
/// stack never raises itself but a peer may report
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_basic_operations() {
        let mut buf = AduBuffer::new();
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());

        buf.push(0x01).unwrap();
        buf.push(0x03).unwrap();
        buf.push_u16(0x0010).unwrap();
        buf.push_u16(0x0002).unwrap();

        assert_eq!(buf.as_slice(), &[0x01, 0x03, 0x00, 0x10, 0x00, 0x02]);
        assert_eq!(buf.address(), Some(0x01));
        assert_eq!(buf.function(), Some(0x03));
    }

    #[test]
    fn test_buffer_push_until_full() {
        let mut buf = AduBuffer::new();
        for i in 0..ADU_BUFFER_LEN {
            buf.push(i as u8).unwrap();
        }
        assert_eq!(buf.len(), ADU_BUFFER_LEN);
        assert!(buf.push(0xFF).is_err());
    }

    #[test]
    fn test_buffer_extend_exceed_capacity_leaves_content() {
        let mut buf = AduBuffer::new();
        buf.extend(&[0x01, 0x02]).unwrap();

        let too_big = [0xFF; ADU_BUFFER_LEN];
        assert!(buf.extend(&too_big).is_err());
        assert_eq!(buf.as_slice(), &[0x01, 0x02]);
    }

    #[test]
    fn test_seal_appends_crc_little_endian() {
        let mut buf = AduBuffer::new();
        buf.extend(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
        buf.seal().unwrap();

        // Wire image from the protocol reference: CRC 0x0A84, low byte first
        assert_eq!(buf.as_slice(), &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert!(buf.verify_crc());
    }

    #[test]
    fn test_seal_refuses_headerless_and_oversized() {
        let mut buf = AduBuffer::new();
        buf.push(0x01).unwrap();
        assert!(buf.seal().is_err());

        let mut buf = AduBuffer::new();
        buf.extend(&[0u8; MAX_ADU_LEN - 1]).unwrap();
        assert!(buf.seal().is_err());

        // Exactly at the limit still seals
        let mut buf = AduBuffer::new();
        buf.extend(&[0u8; MAX_ADU_LEN - CRC_LEN]).unwrap();
        buf.seal().unwrap();
        assert_eq!(buf.len(), MAX_ADU_LEN);
    }

    #[test]
    fn test_verify_crc_rejects_flipped_byte() {
        let mut buf = AduBuffer::new();
        buf.extend(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
        buf.seal().unwrap();
        assert!(buf.verify_crc());

        let n = buf.len();
        buf.as_mut_slice()[n - 1] ^= 0x01;
        assert!(!buf.verify_crc());
    }

    #[test]
    fn test_verify_crc_short_frame() {
        let mut buf = AduBuffer::new();
        buf.extend(&[0x01, 0x03, 0x84]).unwrap();
        assert!(!buf.verify_crc());
    }

    #[test]
    fn test_pdu_body_bounds() {
        let mut buf = AduBuffer::new();
        assert!(buf.pdu_body().is_empty());

        buf.extend(&[0x01, 0x08, 0x00, 0x00, 0x12, 0x34]).unwrap();
        buf.seal().unwrap();
        assert_eq!(buf.pdu_body(), &[0x00, 0x00, 0x12, 0x34]);

        // Minimum frame has an empty body
        let mut buf = AduBuffer::new();
        buf.extend(&[0x01, 0x64]).unwrap();
        buf.seal().unwrap();
        assert!(buf.pdu_body().is_empty());
    }

    #[test]
    fn test_in_place_reception() {
        let mut buf = AduBuffer::new();
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        buf.storage_mut()[..frame.len()].copy_from_slice(&frame);
        buf.set_len(frame.len()).unwrap();

        assert_eq!(buf.as_slice(), &frame);
        assert!(buf.verify_crc());

        assert!(buf.set_len(ADU_BUFFER_LEN + 1).is_err());
    }

    #[test]
    fn test_exception_code_wire_values() {
        assert_eq!(ExceptionCode::IllegalFunction as u8, 0x01);
        assert_eq!(ExceptionCode::IllegalDataAddress as u8, 0x02);
        assert_eq!(ExceptionCode::IllegalDataValue as u8, 0x03);
        assert_eq!(ExceptionCode::ServerDeviceFailure as u8, 0x04);

        assert_eq!(ExceptionCode::from_wire(0x02), Some(ExceptionCode::IllegalDataAddress));
        assert_eq!(ExceptionCode::from_wire(0x7F), None);
    }

    #[test]
    fn test_exception_descriptions() {
        assert_eq!(exception_description(0x02), "Illegal Data Address");
        assert_eq!(exception_description(0x0B), "Gateway Target Device Failed to Respond");
        assert_eq!(exception_description(0xEE), "Unknown Exception");
    }
}
