//! Host frame buffer and CRC.
//!
//! One fixed-capacity buffer is reused for the whole lifecycle of a frame:
//! filled byte-by-byte during reception, consumed by the dispatcher,
//! rewritten in place as the response and transmitted. No per-frame
//! allocation happens anywhere on this path.
//!
//! Wire layout: `[START][SEQ u16 LE][LEN u32 LE][TOKEN][BODY..][CRC u16 LE]`
//! where LEN counts the body only and the CRC covers every byte from START
//! through the body. A received frame is valid iff running the CRC over all
//! bytes including the two CRC bytes reduces to zero.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{CRC_SIZE, HEADER_SIZE, MAX_BODY_SIZE, MESSAGE_START, TOKEN};

/// Full buffer capacity: header, largest body, CRC.
pub const FRAME_CAPACITY: usize = HEADER_SIZE + MAX_BODY_SIZE + CRC_SIZE;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("token byte mismatch: got 0x{got:02X}")]
    BadToken { got: u8 },

    #[error("declared body length {declared} exceeds capacity {max}", max = MAX_BODY_SIZE)]
    Oversize { declared: u32 },

    #[error("CRC residue 0x{residue:04X}, expected zero")]
    BadCrc { residue: u16 },
}

/// One step of CRC-16/CCITT (reflected polynomial, as used on the host wire).
pub fn crc16_update(crc: u16, data: u8) -> u16 {
    let data = data ^ (crc as u8);
    let data = data ^ (data << 4);
    ((data as u16) << 8 | (crc >> 8)) ^ ((data as u16) >> 4) ^ ((data as u16) << 3)
}

/// CRC-16/CCITT over a byte slice, initial value all-ones.
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(!0u16, |crc, &b| crc16_update(crc, b))
}

/// Reusable host frame with bounds-checked field access.
pub struct Frame {
    buf: [u8; FRAME_CAPACITY],
    body_len: usize,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    pub fn new() -> Self {
        let mut buf = [0u8; FRAME_CAPACITY];
        buf[0] = MESSAGE_START;
        buf[7] = TOKEN;
        Self { buf, body_len: 0 }
    }

    /// Raw storage, for byte-by-byte reception.
    pub(crate) fn raw_mut(&mut self) -> &mut [u8; FRAME_CAPACITY] {
        &mut self.buf
    }

    pub fn sequence(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[1..3])
    }

    pub fn set_sequence(&mut self, seq: u16) {
        LittleEndian::write_u16(&mut self.buf[1..3], seq);
    }

    /// Body length as declared in the received header. Must be validated
    /// against [`MAX_BODY_SIZE`] before any body byte is read.
    pub fn declared_len(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[3..7])
    }

    pub fn token(&self) -> u8 {
        self.buf[7]
    }

    /// Validates the header fields of a freshly received frame and commits
    /// the declared length as the body length.
    pub(crate) fn commit_header(&mut self) -> Result<(), FrameError> {
        if self.token() != TOKEN {
            return Err(FrameError::BadToken { got: self.token() });
        }
        let declared = self.declared_len();
        if declared as usize > MAX_BODY_SIZE {
            return Err(FrameError::Oversize { declared });
        }
        self.body_len = declared as usize;
        Ok(())
    }

    /// Verifies the CRC over the complete received frame (residue zero).
    pub(crate) fn check_crc(&self) -> Result<(), FrameError> {
        let total = HEADER_SIZE + self.body_len + CRC_SIZE;
        let residue = crc16(&self.buf[..total]);
        if residue != 0 {
            return Err(FrameError::BadCrc { residue });
        }
        Ok(())
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..HEADER_SIZE + self.body_len]
    }

    /// First body byte: the message id of a request, the response code of
    /// an answer.
    pub fn message_id(&self) -> u8 {
        if self.body_len == 0 { 0 } else { self.buf[HEADER_SIZE] }
    }

    /// Reads a u32 body field (byte offset within the body).
    pub fn body_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.buf[HEADER_SIZE + offset..HEADER_SIZE + offset + 4])
    }

    /// Replaces the body in place, becoming the response payload.
    pub fn set_body(&mut self, body: &[u8]) {
        debug_assert!(body.len() <= MAX_BODY_SIZE);
        self.buf[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(body);
        self.body_len = body.len();
    }

    /// Reserves a body of `len` bytes for in-place construction and returns
    /// it mutably. Byte 0 is the response code slot.
    pub fn body_for_write(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= MAX_BODY_SIZE);
        self.body_len = len;
        &mut self.buf[HEADER_SIZE..HEADER_SIZE + len]
    }

    /// Finalizes the frame for transmission: rewrites the marker bytes and
    /// length field, recomputes the CRC and returns the wire bytes.
    pub fn encode(&mut self) -> &[u8] {
        self.buf[0] = MESSAGE_START;
        self.buf[7] = TOKEN;
        LittleEndian::write_u32(&mut self.buf[3..7], self.body_len as u32);
        let end = HEADER_SIZE + self.body_len;
        let crc = crc16(&self.buf[..end]);
        LittleEndian::write_u16(&mut self.buf[end..end + 2], crc);
        &self.buf[..end + CRC_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut frame = Frame::new();
        frame.raw_mut()[..bytes.len()].copy_from_slice(bytes);
        frame.commit_header()?;
        frame.check_crc()?;
        Ok(frame)
    }

    #[test]
    fn encode_then_decode_roundtrip() {
        let mut frame = Frame::new();
        frame.set_sequence(0x1234);
        frame.set_body(&[0x01, 0xAA, 0x55]);
        let wire = frame.encode().to_vec();

        let decoded = received(&wire).unwrap();
        assert_eq!(decoded.sequence(), 0x1234);
        assert_eq!(decoded.body(), &[0x01, 0xAA, 0x55]);
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let mut frame = Frame::new();
        frame.set_sequence(7);
        frame.set_body(&[0x05, 0xB0, 4, 0, 0, 0, 0, 0x40, 0, 0]);
        let wire = frame.encode().to_vec();

        for bit in 0..wire.len() * 8 {
            let mut corrupt = wire.clone();
            corrupt[bit / 8] ^= 1 << (bit % 8);
            assert!(
                received(&corrupt).is_err(),
                "flip of bit {bit} went undetected"
            );
        }
    }

    #[test]
    fn oversize_length_rejected_before_body_access() {
        let mut frame = Frame::new();
        frame.set_body(&[0x01]);
        let mut wire = frame.encode().to_vec();
        wire[3..7].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            received(&wire),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn token_mismatch_rejected() {
        let mut frame = Frame::new();
        frame.set_body(&[0x01]);
        let mut wire = frame.encode().to_vec();
        wire[7] = 0x00;
        assert!(matches!(
            received(&wire),
            Err(FrameError::BadToken { got: 0x00 })
        ));
    }

    #[test]
    fn crc_residue_is_zero_over_full_frame() {
        let mut frame = Frame::new();
        frame.set_body(&[0x0F]);
        let wire = frame.encode();
        assert_eq!(crc16(wire), 0);
    }
}
