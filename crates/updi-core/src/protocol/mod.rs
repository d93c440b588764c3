//! Host-side framed protocol: constants, frame buffer, CRC.

pub mod constants;
pub mod frame;

pub use frame::{Frame, FrameError, crc16, crc16_update, FRAME_CAPACITY};
