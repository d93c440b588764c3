//! Wire abstractions.
//!
//! The bridge sits between two serial wires: the framed host link and the
//! single-wire half-duplex device link. Both are modeled as byte-granular
//! traits so the engines can be driven by real serial ports in the binary
//! and by in-memory mocks in tests. Board control lines and time are
//! abstracted for the same reason.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("port closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Framed serial link to the controlling host.
pub trait HostPort: Send {
    /// Non-blocking read of one byte. `None` means nothing pending.
    fn get(&mut self) -> Result<Option<u8>, WireError>;

    /// Write bytes (buffered until [`flush`](Self::flush)).
    fn put(&mut self, data: &[u8]) -> Result<(), WireError>;

    fn flush(&mut self) -> Result<(), WireError>;

    /// Reconfigure the line speed. Applied only after the confirming
    /// response has been flushed at the old speed.
    fn set_baud(&mut self, baud: u32) -> Result<(), WireError>;

    /// Enable the host-facing driver (session start).
    fn tx_enable(&mut self) -> Result<(), WireError>;

    /// Disable the host-facing driver (session teardown).
    fn tx_disable(&mut self) -> Result<(), WireError>;
}

/// Single-wire half-duplex link to the target device.
///
/// Every transmitted byte is echoed back by the shared wire; the link
/// engine reads the echo to verify the line was not driven by both ends
/// at once.
pub trait TargetPort: Send {
    fn send(&mut self, data: &[u8]) -> Result<(), WireError>;

    /// Non-blocking read of one byte (echo or device response).
    fn poll(&mut self) -> Result<Option<u8>, WireError>;

    /// Hold the line low long enough for the device to resynchronize.
    /// A `long` break also wakes a device in deep sleep.
    fn send_break(&mut self, long: bool) -> Result<(), WireError>;

    /// Discard anything pending in the receive direction.
    fn drain(&mut self) -> Result<(), WireError>;
}

/// Board control lines around the device link.
pub trait ControlLines: Send {
    /// Drive (or release) the dedicated reset line.
    fn trst(&mut self, asserted: bool) -> Result<(), WireError>;

    /// Programming-session indicator.
    fn pgen(&mut self, on: bool) -> Result<(), WireError>;

    /// High-voltage pulse generator on the reset pad.
    fn hvp(&mut self, on: bool) -> Result<(), WireError>;

    /// High-voltage charge pump supply.
    fn hven(&mut self, on: bool) -> Result<(), WireError>;

    /// Drive the data line push-pull (strong, for break and recovery).
    fn tdir_push(&mut self) -> Result<(), WireError>;

    /// Return the data line to open-drain with pull-up (normal operation).
    fn tdir_pull(&mut self) -> Result<(), WireError>;
}

/// Monotonic time source. One tick of every deadline in the crate is one
/// millisecond of this clock.
pub trait Clock: Send + Sync {
    fn millis(&self) -> u64;
    fn delay_ms(&self, ms: u32);
    fn delay_us(&self, us: u32);
}

/// Latched external cancel request (front-panel switch, supervising
/// process). `take` consumes the pending edge.
pub trait EdgeSignal: Send + Sync {
    fn take(&self) -> bool;
}
