//! Serial-port and board-level implementations of the core wire traits.
//!
//! The host side is a plain framed serial link, optionally driving an
//! RS-485 style direction pin through RTS. The target side is a USB
//! serial adapter wired for single-wire half-duplex, so every
//! transmitted byte echoes back on the receive pin; the adapter's own
//! transceiver handles line direction. Board control lines map onto the
//! modem control outputs of a cloned target port handle.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, trace};
use updi_core::{Clock, ControlLines, EdgeSignal, HostPort, TargetPort, WireError};

/// Poll granularity for the non-blocking single-byte reads.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

fn open(path: &str, baud: u32) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(path, baud)
        .timeout(READ_TIMEOUT)
        .open()
}

fn io_err(err: serialport::Error) -> WireError {
    WireError::Io(err.into())
}

/// Non-blocking read of one byte from a serial handle.
fn poll_byte(port: &mut Box<dyn SerialPort>) -> Result<Option<u8>, WireError> {
    let mut byte = [0u8; 1];
    match port.read(&mut byte) {
        Ok(0) => Err(WireError::Closed),
        Ok(_) => Ok(Some(byte[0])),
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(WireError::Io(err)),
    }
}

// ----------------------------------------------------------------------------
// Host side
// ----------------------------------------------------------------------------

pub struct SerialHostPort {
    port: Box<dyn SerialPort>,
}

impl SerialHostPort {
    pub fn open(path: &str, baud: u32) -> serialport::Result<Self> {
        let port = open(path, baud)?;
        Ok(Self { port })
    }
}

impl HostPort for SerialHostPort {
    fn get(&mut self) -> Result<Option<u8>, WireError> {
        poll_byte(&mut self.port)
    }

    fn put(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WireError> {
        self.port.flush()?;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), WireError> {
        self.port.set_baud_rate(baud).map_err(io_err)
    }

    fn tx_enable(&mut self) -> Result<(), WireError> {
        self.port.write_request_to_send(true).map_err(io_err)
    }

    fn tx_disable(&mut self) -> Result<(), WireError> {
        self.port.write_request_to_send(false).map_err(io_err)
    }
}

// ----------------------------------------------------------------------------
// Target side
// ----------------------------------------------------------------------------

pub struct SerialTargetPort {
    port: Box<dyn SerialPort>,
}

impl SerialTargetPort {
    pub fn open(path: &str, baud: u32) -> serialport::Result<Self> {
        let port = open(path, baud)?;
        Ok(Self { port })
    }

    /// Second handle to the same adapter, for the modem control lines.
    pub fn control_handle(&self) -> serialport::Result<SerialControlLines> {
        Ok(SerialControlLines {
            port: self.port.try_clone()?,
        })
    }
}

impl TargetPort for SerialTargetPort {
    fn send(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<u8>, WireError> {
        poll_byte(&mut self.port)
    }

    fn send_break(&mut self, long: bool) -> Result<(), WireError> {
        let hold = if long {
            Duration::from_millis(90)
        } else {
            Duration::from_millis(25)
        };
        self.port.set_break().map_err(io_err)?;
        std::thread::sleep(hold);
        self.port.clear_break().map_err(io_err)?;
        // Line idles high for two frame times before the next sync.
        std::thread::sleep(Duration::from_millis(2));
        Ok(())
    }

    fn drain(&mut self) -> Result<(), WireError> {
        self.port.clear(ClearBuffer::Input).map_err(io_err)
    }
}

/// Control lines on a plain USB serial adapter: reset rides on DTR, the
/// high-voltage pulse hardware and the session indicator are absent.
pub struct SerialControlLines {
    port: Box<dyn SerialPort>,
}

impl ControlLines for SerialControlLines {
    fn trst(&mut self, asserted: bool) -> Result<(), WireError> {
        self.port.write_data_terminal_ready(asserted).map_err(io_err)
    }

    fn pgen(&mut self, on: bool) -> Result<(), WireError> {
        debug!(on, "programming session indicator");
        Ok(())
    }

    fn hvp(&mut self, on: bool) -> Result<(), WireError> {
        if on {
            debug!("high-voltage pulse requested, no pulse hardware on this adapter");
        }
        Ok(())
    }

    fn hven(&mut self, _on: bool) -> Result<(), WireError> {
        Ok(())
    }

    fn tdir_push(&mut self) -> Result<(), WireError> {
        // The adapter's transceiver drives the line by itself.
        Ok(())
    }

    fn tdir_pull(&mut self) -> Result<(), WireError> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Time and cancellation
// ----------------------------------------------------------------------------

/// Monotonic wall clock.
pub struct StdClock {
    start: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }

    fn delay_us(&self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

/// Cancel edge latched when the supervising process writes a line to our
/// stdin or closes it.
#[derive(Clone)]
pub struct StdinEdge {
    fired: Arc<AtomicBool>,
}

impl StdinEdge {
    /// Spawns the watcher thread and returns the shared latch.
    pub fn spawn() -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let latch = Arc::clone(&fired);
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = std::io::stdin().read_line(&mut buf);
            trace!("stdin closed or wrote, latching cancel");
            latch.store(true, Ordering::SeqCst);
        });
        Self { fired }
    }
}

impl EdgeSignal for StdinEdge {
    fn take(&self) -> bool {
        self.fired.swap(false, Ordering::SeqCst)
    }
}
