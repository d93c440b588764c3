//! UPDI-Core: serial programmer bridge between a debug host and a
//! single-wire target device.
//!
//! The bridge speaks the framed serial debug protocol on one side and the
//! target's single-wire interface on the other, translating host memory
//! and erase commands into on-wire programming sequences.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Host frame format, CRC, command constants
//! - **Transport**: Wire abstractions for both links (serial, mock)
//! - **Supervisor**: Deadline and cancellation supervision
//! - **Link**: Single-wire device link, attach and key sequences
//! - **Nvm**: Memory engine and per-generation controller dialects
//! - **Host**: Frame reception and command dispatch
//! - **Bridge**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use updi_core::{Bridge, BridgeConfig};
//! use updi_core::transport::mock::{MockClock, MockEdge, MockHostPort, MockPins, MockTarget};
//!
//! let config = BridgeConfig::default();
//! let mut bridge = Bridge::new(
//!     Box::new(MockHostPort::new()),
//!     Box::new(MockTarget::new()),
//!     Box::new(MockPins::new()),
//!     Arc::new(MockClock::new()),
//!     Arc::new(MockEdge::new()),
//!     config,
//! );
//! bridge.run().expect("bridge failed");
//! ```

pub mod bridge;
pub mod config;
pub mod host;
pub mod link;
pub mod nvm;
pub mod protocol;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use bridge::{Bridge, LoopEvent};
pub use config::{BridgeConfig, ConfigError};
pub use host::{Dispatcher, Framer, HostError, SessionState};
pub use link::{LinkError, LinkState, LinkTuning, UpdiLink};
pub use nvm::{dialect_for, NvmDialect, NvmError};
pub use protocol::{crc16, Frame, FrameError};
pub use supervisor::{Cancelled, Supervisor};
pub use transport::{Clock, ControlLines, EdgeSignal, HostPort, TargetPort, WireError};
