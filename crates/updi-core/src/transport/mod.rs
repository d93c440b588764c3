//! Wire traits and test doubles.

pub mod mock;
pub mod traits;

pub use traits::{Clock, ControlLines, EdgeSignal, HostPort, TargetPort, WireError};
