//! Deadline and cancellation supervision.
//!
//! Long operations on either wire run under a single armed deadline and an
//! external cancel signal. Engines call [`Supervisor::checkpoint`] inside
//! their wait loops; a fired deadline or a latched edge surfaces as
//! `Err(Cancelled)` and unwinds through the normal `?` chain back to the
//! frame that armed the slot, which then cleans up the session state.

use std::sync::Arc;
use thiserror::Error;

use crate::transport::{Clock, EdgeSignal};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    #[error("deadline of {budget} ticks expired")]
    Timeout { budget: u32 },

    #[error("external cancel signal")]
    ExternalSignal,
}

/// Single-slot deadline plus edge watch. One tick is one millisecond of
/// the supplied clock.
pub struct Supervisor {
    clock: Arc<dyn Clock>,
    edge: Arc<dyn EdgeSignal>,
    deadline: Option<Deadline>,
    edge_watch: bool,
}

struct Deadline {
    expires_at: u64,
    budget: u32,
}

impl Supervisor {
    pub fn new(clock: Arc<dyn Clock>, edge: Arc<dyn EdgeSignal>) -> Self {
        Self {
            clock,
            edge,
            deadline: None,
            edge_watch: false,
        }
    }

    /// Arm the deadline slot. The first checkpoint at or past `ticks`
    /// milliseconds after arming fails.
    pub fn arm(&mut self, ticks: u32) {
        self.deadline = Some(Deadline {
            expires_at: self.clock.millis() + ticks as u64,
            budget: ticks,
        });
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Start honoring the external cancel signal. Any edge latched while
    /// the watch was off is discarded first.
    pub fn arm_edge(&mut self) {
        self.edge.take();
        self.edge_watch = true;
    }

    pub fn disarm_edge(&mut self) {
        self.edge_watch = false;
    }

    /// The cancellation probe every wait loop runs. The edge is checked
    /// before the deadline so an explicit cancel wins the race.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.edge_watch && self.edge.take() {
            return Err(Cancelled::ExternalSignal);
        }
        if let Some(deadline) = &self.deadline {
            if self.clock.millis() >= deadline.expires_at {
                return Err(Cancelled::Timeout {
                    budget: deadline.budget,
                });
            }
        }
        Ok(())
    }

    /// Checkpoint, then sleep the shared 50 microsecond poll interval.
    /// Keeps every busy-wait in the crate on one polling policy.
    pub fn poll_pause(&self) -> Result<(), Cancelled> {
        self.checkpoint()?;
        self.clock.delay_us(50);
        Ok(())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
