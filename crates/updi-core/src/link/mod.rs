//! Single-wire device link engine.
//!
//! Implements the half-duplex instruction protocol on top of a
//! [`TargetPort`]: loopback-verified transmission, data-space and
//! register access primitives, and the session choreography (attach,
//! programming keys, chip erase, user-row write, detach). Every wait
//! loop runs under the caller's [`Supervisor`] deadline.

pub mod constants;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::supervisor::{Cancelled, Supervisor};
use crate::transport::{Clock, ControlLines, TargetPort, WireError};
use constants::*;

/// Per-attempt budget for one attach try, in ticks.
const ATTACH_ATTEMPT_TICKS: u32 = 100;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("bus collision: sent 0x{sent:02X}, heard 0x{heard:02X}")]
    Collision { sent: u8, heard: u8 },

    #[error("missing acknowledge: got 0x{got:02X}")]
    NoAck { got: u8 },

    #[error("repeat count {len} not in 1..=256")]
    BadRepeat { len: usize },

    #[error("device information block not recognized")]
    NoInterface,

    #[error("device is locked")]
    Locked,
}

impl LinkError {
    pub fn cancelled(&self) -> Option<Cancelled> {
        match self {
            LinkError::Cancelled(c) => Some(*c),
            _ => None,
        }
    }
}

/// Session flags and identity gathered at attach time.
#[derive(Debug, Default, Clone)]
pub struct LinkState {
    /// A device answered the information block request.
    pub active: bool,
    /// Programming mode granted (key accepted and reset cycled).
    pub prog_enabled: bool,
    /// A chip erase ran in this session, so flash is known blank.
    pub chip_erased: bool,
    /// The high-voltage recovery pulse was used to reach the device.
    pub hv_used: bool,
    /// A loopback mismatch or missing acknowledge happened this session.
    pub fault: bool,
    /// A supervised wait expired mid-operation.
    pub timed_out: bool,
    /// The unexpected byte behind the latest fault (diagnostic).
    pub last_status: u8,
    /// Latest byte received from the device (diagnostic).
    pub last_data: u8,
    /// Programming interface version character from the information
    /// block (`b'0'`, `b'2'`, `b'3'`).
    pub nvm_version: Option<u8>,
    /// Synthesized three-byte device signature.
    pub signature: [u8; 3],
}

impl LinkState {
    /// Diagnostic flag byte carried in status responses.
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.active {
            flags |= 0x01;
        }
        if self.prog_enabled {
            flags |= 0x02;
        }
        if self.chip_erased {
            flags |= 0x04;
        }
        if self.hv_used {
            flags |= 0x08;
        }
        if self.timed_out {
            flags |= 0x40;
        }
        if self.fault {
            flags |= 0x80;
        }
        flags
    }
}

/// Timing knobs for attach and high-voltage recovery.
#[derive(Debug, Clone, Copy)]
pub struct LinkTuning {
    pub attach_attempts: u8,
    pub hv_settle_ms: u32,
    pub hv_pulse_us: u32,
}

impl Default for LinkTuning {
    fn default() -> Self {
        Self {
            attach_attempts: 3,
            hv_settle_ms: 0,
            hv_pulse_us: 800,
        }
    }
}

pub struct UpdiLink {
    port: Box<dyn TargetPort>,
    pins: Box<dyn ControlLines>,
    clock: Arc<dyn Clock>,
    tuning: LinkTuning,
    pub state: LinkState,
}

impl UpdiLink {
    pub fn new(
        port: Box<dyn TargetPort>,
        pins: Box<dyn ControlLines>,
        clock: Arc<dyn Clock>,
        tuning: LinkTuning,
    ) -> Self {
        Self {
            port,
            pins,
            clock,
            tuning,
            state: LinkState::default(),
        }
    }

    // ------------------------------------------------------------------
    // Byte primitives
    // ------------------------------------------------------------------

    /// Blocking receive under the armed deadline.
    pub(crate) fn recv(&mut self, sup: &Supervisor) -> Result<u8, LinkError> {
        loop {
            if let Some(byte) = self.port.poll()? {
                self.state.last_data = byte;
                return Ok(byte);
            }
            self.pause(sup)?;
        }
    }

    /// One checkpointed poll step. An expired deadline latches the fault
    /// and timeout flags before the cancellation propagates.
    fn pause(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        sup.poll_pause().map_err(|cancel| {
            if matches!(cancel, Cancelled::Timeout { .. }) {
                self.state.fault = true;
                self.state.timed_out = true;
            }
            cancel.into()
        })
    }

    /// Transmit one byte and verify its echo. The wire is shared, so a
    /// mismatched echo means both ends drove it at once.
    pub(crate) fn send(&mut self, sup: &Supervisor, byte: u8) -> Result<(), LinkError> {
        self.port.send(&[byte])?;
        let heard = self.recv(sup)?;
        if heard != byte {
            self.state.fault = true;
            self.state.last_status = heard;
            return Err(LinkError::Collision { sent: byte, heard });
        }
        Ok(())
    }

    pub(crate) fn send_bytes(&mut self, sup: &Supervisor, data: &[u8]) -> Result<(), LinkError> {
        for &byte in data {
            self.send(sup, byte)?;
        }
        Ok(())
    }

    pub(crate) fn recv_ack(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        let got = self.recv(sup)?;
        if got != ACK {
            self.state.fault = true;
            self.state.last_status = got;
            return Err(LinkError::NoAck { got });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instruction primitives
    // ------------------------------------------------------------------

    /// Register read (LDCS).
    pub(crate) fn ldcs(&mut self, sup: &Supervisor, reg: u8) -> Result<u8, LinkError> {
        self.send_bytes(sup, &[SYNCH, OP_LDCS | reg])?;
        self.recv(sup)
    }

    /// Register write (STCS). Not acknowledged by the device.
    pub(crate) fn stcs(&mut self, sup: &Supervisor, reg: u8, value: u8) -> Result<(), LinkError> {
        self.send_bytes(sup, &[SYNCH, OP_STCS | reg, value])
    }

    /// Direct data-space byte load. A framing failure gets one break
    /// retrain before the load is retried.
    pub(crate) fn ld8(&mut self, sup: &Supervisor, addr: u32) -> Result<u8, LinkError> {
        let a = addr.to_le_bytes();
        let framing = [SYNCH, OP_LDS | ADDR3 | DATA1, a[0], a[1], a[2]];
        if let Err(err) = self.send_bytes(sup, &framing) {
            if err.cancelled().is_some() {
                return Err(err);
            }
            trace!(%err, "load framing failed, retraining");
            self.recover();
            self.send_bytes(sup, &framing)?;
        }
        self.recv(sup)
    }

    /// Direct data-space byte store. Address and data phases are each
    /// acknowledged.
    pub(crate) fn st8(&mut self, sup: &Supervisor, addr: u32, data: u8) -> Result<(), LinkError> {
        let a = addr.to_le_bytes();
        self.send_bytes(sup, &[SYNCH, OP_STS | ADDR3 | DATA1, a[0], a[1], a[2]])?;
        self.recv_ack(sup)?;
        self.send(sup, data)?;
        self.recv_ack(sup)
    }

    /// Set the device pointer to `addr` and announce a repeated
    /// pointer-indirect instruction for `len` units of `op`.
    pub(crate) fn send_repeat_header(
        &mut self,
        sup: &Supervisor,
        op: u8,
        addr: u32,
        len: usize,
    ) -> Result<(), LinkError> {
        if !(1..=256).contains(&len) {
            return Err(LinkError::BadRepeat { len });
        }
        let a = addr.to_le_bytes();
        self.send_bytes(sup, &[SYNCH, OP_ST | PTR_REG | DATA3, a[0], a[1], a[2]])?;
        self.recv_ack(sup)?;
        self.send_bytes(
            sup,
            &[SYNCH, OP_REPEAT | DATA1, (len - 1) as u8, SYNCH, PTR_INC | op],
        )
    }

    /// Repeated acknowledged byte store through the pointer.
    pub(crate) fn sts8(&mut self, sup: &Supervisor, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        self.send_repeat_header(sup, OP_ST | DATA1, addr, data.len())?;
        for &byte in data {
            self.send(sup, byte)?;
            self.recv_ack(sup)?;
        }
        Ok(())
    }

    /// Hold or release the device reset request.
    pub(crate) fn reset(&mut self, sup: &Supervisor, hold: bool) -> Result<(), LinkError> {
        self.stcs(sup, CS_ASI_RESET_REQ, if hold { RSTREQ_MAGIC } else { 0x00 })
    }

    fn is_sys_stat(&mut self, sup: &Supervisor, mask: u8) -> Result<bool, LinkError> {
        Ok(self.ldcs(sup, CS_ASI_SYS_STATUS)? & mask == mask)
    }

    fn is_key_stat(&mut self, sup: &Supervisor, mask: u8) -> Result<bool, LinkError> {
        Ok(self.ldcs(sup, CS_ASI_KEY_STATUS)? & mask == mask)
    }

    fn wait_sys_clear(&mut self, sup: &Supervisor, mask: u8) -> Result<(), LinkError> {
        while self.is_sys_stat(sup, mask)? {
            self.pause(sup)?;
        }
        Ok(())
    }

    fn wait_sys_set(&mut self, sup: &Supervisor, mask: u8) -> Result<(), LinkError> {
        while !self.is_sys_stat(sup, mask)? {
            self.pause(sup)?;
        }
        Ok(())
    }

    fn wait_key_clear(&mut self, sup: &Supervisor, mask: u8) -> Result<(), LinkError> {
        while self.is_key_stat(sup, mask)? {
            self.pause(sup)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session choreography
    // ------------------------------------------------------------------

    /// Request the information block and bind the session identity.
    fn read_device_info(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        self.stcs(sup, CS_CTRLA, CTRLA_GTVAL_2)?;
        self.send_bytes(sup, &[SYNCH, SIB_256])?;
        let mut sib = [0u8; 32];
        for slot in sib.iter_mut() {
            *slot = self.recv(sup)?;
        }
        if sib[9] != b':' {
            return Err(LinkError::NoInterface);
        }
        self.state.signature = [
            0x1E,
            if sib[0] == b' ' { sib[4] } else { sib[0] },
            sib[10],
        ];
        self.state.nvm_version = Some(sib[10]);
        self.state.active = true;
        debug!(
            version = %(sib[10] as char),
            sib = %String::from_utf8_lossy(&sib),
            "device attached"
        );
        Ok(())
    }

    fn attach_once(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        self.pins.trst(true)?;
        self.clock.delay_us(250);
        self.pins.trst(false)?;
        self.clock.delay_us(800);
        self.port.send_break(true)?;
        self.port.drain()?;
        self.read_device_info(sup)
    }

    /// Bring the link up: reset pulse, wake break, identity read. Retried
    /// a configured number of times, each try under its own deadline.
    pub fn enter_link(&mut self, sup: &mut Supervisor) -> Result<(), LinkError> {
        self.state = LinkState::default();
        self.pins.tdir_pull()?;
        self.pins.pgen(true)?;

        let mut last = LinkError::NoInterface;
        for attempt in 1..=self.tuning.attach_attempts {
            sup.arm(ATTACH_ATTEMPT_TICKS);
            match self.attach_once(sup) {
                Ok(()) => {
                    sup.disarm();
                    return Ok(());
                }
                Err(err) => {
                    if let Some(Cancelled::ExternalSignal) = err.cancelled() {
                        sup.disarm();
                        return Err(err);
                    }
                    trace!(attempt, %err, "attach attempt failed");
                    last = err;
                }
            }
        }
        sup.disarm();
        warn!(%last, "device attach failed");
        Err(last)
    }

    /// High-voltage recovery pulse on the reset pad, then a wake break.
    /// Used when the pad is fused for another function and the plain
    /// attach cannot reach the interface.
    fn hv_break(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        debug!("high-voltage recovery pulse");
        self.pins.trst(true)?;
        self.pins.hvp(true)?;
        if self.tuning.hv_settle_ms > 0 {
            self.clock.delay_ms(self.tuning.hv_settle_ms);
        }
        self.pins.trst(false)?;
        self.port.send_break(false)?;
        self.clock.delay_us(5);
        self.pins.hven(true)?;
        self.clock.delay_us(self.tuning.hv_pulse_us);
        self.pins.hven(false)?;
        self.pins.hvp(false)?;
        self.clock.delay_us(5);
        self.send(sup, HV_HANDSHAKE)?;
        self.state.hv_used = true;
        self.clock.delay_ms(4);
        Ok(())
    }

    fn send_key(&mut self, sup: &Supervisor, payload: &[u8; 8]) -> Result<(), LinkError> {
        self.send_bytes(sup, &[SYNCH, KEY_64])?;
        self.send_bytes(sup, payload)
    }

    /// Key in programming mode. Fails with [`LinkError::Locked`] when the
    /// device refuses because its lock bits are set.
    pub fn enter_programming(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        if self.is_sys_stat(sup, SYS_NVMPROG)? {
            self.state.prog_enabled = true;
            return Ok(());
        }
        if self.is_sys_stat(sup, SYS_LOCKSTATUS)? {
            debug!("programming refused, device locked");
            return Err(LinkError::Locked);
        }
        self.send_key(sup, &KEY_NVMPROG_PAYLOAD)?;
        self.reset(sup, true)?;
        self.reset(sup, false)?;
        self.wait_sys_set(sup, SYS_NVMPROG)?;
        self.state.prog_enabled = true;
        debug!("programming mode entered");
        Ok(())
    }

    /// Key-gated chip erase. Works on a locked device; unlocks it as a
    /// side effect and re-enters programming mode afterwards.
    pub fn chip_erase(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        if !(self.state.active && self.state.prog_enabled) {
            self.hv_break(sup)?;
        }
        self.port.drain()?;
        self.wait_sys_clear(sup, SYS_RSTSYS)?;

        self.send_key(sup, &KEY_CHIPERASE_PAYLOAD)?;
        self.reset(sup, true)?;
        self.reset(sup, false)?;
        self.wait_sys_clear(sup, SYS_RSTSYS)?;
        self.wait_sys_clear(sup, SYS_LOCKSTATUS)?;
        self.wait_key_clear(sup, KEY_CHIPERASE)?;
        self.state.chip_erased = true;
        debug!("chip erased");

        self.send_key(sup, &KEY_NVMPROG_PAYLOAD)?;
        self.reset(sup, true)?;
        self.reset(sup, false)?;
        self.wait_sys_clear(sup, SYS_RSTSYS)?;
        self.wait_sys_set(sup, SYS_NVMPROG)?;
        if !self.state.prog_enabled {
            self.read_device_info(sup)?;
        }
        self.state.prog_enabled = true;
        Ok(())
    }

    /// Key-gated user-row write for locked devices. The payload lands in
    /// the device's staging buffer and is committed by the finalize bit.
    pub fn write_user_row(
        &mut self,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), LinkError> {
        self.port.drain()?;
        self.wait_sys_clear(sup, SYS_RSTSYS)?;

        self.send_key(sup, &KEY_UROWWRITE_PAYLOAD)?;
        self.reset(sup, true)?;
        self.reset(sup, false)?;
        self.wait_sys_clear(sup, SYS_RSTSYS)?;
        self.wait_sys_set(sup, SYS_UROWPROG)?;

        self.sts8(sup, addr, data)?;
        self.stcs(
            sup,
            CS_ASI_SYS_CTRLA,
            SYS_CTRLA_UROWWRITE_FINAL | SYS_CTRLA_CLKREQ,
        )?;
        self.wait_sys_clear(sup, SYS_UROWPROG)?;
        self.stcs(sup, CS_ASI_KEY_STATUS, KEY_UROWWRITE)?;
        debug!(addr, len = data.len(), "user row committed");

        // On a still-locked part programming mode cannot come back; the
        // write itself has already succeeded.
        if self.is_sys_stat(sup, SYS_LOCKSTATUS)? {
            return Ok(());
        }
        self.send_key(sup, &KEY_NVMPROG_PAYLOAD)?;
        self.reset(sup, true)?;
        self.reset(sup, false)?;
        self.wait_sys_clear(sup, SYS_RSTSYS)?;
        self.wait_sys_set(sup, SYS_NVMPROG)?;
        self.state.prog_enabled = true;
        Ok(())
    }

    /// Release the device: reset cycle, then disable the interface so
    /// the pad returns to its fused function.
    pub fn leave_link(&mut self, sup: &Supervisor) -> Result<(), LinkError> {
        let result = (|| {
            self.reset(sup, true)?;
            self.reset(sup, false)?;
            self.stcs(sup, CS_CTRLB, CTRLB_UPDIDIS)
        })();
        self.pins.pgen(false)?;
        self.state = LinkState::default();
        debug!("device released");
        result
    }

    /// Resynchronize the wire after an aborted operation: a short break
    /// and a drain leave both ends at an instruction boundary.
    pub fn recover(&mut self) {
        if self.port.send_break(false).is_err() {
            return;
        }
        let _ = self.port.drain();
    }

    /// Cycle the device through a clean reset and detach again.
    pub fn target_reset(&mut self, sup: &mut Supervisor) -> Result<(), LinkError> {
        self.enter_link(sup)?;
        sup.arm(ATTACH_ATTEMPT_TICKS);
        let result = (|| {
            self.reset(sup, true)?;
            self.reset(sup, false)?;
            self.leave_link(sup)
        })();
        sup.disarm();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockClock, MockEdge, MockPins, MockTarget, PinEvent};

    fn fixture(target: &MockTarget) -> (UpdiLink, Supervisor) {
        let clock = MockClock::new();
        let link = UpdiLink::new(
            Box::new(target.clone()),
            Box::new(MockPins::new()),
            Arc::new(clock.clone()),
            LinkTuning::default(),
        );
        let sup = Supervisor::new(Arc::new(clock), Arc::new(MockEdge::new()));
        (link, sup)
    }

    #[test]
    fn attach_reads_identity_from_the_information_block() {
        let target = MockTarget::new();
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        assert!(link.state.active);
        assert_eq!(link.state.nvm_version, Some(b'2'));
        assert_eq!(link.state.signature[0], 0x1E);
    }

    #[test]
    fn attach_gives_up_after_the_configured_attempts() {
        let target = MockTarget::new();
        target.set_responsive(false);
        let (mut link, mut sup) = fixture(&target);

        assert!(link.enter_link(&mut sup).is_err());
        assert_eq!(target.break_count(), 3);
        assert!(!link.state.active);
    }

    #[test]
    fn unrecognizable_information_block_fails_attach() {
        let target = MockTarget::new();
        target.set_bad_sib();
        let (mut link, mut sup) = fixture(&target);

        assert!(link.enter_link(&mut sup).is_err());
        assert_eq!(link.state.nvm_version, None);
    }

    #[test]
    fn locked_device_refuses_programming_mode() {
        let target = MockTarget::new();
        target.set_locked(true);
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        sup.arm(1200);
        assert!(matches!(
            link.enter_programming(&sup),
            Err(LinkError::Locked)
        ));
    }

    #[test]
    fn chip_erase_unlocks_and_reenters_programming() {
        let target = MockTarget::new();
        target.set_locked(true);
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        sup.arm(1200);
        link.chip_erase(&sup).unwrap();
        assert!(link.state.chip_erased);
        assert!(link.state.prog_enabled);
        assert_eq!(target.cs_reg(CS_ASI_SYS_STATUS) & SYS_LOCKSTATUS, 0);
    }

    #[test]
    fn user_row_write_succeeds_on_a_locked_device() {
        let target = MockTarget::new();
        target.set_locked(true);
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        sup.arm(1200);
        link.write_user_row(&sup, 0x1300, &[0xDE, 0xAD]).unwrap();
        assert_eq!(target.mem_at(0x1300, 2), vec![0xDE, 0xAD]);
        // Still locked afterwards, and the session does not pretend
        // programming mode came back.
        assert!(!link.state.prog_enabled);
    }

    #[test]
    fn leave_disables_the_interface() {
        let target = MockTarget::new();
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        sup.arm(1200);
        link.leave_link(&sup).unwrap();
        assert!(!target.is_updi_enabled());
        assert!(!link.state.active);
    }

    #[test]
    fn power_on_reset_pulses_the_line_and_detaches() {
        let target = MockTarget::new();
        let clock = MockClock::new();
        let pins = MockPins::new();
        let mut link = UpdiLink::new(
            Box::new(target.clone()),
            Box::new(pins.clone()),
            Arc::new(clock.clone()),
            LinkTuning::default(),
        );
        let mut sup = Supervisor::new(Arc::new(clock), Arc::new(MockEdge::new()));

        link.target_reset(&mut sup).unwrap();
        assert!(!link.state.active);
        assert!(!target.is_updi_enabled());
        let events = pins.events();
        assert!(events.contains(&PinEvent::Trst(true)));
        assert_eq!(events.last(), Some(&PinEvent::Pgen(false)));
    }

    #[test]
    fn unresponsive_device_times_out_instead_of_hanging() {
        let target = MockTarget::new();
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        target.set_responsive(false);
        sup.arm(1200);
        let err = link.st8(&sup, 0x1000, 0x00).unwrap_err();
        assert!(matches!(
            err.cancelled(),
            Some(Cancelled::Timeout { budget: 1200 })
        ));
        assert!(link.state.fault);
        assert!(link.state.timed_out);
        assert_eq!(link.state.flags() & 0xC0, 0xC0);
    }

    #[test]
    fn collided_load_retrains_and_retries_once() {
        let target = MockTarget::new();
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        target.set_mem(0x1002, &[0x5A]);
        let breaks = target.break_count();

        target.corrupt_next_echo();
        sup.arm(1200);
        assert_eq!(link.ld8(&sup, 0x1002).unwrap(), 0x5A);
        assert_eq!(target.break_count(), breaks + 1);
        assert!(link.state.fault);
        assert_ne!(link.state.last_status, 0);

        // The next bring-up starts with a clean slate.
        link.enter_link(&mut sup).unwrap();
        assert!(!link.state.fault);
    }

    #[test]
    fn repeat_header_rejects_an_oversize_count() {
        let target = MockTarget::new();
        let (mut link, mut sup) = fixture(&target);

        link.enter_link(&mut sup).unwrap();
        sup.arm(1200);
        assert!(matches!(
            link.send_repeat_header(&sup, OP_LD | DATA1, 0x8000, 300),
            Err(LinkError::BadRepeat { len: 300 })
        ));
    }
}
