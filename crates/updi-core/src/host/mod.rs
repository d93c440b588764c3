//! Host-facing framed protocol: reception, command dispatch, session
//! lifecycle.
//!
//! The framer owns the host port and the one reusable frame buffer. The
//! dispatcher interprets command bodies, drives the device link and the
//! memory engine, and rewrites the frame in place as the answer. Answer
//! side effects that must happen after the bytes left at the old settings
//! (baud change, session teardown) run in a separate after-answer step,
//! mirroring the order the host expects.

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::link::UpdiLink;
use crate::nvm::{self, dialect_for, NvmDialect, BASE_SIGROW};
use crate::protocol::constants::*;
use crate::protocol::Frame;
use crate::supervisor::{Cancelled, Supervisor};
use crate::transport::{HostPort, WireError};

#[derive(Error, Debug)]
pub enum HostError {
    #[error("host wire: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Stop normal processing only for an external cancel; a timed-out
/// device operation is handled locally as a failed answer.
fn bubble_signal(cancelled: Option<Cancelled>) -> Result<(), HostError> {
    if let Some(Cancelled::ExternalSignal) = cancelled {
        return Err(HostError::Cancelled(Cancelled::ExternalSignal));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Session state
// ----------------------------------------------------------------------------

/// Host session bookkeeping across frames.
#[derive(Debug, Default)]
pub struct SessionState {
    pub signed_on: bool,
    pub tx_enabled: bool,
    /// Last answer carried an error code.
    pub last_answer_failed: bool,
    /// Baud id to apply after the pending answer is flushed.
    pub baud_pending: Option<u8>,
    pub baud_id: u8,
    pub emu_mode: u8,
    /// Flash page size cached from the device descriptor.
    pub flash_page_size: u16,
    /// Sequence number of the last executed write or erase, for replay
    /// suppression when the host retransmits an acknowledged frame.
    pub last_destructive_seq: Option<u16>,
}

impl SessionState {
    /// Diagnostic flag byte carried in status responses.
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.signed_on {
            flags |= 0x01;
        }
        if self.tx_enabled {
            flags |= 0x02;
        }
        if self.last_answer_failed {
            flags |= 0x04;
        }
        if self.baud_pending.is_some() {
            flags |= 0x08;
        }
        flags
    }
}

// ----------------------------------------------------------------------------
// Framer
// ----------------------------------------------------------------------------

/// Frame reception and transmission over the host port.
pub struct Framer {
    port: Box<dyn HostPort>,
    frame: Frame,
}

impl Framer {
    pub fn new(port: Box<dyn HostPort>) -> Self {
        Self {
            port,
            frame: Frame::new(),
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    fn get_byte(&mut self, sup: &Supervisor) -> Result<u8, HostError> {
        loop {
            if let Some(byte) = self.port.get()? {
                return Ok(byte);
            }
            sup.poll_pause()?;
        }
    }

    /// Receive one frame into the reusable buffer.
    ///
    /// Scans to the start marker without a deadline (the edge watch stays
    /// live), then arms the host deadline for the rest of the frame.
    /// Returns `false` for a malformed frame, which the caller drops
    /// without an answer; the host's own timeout drives retransmission.
    pub fn receive(&mut self, sup: &mut Supervisor, host_ticks: u32) -> Result<bool, HostError> {
        loop {
            match self.port.get()? {
                Some(MESSAGE_START) => break,
                Some(noise) => trace!(noise, "skipping inter-frame byte"),
                None => sup.poll_pause()?,
            }
        }
        sup.arm(host_ticks);

        self.frame.raw_mut()[0] = MESSAGE_START;
        for i in 1..HEADER_SIZE {
            let byte = self.get_byte(sup)?;
            self.frame.raw_mut()[i] = byte;
        }
        if let Err(err) = self.frame.commit_header() {
            warn!(%err, "dropping frame");
            return Ok(false);
        }

        let rest = self.frame.body_len() + CRC_SIZE;
        for i in 0..rest {
            let byte = self.get_byte(sup)?;
            self.frame.raw_mut()[HEADER_SIZE + i] = byte;
        }
        if let Err(err) = self.frame.check_crc() {
            warn!(%err, seq = self.frame.sequence(), "dropping frame");
            return Ok(false);
        }
        trace!(
            seq = self.frame.sequence(),
            len = self.frame.body_len(),
            "frame received"
        );
        Ok(true)
    }

    /// Transmit the frame as it currently stands.
    pub fn answer(&mut self) -> Result<(), HostError> {
        let wire_len = {
            let wire = self.frame.encode();
            self.port.put(wire)?;
            wire.len()
        };
        self.port.flush()?;
        trace!(seq = self.frame.sequence(), wire_len, "answer sent");
        Ok(())
    }

    pub fn apply_baud(&mut self, baud: u32) -> Result<(), HostError> {
        self.port.flush()?;
        self.port.set_baud(baud)?;
        Ok(())
    }

    pub fn tx_enable(&mut self) -> Result<(), HostError> {
        self.port.tx_enable()?;
        Ok(())
    }

    pub fn tx_disable(&mut self) -> Result<(), HostError> {
        self.port.flush()?;
        self.port.tx_disable()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Per-command interpreter and session lifecycle driver.
pub struct Dispatcher {
    pub session: SessionState,
    dialect: Option<&'static dyn NvmDialect>,
    host_ticks: u32,
    device_ticks: u32,
    default_baud_id: u8,
    signon_settle_ms: u32,
}

impl Dispatcher {
    pub fn new(
        host_ticks: u32,
        device_ticks: u32,
        default_baud_id: u8,
        signon_settle_ms: u32,
    ) -> Self {
        Self {
            session: SessionState {
                baud_id: default_baud_id,
                ..SessionState::default()
            },
            dialect: None,
            host_ticks,
            device_ticks,
            default_baud_id,
            signon_settle_ms,
        }
    }

    /// Interpret the received frame, answer it, and run the after-answer
    /// actions. Unknown commands are ignored without an answer.
    pub fn dispatch(
        &mut self,
        framer: &mut Framer,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        let cmd = framer.frame().message_id();
        let seq = framer.frame().sequence();
        debug!(seq, cmd = format!("{cmd:#04X}"), "command");

        // A retransmission of an already-executed write or erase is
        // acknowledged again without touching the device.
        if matches!(cmd, CMND_WRITE_MEMORY | CMND_XMEGA_ERASE)
            && self.session.last_destructive_seq == Some(seq)
        {
            debug!(seq, "duplicate frame, repeating acknowledge");
            self.ok(framer.frame_mut(), link);
            return self.answer_and_follow_up(framer, link, sup);
        }

        match cmd {
            CMND_GET_SIGN_ON => self.handle_sign_on(framer, link, sup)?,
            CMND_SIGN_OFF => self.handle_sign_off(framer, link),
            CMND_SET_PARAMETER => self.handle_set_parameter(framer.frame_mut(), link),
            CMND_GET_PARAMETER => self.handle_get_parameter(framer.frame_mut(), link),
            CMND_SET_DEVICE_DESCRIPTOR => self.handle_descriptor(framer.frame_mut(), link),
            CMND_ENTER_PROGMODE => self.handle_enter_progmode(framer.frame_mut(), link, sup)?,
            CMND_READ_MEMORY => self.handle_read_memory(framer.frame_mut(), link, sup)?,
            CMND_WRITE_MEMORY => self.handle_write_memory(framer.frame_mut(), link, sup)?,
            CMND_XMEGA_ERASE => self.handle_erase(framer.frame_mut(), link, sup)?,
            // Answered for compatibility, no device action behind them.
            CMND_GET_SYNC | CMND_GO | CMND_RESET | CMND_LEAVE_PROGMODE => {
                self.ok(framer.frame_mut(), link)
            }
            unknown => {
                debug!(cmd = format!("{unknown:#04X}"), "ignoring unknown command");
                return Ok(());
            }
        }
        self.answer_and_follow_up(framer, link, sup)
    }

    /// Tear the session down after a host timeout or an external cancel.
    /// With `answer_failure` a final failed answer is sent first (only
    /// meaningful while the host is still signed on).
    pub fn abort_session(
        &mut self,
        framer: &mut Framer,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
        answer_failure: bool,
    ) -> Result<(), HostError> {
        sup.disarm();
        if answer_failure && self.session.signed_on {
            self.respond(framer.frame_mut(), link, RSP_FAILED);
            framer.answer()?;
        }
        self.session.signed_on = false;
        self.session.baud_pending = Some(self.default_baud_id);
        self.follow_up(framer, link, sup)
    }

    // ------------------------------------------------------------------
    // Answer plumbing
    // ------------------------------------------------------------------

    /// Status-only answer: code plus the session and link flag bytes.
    fn respond(&self, frame: &mut Frame, link: &UpdiLink, code: u8) {
        let session_flags = self.session.flags();
        let body = frame.body_for_write(3);
        body[0] = code;
        body[1] = session_flags;
        body[2] = link.state.flags();
    }

    fn ok(&self, frame: &mut Frame, link: &UpdiLink) {
        self.respond(frame, link, RSP_OK);
    }

    fn answer_and_follow_up(
        &mut self,
        framer: &mut Framer,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        self.session.last_answer_failed = framer.frame().message_id() >= RSP_FAILED;
        framer.answer()?;
        self.follow_up(framer, link, sup)
    }

    /// Actions that must run after the answer left the port: baud change
    /// at the old speed first, then session teardown once the host has
    /// signed off.
    fn follow_up(
        &mut self,
        framer: &mut Framer,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        if let Some(id) = self.session.baud_pending.take() {
            let baud = BAUD_TABLE[id as usize];
            framer.apply_baud(baud)?;
            self.session.baud_id = id;
            info!(baud, "host baud changed");
        }

        if self.session.tx_enabled && !self.session.signed_on {
            framer.tx_disable()?;
            if link.state.active {
                sup.arm(self.device_ticks);
                if let Err(err) = link.leave_link(sup) {
                    bubble_signal(err.cancelled())?;
                    warn!(%err, "device release failed");
                    link.recover();
                }
            }
            sup.disarm();
            self.dialect = None;
            self.session = SessionState {
                baud_id: self.session.baud_id,
                ..SessionState::default()
            };
            info!("session closed");
        }

        // The inter-frame deadline only runs while a host is signed on:
        // a signed-on host that goes silent gets a failure answer and an
        // implicit sign-off, an idle bridge just keeps scanning.
        if self.session.signed_on {
            sup.arm(self.host_ticks);
        } else {
            sup.disarm();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Command handlers
    // ------------------------------------------------------------------

    fn handle_sign_on(
        &mut self,
        framer: &mut Framer,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        if !self.session.tx_enabled {
            framer.tx_enable()?;
            self.session.tx_enabled = true;

            // Device bring-up is best effort: the identity answer goes
            // out even when no device responds, so the host can still
            // talk to the bridge itself.
            match link.enter_link(sup) {
                Ok(()) => {
                    sup.arm(self.device_ticks);
                    if let Err(err) = link.enter_programming(sup) {
                        bubble_signal(err.cancelled())?;
                        debug!(%err, "programming mode not available at sign-on");
                        if err.cancelled().is_some() {
                            link.recover();
                        }
                    }
                    sup.disarm();
                }
                Err(err) => {
                    bubble_signal(err.cancelled())?;
                    warn!(%err, "no device at sign-on");
                }
            }
            self.dialect = link.state.nvm_version.and_then(dialect_for);
            if self.dialect.is_none() && link.state.active {
                warn!(
                    version = link.state.nvm_version,
                    "unknown controller generation, memory operations disabled"
                );
            }
            sup.clock().delay_ms(self.signon_settle_ms);
        }
        self.session.signed_on = true;
        framer.frame_mut().set_body(&SIGN_ON_RESPONSE);
        info!("host signed on");
        Ok(())
    }

    fn handle_sign_off(&mut self, framer: &mut Framer, link: &UpdiLink) {
        self.session.signed_on = false;
        self.session.baud_pending = Some(self.default_baud_id);
        info!("host signed off");
        self.ok(framer.frame_mut(), link);
    }

    fn handle_set_parameter(&mut self, frame: &mut Frame, link: &UpdiLink) {
        let body = frame.body();
        let (Some(&key), Some(&value)) = (body.get(1), body.get(2)) else {
            self.respond(frame, link, RSP_ILLEGAL_PARAMETER);
            return;
        };
        match key {
            PARAM_EMU_MODE => {
                self.session.emu_mode = value;
            }
            PARAM_BAUD_RATE => {
                if !(BAUD_LOWER..=BAUD_UPPER).contains(&value) {
                    self.respond(frame, link, RSP_ILLEGAL_PARAMETER);
                    return;
                }
                self.session.baud_pending = Some(value);
            }
            other => {
                // Unrecognized keys are acknowledged and ignored.
                trace!(key = other, value, "ignoring parameter");
            }
        }
        self.ok(frame, link);
    }

    fn handle_get_parameter(&mut self, frame: &mut Frame, link: &UpdiLink) {
        let Some(&key) = frame.body().get(1) else {
            self.respond(frame, link, RSP_ILLEGAL_PARAMETER);
            return;
        };
        match key {
            PARAM_HW_VER => {
                let body = frame.body_for_write(3);
                body[0] = RSP_PARAMETER;
                body[1] = SIGN_ON_RESPONSE[5];
                body[2] = SIGN_ON_RESPONSE[9];
            }
            PARAM_FW_VER => {
                let body = frame.body_for_write(5);
                body[0] = RSP_PARAMETER;
                body[1] = SIGN_ON_RESPONSE[3];
                body[2] = SIGN_ON_RESPONSE[4];
                body[3] = SIGN_ON_RESPONSE[7];
                body[4] = SIGN_ON_RESPONSE[8];
            }
            PARAM_EMU_MODE => {
                let emu = self.session.emu_mode;
                let body = frame.body_for_write(2);
                body[0] = RSP_PARAMETER;
                body[1] = emu;
            }
            PARAM_BAUD_RATE => {
                let id = self.session.baud_id;
                let body = frame.body_for_write(2);
                body[0] = RSP_PARAMETER;
                body[1] = id;
            }
            PARAM_VTARGET => {
                let body = frame.body_for_write(3);
                body[0] = RSP_PARAMETER;
                body[1] = PARAM_VTARGET_MV as u8;
                body[2] = (PARAM_VTARGET_MV >> 8) as u8;
            }
            _ => self.respond(frame, link, RSP_ILLEGAL_PARAMETER),
        }
    }

    fn handle_descriptor(&mut self, frame: &mut Frame, link: &UpdiLink) {
        let body = frame.body();
        if body.len() > DESCRIPTOR_FLASH_PAGESIZE_OFFSET + 1 {
            self.session.flash_page_size = u16::from_le_bytes([
                body[DESCRIPTOR_FLASH_PAGESIZE_OFFSET],
                body[DESCRIPTOR_FLASH_PAGESIZE_OFFSET + 1],
            ]);
            debug!(page_size = self.session.flash_page_size, "descriptor cached");
        }
        self.ok(frame, link);
    }

    fn handle_enter_progmode(
        &mut self,
        frame: &mut Frame,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        if self.dialect.is_none() {
            self.respond(frame, link, RSP_ILLEGAL_MCU_STATE);
            return Ok(());
        }
        sup.arm(self.device_ticks);
        let result = link.enter_programming(sup);
        sup.disarm();
        match result {
            Ok(()) => self.ok(frame, link),
            Err(err) => {
                bubble_signal(err.cancelled())?;
                debug!(%err, "enter programming failed");
                if err.cancelled().is_some() {
                    link.recover();
                }
                self.respond(frame, link, RSP_ILLEGAL_MCU_STATE);
            }
        }
        Ok(())
    }

    fn handle_read_memory(
        &mut self,
        frame: &mut Frame,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        if frame.body_len() < 10 {
            self.respond(frame, link, RSP_ILLEGAL_MEMORY_RANGE);
            return Ok(());
        }
        let mtype = frame.body()[1];
        let len = frame.body_u32(2) as usize;
        let addr = frame.body_u32(6);

        if !nvm::readable(mtype) {
            self.respond(frame, link, RSP_ILLEGAL_MEMORY_TYPE);
            return Ok(());
        }
        if len == 0 || len > nvm::max_read_len(mtype) {
            self.respond(frame, link, RSP_ILLEGAL_MEMORY_RANGE);
            return Ok(());
        }

        // The signature window is answered from the attach-time cache
        // while no programming session is open; the host probes it
        // before deciding to enter one.
        if mtype == MTYPE_SIGN_JTAG
            && len == 1
            && (BASE_SIGROW..=BASE_SIGROW + 2).contains(&addr)
            && link.state.active
            && !link.state.prog_enabled
        {
            let byte = link.state.signature[(addr - BASE_SIGROW) as usize];
            let body = frame.body_for_write(2);
            body[0] = RSP_MEMORY;
            body[1] = byte;
            return Ok(());
        }

        if !link.state.active {
            self.respond(frame, link, RSP_ILLEGAL_MCU_STATE);
            return Ok(());
        }

        sup.arm(self.device_ticks);
        let result = {
            let out = frame.body_for_write(len + 1);
            out[0] = RSP_MEMORY;
            nvm::read_memory(link, sup, mtype, addr, &mut out[1..])
        };
        sup.disarm();
        if let Err(err) = result {
            bubble_signal(err.cancelled())?;
            debug!(%err, "read failed");
            if err.cancelled().is_some() {
                link.recover();
            }
            self.respond(frame, link, RSP_ILLEGAL_MCU_STATE);
        }
        Ok(())
    }

    fn write_bounds_ok(&self, mtype: u8, len: usize) -> bool {
        match mtype {
            MTYPE_XMEGA_FLASH | MTYPE_BOOT_FLASH => {
                let page = self.session.flash_page_size as usize;
                len % 2 == 0 && (len == 256 || len == 64 || (page > 0 && len == page))
            }
            MTYPE_FUSE_BITS => len == 1,
            _ => (1..=256).contains(&len),
        }
    }

    fn handle_write_memory(
        &mut self,
        frame: &mut Frame,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        let seq = frame.sequence();
        if frame.body_len() < 11 {
            self.respond(frame, link, RSP_ILLEGAL_MEMORY_RANGE);
            return Ok(());
        }
        let mtype = frame.body()[1];
        let len = frame.body_u32(2) as usize;
        let addr = frame.body_u32(6);

        if !nvm::writable(mtype) {
            self.respond(frame, link, RSP_ILLEGAL_MEMORY_TYPE);
            return Ok(());
        }
        if len == 0 || frame.body_len() < 10 + len || !self.write_bounds_ok(mtype, len) {
            self.respond(frame, link, RSP_ILLEGAL_MEMORY_RANGE);
            return Ok(());
        }
        let Some(dialect) = self.dialect else {
            self.respond(frame, link, RSP_ILLEGAL_MCU_STATE);
            return Ok(());
        };

        let data = frame.body()[10..10 + len].to_vec();
        let page_size = self.session.flash_page_size;

        // One full retry before giving up: a transient wire upset is far
        // more common than a genuinely failing part.
        for attempt in 0..2 {
            sup.arm(self.device_ticks);
            let result = nvm::write_memory(link, sup, dialect, mtype, addr, &data, page_size);
            sup.disarm();
            match result {
                Ok(()) => {
                    self.session.last_destructive_seq = Some(seq);
                    self.ok(frame, link);
                    return Ok(());
                }
                Err(err) => {
                    bubble_signal(err.cancelled())?;
                    warn!(%err, attempt, "write failed");
                    if err.cancelled().is_some() {
                        link.recover();
                    }
                }
            }
        }
        self.respond(frame, link, RSP_ILLEGAL_MCU_STATE);
        Ok(())
    }

    fn handle_erase(
        &mut self,
        frame: &mut Frame,
        link: &mut UpdiLink,
        sup: &mut Supervisor,
    ) -> Result<(), HostError> {
        let seq = frame.sequence();
        if frame.body_len() < 6 {
            self.respond(frame, link, RSP_ILLEGAL_PARAMETER);
            return Ok(());
        }
        let sub = frame.body()[1];
        let addr = frame.body_u32(2);

        // Only the whole-chip erase at address zero touches the device;
        // the section erases are acknowledged as already satisfied.
        if sub != ERASE_CHIP || addr != 0 {
            debug!(sub, addr, "erase sub-command acknowledged without action");
            self.ok(frame, link);
            return Ok(());
        }

        sup.arm(self.device_ticks);
        let result = match self.dialect {
            Some(dialect) if link.state.prog_enabled => dialect
                .chip_erase(link, sup)
                .map_err(|e| (e.cancelled(), e.to_string())),
            _ => link
                .chip_erase(sup)
                .map_err(|e| (e.cancelled(), e.to_string())),
        };
        sup.disarm();
        match result {
            Ok(()) => {
                link.state.chip_erased = true;
                // The key-gated path may have attached a previously
                // locked device; bind its dialect now.
                self.dialect = link.state.nvm_version.and_then(dialect_for);
                self.session.last_destructive_seq = Some(seq);
                self.ok(frame, link);
            }
            Err((cancelled, err)) => {
                bubble_signal(cancelled)?;
                warn!(%err, "chip erase failed");
                if cancelled.is_some() {
                    link.recover();
                }
                self.respond(frame, link, RSP_ILLEGAL_MCU_STATE);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockClock, MockEdge, MockHostPort};
    use std::sync::Arc;

    fn framer_fixture() -> (Framer, MockHostPort, Supervisor, MockClock) {
        let host = MockHostPort::new();
        let framer = Framer::new(Box::new(host.clone()));
        let clock = MockClock::new();
        let sup = Supervisor::new(Arc::new(clock.clone()), Arc::new(MockEdge::new()));
        (framer, host, sup, clock)
    }

    fn wire_frame(seq: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = Frame::new();
        frame.set_sequence(seq);
        frame.set_body(body);
        frame.encode().to_vec()
    }

    #[test]
    fn receiver_resyncs_past_leading_noise() {
        let (mut framer, host, mut sup, _) = framer_fixture();
        let mut bytes = vec![0x00, 0xFF, 0x42];
        bytes.extend(wire_frame(9, &[CMND_GET_SYNC]));
        host.push(&bytes);

        assert!(framer.receive(&mut sup, 12_000).unwrap());
        assert_eq!(framer.frame().sequence(), 9);
        assert_eq!(framer.frame().message_id(), CMND_GET_SYNC);
    }

    #[test]
    fn corrupted_frame_is_dropped_without_an_answer() {
        let (mut framer, host, mut sup, _) = framer_fixture();
        let mut bytes = wire_frame(1, &[CMND_GET_SYNC]);
        let body_pos = bytes.len() - 3;
        bytes[body_pos] ^= 0x01;
        host.push(&bytes);

        assert!(!framer.receive(&mut sup, 12_000).unwrap());
        assert!(host.written().is_empty());
    }

    #[test]
    fn silence_after_the_start_byte_hits_the_host_deadline() {
        let (mut framer, host, mut sup, _) = framer_fixture();
        host.push(&[MESSAGE_START, 0x01]);

        let err = framer.receive(&mut sup, 12_000).unwrap_err();
        assert!(matches!(
            err,
            HostError::Cancelled(Cancelled::Timeout { budget: 12_000 })
        ));
    }

    #[test]
    fn session_flags_reflect_the_lifecycle() {
        let mut session = SessionState::default();
        assert_eq!(session.flags(), 0);
        session.signed_on = true;
        session.tx_enabled = true;
        assert_eq!(session.flags(), 0x03);
        session.baud_pending = Some(7);
        assert_eq!(session.flags(), 0x0B);
    }
}
