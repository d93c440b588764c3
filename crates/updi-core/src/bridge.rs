//! Bridge orchestrator: one host frame in, one answer out, forever.
//!
//! Owns the framer, the device link, the supervisor and the dispatcher as
//! separate fields so each frame can flow through them without any shared
//! interior state. The loop survives everything except the host port going
//! away; timeouts and external cancels tear the session down and the next
//! sign-on starts clean.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::host::{Dispatcher, Framer, HostError};
use crate::link::{LinkTuning, UpdiLink};
use crate::supervisor::{Cancelled, Supervisor};
use crate::transport::{Clock, ControlLines, EdgeSignal, HostPort, TargetPort, WireError};

/// Outcome of one pass through the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// A frame was received and handled (answered or deliberately ignored).
    Dispatched,
    /// A malformed frame was discarded without an answer.
    FrameDropped,
    /// The host went silent mid-session; the session was torn down.
    HostTimeout,
    /// The external cancel signal fired; the session was torn down.
    SessionSignal,
    /// The host port is gone. The loop cannot continue.
    HostClosed,
}

impl LoopEvent {
    pub fn keep_running(self) -> bool {
        !matches!(self, LoopEvent::HostClosed)
    }
}

pub struct Bridge {
    framer: Framer,
    link: UpdiLink,
    sup: Supervisor,
    dispatcher: Dispatcher,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        host: Box<dyn HostPort>,
        target: Box<dyn TargetPort>,
        pins: Box<dyn ControlLines>,
        clock: Arc<dyn Clock>,
        edge: Arc<dyn EdgeSignal>,
        config: BridgeConfig,
    ) -> Self {
        let tuning = LinkTuning {
            attach_attempts: config.attach_attempts,
            hv_settle_ms: config.hv_settle_ms,
            hv_pulse_us: config.hv_pulse_us,
        };
        let mut sup = Supervisor::new(Arc::clone(&clock), edge);
        sup.arm_edge();
        Self {
            framer: Framer::new(host),
            link: UpdiLink::new(target, pins, clock, tuning),
            sup,
            dispatcher: Dispatcher::new(
                config.host_timeout_ticks,
                config.device_timeout_ticks,
                config.default_baud_id,
                config.signon_settle_ms,
            ),
            config,
        }
    }

    /// Receive one frame and handle it. Every failure mode maps to a
    /// [`LoopEvent`] so the caller decides the loop policy.
    pub fn receive_and_dispatch_one(&mut self) -> LoopEvent {
        match self
            .framer
            .receive(&mut self.sup, self.config.host_timeout_ticks)
        {
            Ok(true) => {}
            Ok(false) => return LoopEvent::FrameDropped,
            Err(err) => return self.handle_loop_error(err),
        }
        match self
            .dispatcher
            .dispatch(&mut self.framer, &mut self.link, &mut self.sup)
        {
            Ok(()) => LoopEvent::Dispatched,
            Err(err) => self.handle_loop_error(err),
        }
    }

    /// Run until the host port closes. Cycles the target through a clean
    /// reset first so a part left mid-session by a previous run detaches.
    pub fn run(&mut self) -> Result<(), WireError> {
        if let Err(err) = self.link.target_reset(&mut self.sup) {
            debug!(%err, "power-on target reset skipped");
        }
        info!("bridge ready");
        loop {
            if !self.receive_and_dispatch_one().keep_running() {
                info!("host port closed, stopping");
                return Ok(());
            }
        }
    }

    fn handle_loop_error(&mut self, err: HostError) -> LoopEvent {
        let (event, answer_failure) = match err {
            HostError::Wire(WireError::Closed) => return LoopEvent::HostClosed,
            HostError::Wire(wire) => {
                warn!(%wire, "host wire error");
                return LoopEvent::HostClosed;
            }
            HostError::Cancelled(Cancelled::Timeout { budget }) => {
                warn!(budget, "host went silent");
                (LoopEvent::HostTimeout, true)
            }
            HostError::Cancelled(Cancelled::ExternalSignal) => {
                info!("session cancelled externally");
                (LoopEvent::SessionSignal, false)
            }
        };
        if let Err(cleanup) = self.dispatcher.abort_session(
            &mut self.framer,
            &mut self.link,
            &mut self.sup,
            answer_failure,
        ) {
            warn!(%cleanup, "session teardown incomplete");
            if matches!(cleanup, HostError::Wire(_)) {
                return LoopEvent::HostClosed;
            }
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::dialect::NVM_REG_CTRLA;
    use crate::protocol::constants::*;
    use crate::protocol::{crc16, Frame};
    use crate::transport::mock::{MockClock, MockEdge, MockHostPort, MockPins, MockTarget};

    struct Rig {
        bridge: Bridge,
        host: MockHostPort,
        target: MockTarget,
        edge: MockEdge,
    }

    fn rig_with(target: MockTarget) -> Rig {
        let host = MockHostPort::new();
        let edge = MockEdge::new();
        let bridge = Bridge::new(
            Box::new(host.clone()),
            Box::new(target.clone()),
            Box::new(MockPins::new()),
            Arc::new(MockClock::new()),
            Arc::new(edge.clone()),
            BridgeConfig::default(),
        );
        Rig {
            bridge,
            host,
            target,
            edge,
        }
    }

    fn rig() -> Rig {
        rig_with(MockTarget::new())
    }

    fn send(host: &MockHostPort, seq: u16, body: &[u8]) {
        let mut frame = Frame::new();
        frame.set_sequence(seq);
        frame.set_body(body);
        host.push(frame.encode());
    }

    /// Split the host's transmit capture back into (sequence, body) pairs,
    /// verifying framing and CRC along the way.
    fn parse_answers(bytes: &[u8]) -> Vec<(u16, Vec<u8>)> {
        let mut answers = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            assert_eq!(bytes[i], MESSAGE_START, "bad frame start at {i}");
            let seq = u16::from_le_bytes([bytes[i + 1], bytes[i + 2]]);
            let len = u32::from_le_bytes([
                bytes[i + 3],
                bytes[i + 4],
                bytes[i + 5],
                bytes[i + 6],
            ]) as usize;
            assert_eq!(bytes[i + 7], TOKEN);
            let total = HEADER_SIZE + len + CRC_SIZE;
            assert_eq!(crc16(&bytes[i..i + total]), 0, "bad answer CRC");
            answers.push((seq, bytes[i + HEADER_SIZE..i + HEADER_SIZE + len].to_vec()));
            i += total;
        }
        answers
    }

    fn sign_on(rig: &mut Rig) {
        send(&rig.host, 1, &[CMND_GET_SIGN_ON]);
        assert_eq!(rig.bridge.receive_and_dispatch_one(), LoopEvent::Dispatched);
        let answers = parse_answers(&rig.host.take_written());
        assert_eq!(answers.last().unwrap().1[0], RSP_SIGN_ON);
        rig.target.clear_stores();
    }

    fn write_body(mtype: u8, addr: u32, data: &[u8]) -> Vec<u8> {
        let mut body = vec![CMND_WRITE_MEMORY, mtype];
        body.extend((data.len() as u32).to_le_bytes());
        body.extend(addr.to_le_bytes());
        body.extend(data);
        body
    }

    fn descriptor_body(page_size: u16) -> Vec<u8> {
        let mut body = vec![0u8; DESCRIPTOR_FLASH_PAGESIZE_OFFSET + 2];
        body[0] = CMND_SET_DEVICE_DESCRIPTOR;
        body[DESCRIPTOR_FLASH_PAGESIZE_OFFSET..].copy_from_slice(&page_size.to_le_bytes());
        body
    }

    /// One dispatched frame, returning the (sequence, body) of its answer.
    fn exchange(rig: &mut Rig, seq: u16, body: &[u8]) -> (u16, Vec<u8>) {
        send(&rig.host, seq, body);
        assert_eq!(rig.bridge.receive_and_dispatch_one(), LoopEvent::Dispatched);
        let answers = parse_answers(&rig.host.take_written());
        assert_eq!(answers.len(), 1);
        answers.into_iter().next().unwrap()
    }

    #[test]
    fn sign_on_answers_the_identity_record() {
        let mut rig = rig();
        let (seq, body) = exchange(&mut rig, 1, &[CMND_GET_SIGN_ON]);
        assert_eq!(seq, 1);
        assert_eq!(body, SIGN_ON_RESPONSE);
        assert_eq!(*body.last().unwrap(), 0, "product string not terminated");
        assert!(rig.host.is_tx_enabled());
    }

    #[test]
    fn bad_token_frame_is_skipped_and_the_next_frame_still_lands() {
        let mut rig = rig();
        let mut frame = Frame::new();
        frame.set_sequence(1);
        frame.set_body(&[CMND_GET_SIGN_ON]);
        let mut corrupt = frame.encode().to_vec();
        corrupt[7] = 0x00;
        rig.host.push(&corrupt);
        send(&rig.host, 2, &[CMND_GET_SIGN_ON]);

        assert_eq!(rig.bridge.receive_and_dispatch_one(), LoopEvent::FrameDropped);
        assert!(rig.host.take_written().is_empty());

        assert_eq!(rig.bridge.receive_and_dispatch_one(), LoopEvent::Dispatched);
        let answers = parse_answers(&rig.host.take_written());
        assert_eq!(answers[0].0, 2);
        assert_eq!(answers[0].1[0], RSP_SIGN_ON);
    }

    #[test]
    fn zero_length_write_is_refused_without_device_traffic() {
        let mut rig = rig();
        sign_on(&mut rig);

        let (_, body) = exchange(&mut rig, 2, &write_body(MTYPE_EEPROM, 0x1400, &[]));
        assert_eq!(body[0], RSP_ILLEGAL_MEMORY_RANGE);
        assert!(rig.target.stores().is_empty());
    }

    #[test]
    fn unresponsive_target_still_identifies_but_refuses_writes() {
        let target = MockTarget::new();
        target.set_responsive(false);
        let mut rig = rig_with(target);

        let (_, body) = exchange(&mut rig, 1, &[CMND_GET_SIGN_ON]);
        assert_eq!(body[0], RSP_SIGN_ON);
        assert_eq!(rig.target.break_count(), 3, "one break per attach attempt");

        let (_, body) = exchange(&mut rig, 2, &write_body(MTYPE_EEPROM, 0x1400, &[1, 2]));
        assert_eq!(body[0], RSP_ILLEGAL_MCU_STATE);
        assert!(rig.target.stores().is_empty());
    }

    #[test]
    fn external_signal_tears_the_session_down() {
        let mut rig = rig();
        sign_on(&mut rig);

        rig.edge.trigger();
        assert_eq!(rig.bridge.receive_and_dispatch_one(), LoopEvent::SessionSignal);
        assert!(!rig.host.is_tx_enabled());
        assert!(!rig.target.is_updi_enabled());
    }

    #[test]
    fn replayed_write_is_acknowledged_without_touching_the_device() {
        let mut rig = rig();
        sign_on(&mut rig);
        let body = write_body(MTYPE_EEPROM, 0x1400, &[0xDE, 0xAD]);

        let (_, answer) = exchange(&mut rig, 7, &body);
        assert_eq!(answer[0], RSP_OK);
        assert_eq!(rig.target.mem_at(0x1400, 2), vec![0xDE, 0xAD]);

        rig.target.clear_stores();
        let (_, answer) = exchange(&mut rig, 7, &body);
        assert_eq!(answer[0], RSP_OK);
        assert!(rig.target.stores().is_empty(), "replay reached the device");
    }

    #[test]
    fn aligned_flash_write_erases_the_page_before_writing() {
        let mut rig = rig();
        sign_on(&mut rig);
        let (_, answer) = exchange(&mut rig, 2, &descriptor_body(64));
        assert_eq!(answer[0], RSP_OK);

        let page = [0xA5u8; 64];
        let (_, answer) = exchange(&mut rig, 3, &write_body(MTYPE_XMEGA_FLASH, 0x8000, &page));
        assert_eq!(answer[0], RSP_OK);

        let cmds = rig.target.stores_to(NVM_REG_CTRLA);
        let pos_erase = cmds.iter().position(|&c| c == 0x08);
        let pos_write = cmds.iter().position(|&c| c == 0x02);
        assert!(pos_erase.is_some(), "page erase missing: {cmds:?}");
        assert!(pos_erase < pos_write);
        assert_eq!(rig.target.mem_at(0x8000, 64), page.to_vec());
    }

    #[test]
    fn chip_erase_suppresses_later_page_erases() {
        let mut rig = rig();
        sign_on(&mut rig);
        exchange(&mut rig, 2, &descriptor_body(64));

        let (_, answer) = exchange(&mut rig, 3, &[CMND_XMEGA_ERASE, ERASE_CHIP, 0, 0, 0, 0]);
        assert_eq!(answer[0], RSP_OK);

        rig.target.clear_stores();
        let (_, answer) = exchange(&mut rig, 4, &write_body(MTYPE_XMEGA_FLASH, 0x8000, &[0u8; 64]));
        assert_eq!(answer[0], RSP_OK);
        assert!(
            !rig.target.stores_to(NVM_REG_CTRLA).contains(&0x08),
            "page erase after chip erase"
        );
    }

    #[test]
    fn section_erase_is_acknowledged_without_device_action() {
        let mut rig = rig();
        sign_on(&mut rig);

        let (_, answer) = exchange(&mut rig, 2, &[CMND_XMEGA_ERASE, 0x01, 0, 0x80, 0, 0]);
        assert_eq!(answer[0], RSP_OK);
        assert!(rig.target.stores().is_empty());
    }

    #[test]
    fn baud_change_is_applied_after_the_confirming_answer() {
        let mut rig = rig();
        sign_on(&mut rig);

        let (_, answer) = exchange(&mut rig, 2, &[CMND_SET_PARAMETER, PARAM_BAUD_RATE, 7]);
        assert_eq!(answer[0], RSP_OK);
        assert_eq!(rig.host.baud_changes(), vec![115_200]);
    }

    #[test]
    fn out_of_range_baud_id_is_refused() {
        let mut rig = rig();
        sign_on(&mut rig);

        let (_, answer) = exchange(&mut rig, 2, &[CMND_SET_PARAMETER, PARAM_BAUD_RATE, 28]);
        assert_eq!(answer[0], RSP_ILLEGAL_PARAMETER);
        assert!(rig.host.baud_changes().is_empty());
    }

    #[test]
    fn sign_off_releases_the_device_and_resets_the_baud() {
        let mut rig = rig();
        sign_on(&mut rig);

        let (_, answer) = exchange(&mut rig, 9, &[CMND_SIGN_OFF]);
        assert_eq!(answer[0], RSP_OK);
        assert!(!rig.host.is_tx_enabled());
        assert!(!rig.target.is_updi_enabled());
        assert_eq!(rig.host.baud_changes(), vec![19_200]);
    }

    #[test]
    fn silent_host_gets_a_failure_answer_and_an_implicit_sign_off() {
        let mut rig = rig();
        sign_on(&mut rig);

        assert_eq!(rig.bridge.receive_and_dispatch_one(), LoopEvent::HostTimeout);
        let answers = parse_answers(&rig.host.take_written());
        assert_eq!(answers.last().unwrap().1[0], RSP_FAILED);
        assert!(!rig.host.is_tx_enabled());
    }

    #[test]
    fn closed_host_port_stops_the_loop() {
        let mut rig = rig();
        rig.host.close();
        let event = rig.bridge.receive_and_dispatch_one();
        assert_eq!(event, LoopEvent::HostClosed);
        assert!(!event.keep_running());
    }

    #[test]
    fn locked_part_serves_its_signature_from_the_attach_cache() {
        // A locked part refuses programming mode, so the signature probe
        // must be answered from what the attach handshake reported.
        let target = MockTarget::new();
        target.set_locked(true);
        let mut rig = rig_with(target);
        let (_, body) = exchange(&mut rig, 1, &[CMND_GET_SIGN_ON]);
        assert_eq!(body[0], RSP_SIGN_ON);

        let mut body = vec![CMND_READ_MEMORY, MTYPE_SIGN_JTAG];
        body.extend(1u32.to_le_bytes());
        body.extend(0x1100u32.to_le_bytes());
        let (_, answer) = exchange(&mut rig, 2, &body);
        assert_eq!(answer[0], RSP_MEMORY);
        assert_eq!(answer[1], 0x1E);
    }

    #[test]
    fn flash_read_returns_device_contents() {
        let mut rig = rig();
        rig.target.set_mem(0x8000, &[0x0C, 0x94, 0x5D, 0x00]);
        sign_on(&mut rig);

        let mut body = vec![CMND_READ_MEMORY, MTYPE_XMEGA_FLASH];
        body.extend(4u32.to_le_bytes());
        body.extend(0x8000u32.to_le_bytes());
        let (_, answer) = exchange(&mut rig, 2, &body);
        assert_eq!(answer[0], RSP_MEMORY);
        assert_eq!(&answer[1..], &[0x0C, 0x94, 0x5D, 0x00]);
    }

    #[test]
    fn unknown_command_is_ignored_without_an_answer() {
        let mut rig = rig();
        sign_on(&mut rig);

        send(&rig.host, 5, &[0x77]);
        assert_eq!(rig.bridge.receive_and_dispatch_one(), LoopEvent::Dispatched);
        assert!(rig.host.take_written().is_empty());
    }
}
