//! In-memory wires for testing.
//!
//! `MockHostPort` is a byte queue pair. `MockTarget` is a behavioral
//! device simulator: it parses the single-wire instruction stream byte by
//! byte, echoes every transmitted byte the way the shared wire does, and
//! produces acknowledges, register reads and memory data like a real part.
//! Engine tests therefore assert on real byte sequences instead of on
//! function-call traces.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::traits::{Clock, ControlLines, EdgeSignal, HostPort, TargetPort, WireError};
use crate::link::constants::*;

// ----------------------------------------------------------------------------
// Host side
// ----------------------------------------------------------------------------

#[derive(Default)]
struct HostInner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    baud_log: Vec<u32>,
    tx_enabled: bool,
    closed: bool,
}

/// Mock host link. Clones share the same queues, so a test keeps one
/// handle while the bridge owns the other.
#[derive(Clone, Default)]
pub struct MockHostPort {
    inner: Arc<Mutex<HostInner>>,
}

impl MockHostPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the bridge to receive.
    pub fn push(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().rx.extend(bytes);
    }

    /// Everything the bridge has transmitted so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().tx.clone()
    }

    /// Drain the transmit capture.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().tx)
    }

    /// Baud rates applied, in order.
    pub fn baud_changes(&self) -> Vec<u32> {
        self.inner.lock().unwrap().baud_log.clone()
    }

    pub fn is_tx_enabled(&self) -> bool {
        self.inner.lock().unwrap().tx_enabled
    }

    /// Simulate the host hanging up.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }
}

impl HostPort for MockHostPort {
    fn get(&mut self) -> Result<Option<u8>, WireError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(WireError::Closed);
        }
        Ok(inner.rx.pop_front())
    }

    fn put(&mut self, data: &[u8]) -> Result<(), WireError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(WireError::Closed);
        }
        inner.tx.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WireError> {
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), WireError> {
        self.inner.lock().unwrap().baud_log.push(baud);
        Ok(())
    }

    fn tx_enable(&mut self) -> Result<(), WireError> {
        self.inner.lock().unwrap().tx_enabled = true;
        Ok(())
    }

    fn tx_disable(&mut self) -> Result<(), WireError> {
        self.inner.lock().unwrap().tx_enabled = false;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Clock and control lines
// ----------------------------------------------------------------------------

/// Deterministic clock. Delays advance simulated time, so poll loops that
/// sleep between probes run a timeout down without wall-clock waiting.
#[derive(Clone, Default)]
pub struct MockClock {
    micros: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.micros.fetch_add(ms * 1_000, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn millis(&self) -> u64 {
        self.micros.load(Ordering::SeqCst) / 1_000
    }

    fn delay_ms(&self, ms: u32) {
        self.micros.fetch_add(ms as u64 * 1_000, Ordering::SeqCst);
    }

    fn delay_us(&self, us: u32) {
        self.micros.fetch_add(us as u64, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    Trst(bool),
    Pgen(bool),
    Hvp(bool),
    Hven(bool),
    TdirPush,
    TdirPull,
}

/// Records every control-line transition.
#[derive(Clone, Default)]
pub struct MockPins {
    log: Arc<Mutex<Vec<PinEvent>>>,
}

impl MockPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PinEvent> {
        self.log.lock().unwrap().clone()
    }
}

impl ControlLines for MockPins {
    fn trst(&mut self, asserted: bool) -> Result<(), WireError> {
        self.log.lock().unwrap().push(PinEvent::Trst(asserted));
        Ok(())
    }

    fn pgen(&mut self, on: bool) -> Result<(), WireError> {
        self.log.lock().unwrap().push(PinEvent::Pgen(on));
        Ok(())
    }

    fn hvp(&mut self, on: bool) -> Result<(), WireError> {
        self.log.lock().unwrap().push(PinEvent::Hvp(on));
        Ok(())
    }

    fn hven(&mut self, on: bool) -> Result<(), WireError> {
        self.log.lock().unwrap().push(PinEvent::Hven(on));
        Ok(())
    }

    fn tdir_push(&mut self) -> Result<(), WireError> {
        self.log.lock().unwrap().push(PinEvent::TdirPush);
        Ok(())
    }

    fn tdir_pull(&mut self) -> Result<(), WireError> {
        self.log.lock().unwrap().push(PinEvent::TdirPull);
        Ok(())
    }
}

/// Latched cancel signal a test can raise at any point.
#[derive(Clone, Default)]
pub struct MockEdge {
    pending: Arc<AtomicBool>,
}

impl MockEdge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }
}

impl EdgeSignal for MockEdge {
    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Device simulator
// ----------------------------------------------------------------------------

/// Instruction-stream parser state.
enum Decode {
    /// Between instructions, waiting for a SYNCH.
    Idle,
    /// SYNCH seen, next byte is the instruction.
    Opcode,
    /// Collecting a 3-byte address, then answering one data byte.
    LdsAddr { addr: u32, got: u8 },
    /// Collecting a 3-byte address for a direct store.
    StsAddr { addr: u32, got: u8 },
    /// Address acknowledged, next byte is the store data.
    StsData { addr: u32 },
    /// Collecting a 3-byte pointer-register value.
    PtrAddr { addr: u32, got: u8 },
    /// Repeated pointer-store data phase.
    StData { word: bool, lo: Option<u8>, units_left: u16 },
    /// STCS operand.
    Stcs { reg: u8 },
    /// KEY payload (8 bytes).
    Key { buf: [u8; 8], got: u8 },
    /// REPEAT operand.
    Repeat,
}

struct TargetInner {
    rx: VecDeque<u8>,
    state: Decode,
    cs: [u8; 16],
    mem: HashMap<u32, u8>,
    store_log: Vec<(u32, u8)>,
    sib: [u8; 32],
    ptr: u32,
    repeat: u16,
    locked: bool,
    erase_armed: bool,
    nvmprog_armed: bool,
    urow_armed: bool,
    in_reset: bool,
    updi_enabled: bool,
    responsive: bool,
    corrupt_echo: bool,
    break_count: u32,
}

impl TargetInner {
    fn read_mem(&self, addr: u32) -> u8 {
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    fn store(&mut self, addr: u32, data: u8) {
        self.mem.insert(addr, data);
        self.store_log.push((addr, data));
    }

    fn rsd_active(&self) -> bool {
        self.cs[CS_CTRLA as usize] & CTRLA_RSD != 0
    }

    fn sync_lock_bit(&mut self) {
        if self.locked {
            self.cs[CS_ASI_SYS_STATUS as usize] |= SYS_LOCKSTATUS;
        } else {
            self.cs[CS_ASI_SYS_STATUS as usize] &= !SYS_LOCKSTATUS;
        }
    }

    fn apply_stcs(&mut self, reg: u8, value: u8) {
        match reg {
            CS_ASI_RESET_REQ => {
                if value == RSTREQ_MAGIC {
                    self.in_reset = true;
                    self.cs[CS_ASI_SYS_STATUS as usize] |= SYS_RSTSYS;
                    self.cs[CS_ASI_SYS_STATUS as usize] &= !(SYS_NVMPROG | SYS_UROWPROG);
                } else if self.in_reset {
                    self.in_reset = false;
                    self.cs[CS_ASI_SYS_STATUS as usize] &= !SYS_RSTSYS;
                    if self.erase_armed {
                        self.erase_armed = false;
                        self.cs[CS_ASI_KEY_STATUS as usize] &= !KEY_CHIPERASE;
                        self.locked = false;
                        // Signature space survives a chip erase.
                        self.mem.retain(|&a, _| (0x1100..0x1200).contains(&a));
                    }
                    if self.nvmprog_armed {
                        self.nvmprog_armed = false;
                        self.cs[CS_ASI_KEY_STATUS as usize] &= !KEY_NVMPROG;
                        if !self.locked {
                            self.cs[CS_ASI_SYS_STATUS as usize] |= SYS_NVMPROG;
                        }
                    }
                    if self.urow_armed {
                        self.urow_armed = false;
                        self.cs[CS_ASI_SYS_STATUS as usize] |= SYS_UROWPROG;
                    }
                    self.sync_lock_bit();
                }
            }
            CS_CTRLB => {
                self.cs[reg as usize] = value;
                if value & CTRLB_UPDIDIS != 0 {
                    self.updi_enabled = false;
                }
            }
            CS_ASI_SYS_CTRLA => {
                self.cs[reg as usize] = value;
                if value & SYS_CTRLA_UROWWRITE_FINAL != 0 {
                    self.cs[CS_ASI_SYS_STATUS as usize] &= !SYS_UROWPROG;
                }
            }
            // Writing a set bit to the key-status register clears the key.
            CS_ASI_KEY_STATUS => {
                self.cs[reg as usize] &= !value;
            }
            _ => {
                if (reg as usize) < self.cs.len() {
                    self.cs[reg as usize] = value;
                }
            }
        }
    }

    fn apply_key(&mut self, payload: &[u8; 8]) {
        if payload == &KEY_NVMPROG_PAYLOAD {
            self.cs[CS_ASI_KEY_STATUS as usize] |= KEY_NVMPROG;
            self.nvmprog_armed = true;
        } else if payload == &KEY_CHIPERASE_PAYLOAD {
            self.cs[CS_ASI_KEY_STATUS as usize] |= KEY_CHIPERASE;
            self.erase_armed = true;
        } else if payload == &KEY_UROWWRITE_PAYLOAD {
            self.cs[CS_ASI_KEY_STATUS as usize] |= KEY_UROWWRITE;
            self.urow_armed = true;
        }
    }

    /// Advance the parser with one received byte, appending any device
    /// response bytes to `rx`.
    fn feed(&mut self, byte: u8) {
        match std::mem::replace(&mut self.state, Decode::Idle) {
            Decode::Idle => {
                if byte == SYNCH {
                    self.state = Decode::Opcode;
                }
            }
            Decode::Opcode => self.decode_opcode(byte),
            Decode::LdsAddr { addr, got } => {
                let addr = addr | (byte as u32) << (8 * got);
                if got == 2 {
                    self.rx.push_back(self.read_mem(addr));
                } else {
                    self.state = Decode::LdsAddr { addr, got: got + 1 };
                }
            }
            Decode::StsAddr { addr, got } => {
                let addr = addr | (byte as u32) << (8 * got);
                if got == 2 {
                    self.rx.push_back(ACK);
                    self.state = Decode::StsData { addr };
                } else {
                    self.state = Decode::StsAddr { addr, got: got + 1 };
                }
            }
            Decode::StsData { addr } => {
                self.store(addr, byte);
                self.rx.push_back(ACK);
            }
            Decode::PtrAddr { addr, got } => {
                let addr = addr | (byte as u32) << (8 * got);
                if got == 2 {
                    self.ptr = addr;
                    self.rx.push_back(ACK);
                } else {
                    self.state = Decode::PtrAddr { addr, got: got + 1 };
                }
            }
            Decode::StData {
                word,
                lo,
                units_left,
            } => {
                if word && lo.is_none() {
                    self.state = Decode::StData {
                        word,
                        lo: Some(byte),
                        units_left,
                    };
                    return;
                }
                if let Some(lo) = lo {
                    let ptr = self.ptr;
                    self.store(ptr, lo);
                    self.store(ptr + 1, byte);
                    self.ptr += 2;
                } else {
                    let ptr = self.ptr;
                    self.store(ptr, byte);
                    self.ptr += 1;
                }
                if !self.rsd_active() {
                    self.rx.push_back(ACK);
                }
                if units_left > 1 {
                    self.state = Decode::StData {
                        word,
                        lo: None,
                        units_left: units_left - 1,
                    };
                }
            }
            Decode::Stcs { reg } => {
                self.apply_stcs(reg, byte);
            }
            Decode::Key { mut buf, got } => {
                buf[got as usize] = byte;
                if got == 7 {
                    self.apply_key(&buf);
                } else {
                    self.state = Decode::Key { buf, got: got + 1 };
                }
            }
            Decode::Repeat => {
                self.repeat = byte as u16;
            }
        }
    }

    fn decode_opcode(&mut self, op: u8) {
        let count = self.repeat + 1;
        self.repeat = 0;
        match op & 0xE0 {
            OP_LDS if op == OP_LDS | ADDR3 | DATA1 => {
                self.state = Decode::LdsAddr { addr: 0, got: 0 };
            }
            OP_STS if op == OP_STS | ADDR3 | DATA1 => {
                self.state = Decode::StsAddr { addr: 0, got: 0 };
            }
            OP_LD => {
                // Pointer load with post-increment, byte or word units.
                let word = op & DATA2 != 0;
                let size = if word { 2 } else { 1 };
                for _ in 0..count {
                    for i in 0..size {
                        let b = self.read_mem(self.ptr + i);
                        self.rx.push_back(b);
                    }
                    self.ptr += size;
                }
            }
            OP_ST => {
                if op & PTR_REG != 0 {
                    self.state = Decode::PtrAddr { addr: 0, got: 0 };
                } else {
                    self.state = Decode::StData {
                        word: op & DATA2 != 0,
                        lo: None,
                        units_left: count,
                    };
                }
            }
            OP_LDCS => {
                let reg = (op & 0x0F) as usize;
                self.rx.push_back(self.cs[reg]);
            }
            OP_STCS if op & 0xF0 == OP_STCS => {
                self.state = Decode::Stcs { reg: op & 0x0F };
            }
            OP_REPEAT if op == OP_REPEAT | DATA1 => {
                self.state = Decode::Repeat;
            }
            _ if op == KEY_64 => {
                self.state = Decode::Key {
                    buf: [0; 8],
                    got: 0,
                };
            }
            _ if op == SIB_256 => {
                for b in self.sib {
                    self.rx.push_back(b);
                }
            }
            _ => {}
        }
    }
}

/// Behavioral single-wire device. Shared handle: the bridge owns one
/// clone as its `TargetPort`, the test keeps another for setup and probes.
#[derive(Clone)]
pub struct MockTarget {
    inner: Arc<Mutex<TargetInner>>,
}

impl Default for MockTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTarget {
    pub fn new() -> Self {
        let mut sib = [b' '; 32];
        sib[..31].copy_from_slice(b"tinyAVR P:2D:0-3M2 (01.59B14.0)");
        Self {
            inner: Arc::new(Mutex::new(TargetInner {
                rx: VecDeque::new(),
                state: Decode::Idle,
                cs: [0; 16],
                mem: HashMap::new(),
                store_log: Vec::new(),
                sib,
                ptr: 0,
                repeat: 0,
                locked: false,
                erase_armed: false,
                nvmprog_armed: false,
                urow_armed: false,
                in_reset: false,
                updi_enabled: true,
                responsive: true,
                corrupt_echo: false,
                break_count: 0,
            })),
        }
    }

    /// Replace the programming-interface version character in the SIB.
    pub fn set_nvm_version(&self, tag: u8) {
        self.inner.lock().unwrap().sib[10] = tag;
    }

    /// Corrupt the SIB so bring-up sees an unrecognizable device.
    pub fn set_bad_sib(&self) {
        self.inner.lock().unwrap().sib = [0xFF; 32];
    }

    pub fn set_locked(&self, locked: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.locked = locked;
        inner.sync_lock_bit();
    }

    /// When false the device never drives the wire; only the transmit
    /// echo comes back.
    pub fn set_responsive(&self, responsive: bool) {
        self.inner.lock().unwrap().responsive = responsive;
    }

    pub fn set_mem(&self, addr: u32, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        for (i, &b) in data.iter().enumerate() {
            inner.mem.insert(addr + i as u32, b);
        }
    }

    pub fn mem_at(&self, addr: u32, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        (0..len).map(|i| inner.read_mem(addr + i as u32)).collect()
    }

    /// Every data-space store the device has accepted, in order.
    pub fn stores(&self) -> Vec<(u32, u8)> {
        self.inner.lock().unwrap().store_log.clone()
    }

    /// Values written to one data-space address, in order. Pointed at the
    /// controller's command register this is the command sequence a
    /// programming operation issued.
    pub fn stores_to(&self, addr: u32) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap()
            .store_log
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|&(_, v)| v)
            .collect()
    }

    pub fn clear_stores(&self) {
        self.inner.lock().unwrap().store_log.clear();
    }

    pub fn cs_reg(&self, reg: u8) -> u8 {
        self.inner.lock().unwrap().cs[reg as usize]
    }

    pub fn is_updi_enabled(&self) -> bool {
        self.inner.lock().unwrap().updi_enabled
    }

    pub fn break_count(&self) -> u32 {
        self.inner.lock().unwrap().break_count
    }

    /// Flip a bit in the next transmit echo, as if another driver pulled
    /// the shared wire during that byte.
    pub fn corrupt_next_echo(&self) {
        self.inner.lock().unwrap().corrupt_echo = true;
    }
}

impl TargetPort for MockTarget {
    fn send(&mut self, data: &[u8]) -> Result<(), WireError> {
        let mut inner = self.inner.lock().unwrap();
        for &byte in data {
            // The shared wire echoes the transmitter's own bytes.
            let echo = if inner.corrupt_echo {
                inner.corrupt_echo = false;
                byte ^ 0x10
            } else {
                byte
            };
            inner.rx.push_back(echo);
            if inner.responsive && inner.updi_enabled {
                inner.feed(byte);
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<u8>, WireError> {
        Ok(self.inner.lock().unwrap().rx.pop_front())
    }

    fn send_break(&mut self, _long: bool) -> Result<(), WireError> {
        let mut inner = self.inner.lock().unwrap();
        inner.break_count += 1;
        inner.state = Decode::Idle;
        inner.repeat = 0;
        if inner.responsive {
            inner.updi_enabled = true;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), WireError> {
        self.inner.lock().unwrap().rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(t: &mut MockTarget) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = t.poll().unwrap() {
            out.push(b);
        }
        out
    }

    #[test]
    fn every_sent_byte_is_echoed() {
        let mut t = MockTarget::new();
        t.set_responsive(false);
        t.send(&[0x55, 0x80, 0x12]).unwrap();
        assert_eq!(drain_all(&mut t), vec![0x55, 0x80, 0x12]);
    }

    #[test]
    fn ldcs_answers_after_the_echo() {
        let mut t = MockTarget::new();
        t.set_locked(true);
        t.send(&[SYNCH, OP_LDCS | CS_ASI_SYS_STATUS]).unwrap();
        let bytes = drain_all(&mut t);
        assert_eq!(bytes[..2], [SYNCH, OP_LDCS | CS_ASI_SYS_STATUS]);
        assert_eq!(bytes[2] & SYS_LOCKSTATUS, SYS_LOCKSTATUS);
    }

    #[test]
    fn direct_store_acknowledges_address_and_data() {
        let mut t = MockTarget::new();
        t.send(&[SYNCH, OP_STS | ADDR3 | DATA1, 0x00, 0x10, 0x00])
            .unwrap();
        let after_addr = drain_all(&mut t);
        assert_eq!(*after_addr.last().unwrap(), ACK);

        t.send(&[0x4D]).unwrap();
        let after_data = drain_all(&mut t);
        assert_eq!(after_data, vec![0x4D, ACK]);
        assert_eq!(t.stores_to(0x1000), vec![0x4D]);
    }

    #[test]
    fn key_then_reset_cycle_grants_programming() {
        let mut t = MockTarget::new();
        let mut seq = vec![SYNCH, KEY_64];
        seq.extend_from_slice(&KEY_NVMPROG_PAYLOAD);
        t.send(&seq).unwrap();
        assert_eq!(t.cs_reg(CS_ASI_KEY_STATUS) & KEY_NVMPROG, KEY_NVMPROG);

        t.send(&[SYNCH, OP_STCS | CS_ASI_RESET_REQ, RSTREQ_MAGIC])
            .unwrap();
        t.send(&[SYNCH, OP_STCS | CS_ASI_RESET_REQ, 0x00]).unwrap();
        assert_eq!(t.cs_reg(CS_ASI_SYS_STATUS) & SYS_NVMPROG, SYS_NVMPROG);
    }

    #[test]
    fn repeated_word_store_suppresses_acks_when_rsd_is_set() {
        let mut t = MockTarget::new();
        t.send(&[SYNCH, OP_STCS | CS_CTRLA, CTRLA_RSD | CTRLA_GTVAL_2])
            .unwrap();
        // Pointer to 0x8000, repeat 1 (two words), word stores.
        t.send(&[SYNCH, OP_ST | PTR_REG | DATA3, 0x00, 0x80, 0x00])
            .unwrap();
        t.send(&[SYNCH, OP_REPEAT | DATA1, 1]).unwrap();
        t.drain().unwrap();
        t.send(&[SYNCH, OP_ST | PTR_INC | DATA2, 0x11, 0x22, 0x33, 0x44])
            .unwrap();
        let bytes = drain_all(&mut t);
        assert!(!bytes.contains(&ACK));
        assert_eq!(t.mem_at(0x8000, 4), vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn unresponsive_target_still_echoes_but_never_answers() {
        let mut t = MockTarget::new();
        t.set_responsive(false);
        t.send(&[SYNCH, OP_LDCS | CS_ASI_SYS_STATUS]).unwrap();
        assert_eq!(
            drain_all(&mut t),
            vec![SYNCH, OP_LDCS | CS_ASI_SYS_STATUS]
        );
    }
}
