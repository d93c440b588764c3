//! Memory engine: routes host memory-type reads and writes onto the
//! device link through the bound controller dialect.

pub mod dialect;

use thiserror::Error;
use tracing::debug;

use crate::link::constants::{DATA1, DATA2, OP_LD};
use crate::link::{LinkError, UpdiLink};
use crate::protocol::constants::*;
use crate::supervisor::{Cancelled, Supervisor};

pub use dialect::{dialect_for, NvmDialect};

/// Memory controller register block base.
pub const BASE_NVMCTRL: u32 = 0x1000;

/// Signature row base; the three device signature bytes live at the
/// start of it.
pub const BASE_SIGROW: u32 = 0x1100;

#[derive(Error, Debug)]
pub enum NvmError {
    #[error("link: {0}")]
    Link(#[from] LinkError),

    #[error("controller reported status 0x{status:02X}")]
    Fault { status: u8 },
}

impl From<Cancelled> for NvmError {
    fn from(c: Cancelled) -> Self {
        NvmError::Link(LinkError::Cancelled(c))
    }
}

impl NvmError {
    pub fn cancelled(&self) -> Option<Cancelled> {
        match self {
            NvmError::Link(err) => err.cancelled(),
            NvmError::Fault { .. } => None,
        }
    }
}

fn is_flash_type(mtype: u8) -> bool {
    matches!(mtype, MTYPE_XMEGA_FLASH | MTYPE_BOOT_FLASH)
}

/// Memory types this engine can read.
pub fn readable(mtype: u8) -> bool {
    is_flash_type(mtype)
        || matches!(
            mtype,
            MTYPE_EEPROM
                | MTYPE_FUSE_BITS
                | MTYPE_LOCK_BITS
                | MTYPE_SIGN_JTAG
                | MTYPE_OSCCAL_BYTE
                | MTYPE_EEPROM_XMEGA
                | MTYPE_USERSIG
                | MTYPE_PRODSIG
        )
}

/// Memory types this engine can write.
pub fn writable(mtype: u8) -> bool {
    is_flash_type(mtype)
        || matches!(
            mtype,
            MTYPE_EEPROM | MTYPE_EEPROM_XMEGA | MTYPE_FUSE_BITS | MTYPE_LOCK_BITS | MTYPE_USERSIG
        )
}

/// Largest read this engine accepts for a memory type.
pub fn max_read_len(mtype: u8) -> usize {
    if is_flash_type(mtype) { 512 } else { 256 }
}

/// Bulk read into `out`. Flash reads of even length go word-at-a-time;
/// everything else (and odd flash lengths) goes through byte loads, split
/// into repeat-sized bursts.
pub fn read_memory(
    link: &mut UpdiLink,
    sup: &Supervisor,
    mtype: u8,
    addr: u32,
    out: &mut [u8],
) -> Result<(), NvmError> {
    debug!(mtype, addr, len = out.len(), "read");
    if is_flash_type(mtype) && out.len() % 2 == 0 {
        link.send_repeat_header(sup, OP_LD | DATA2, addr, out.len() / 2)?;
        for slot in out.iter_mut() {
            *slot = link.recv(sup)?;
        }
        return Ok(());
    }
    let mut at = addr;
    for chunk in out.chunks_mut(256) {
        link.send_repeat_header(sup, OP_LD | DATA1, at, chunk.len())?;
        for slot in chunk.iter_mut() {
            *slot = link.recv(sup)?;
        }
        at += chunk.len() as u32;
    }
    Ok(())
}

/// Bulk write dispatched by memory type through the bound dialect.
///
/// Flash goes page-at-a-time; the per-page erase is skipped when the
/// session already ran a chip erase. Single-byte fuse and lock writes use
/// the dialect's fuse path, longer lock writes fall back to the
/// EEPROM path. User row writes use the dialect's native encoding inside
/// a programming session and the key-gated staging sequence otherwise.
pub fn write_memory(
    link: &mut UpdiLink,
    sup: &Supervisor,
    dialect: &dyn NvmDialect,
    mtype: u8,
    addr: u32,
    data: &[u8],
    page_size: u16,
) -> Result<(), NvmError> {
    debug!(mtype, addr, len = data.len(), "write");
    match mtype {
        MTYPE_XMEGA_FLASH | MTYPE_BOOT_FLASH => {
            let page_aligned = page_size > 0 && addr % page_size as u32 == 0;
            let erase_first = !link.state.chip_erased;
            dialect.write_flash_page(link, sup, addr, data, page_aligned, erase_first)
        }
        MTYPE_FUSE_BITS => dialect.write_fuse(link, sup, addr, data[0]),
        MTYPE_LOCK_BITS => {
            if data.len() == 1 {
                dialect.write_fuse(link, sup, addr, data[0])
            } else {
                dialect.write_eeprom(link, sup, addr, data)
            }
        }
        MTYPE_USERSIG => {
            if link.state.prog_enabled {
                dialect.write_user_row(link, sup, addr, data)
            } else {
                link.write_user_row(sup, addr, data)?;
                Ok(())
            }
        }
        _ => dialect.write_eeprom(link, sup, addr, data),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::dialect::NVM_REG_CTRLA;
    use super::*;
    use crate::link::{LinkTuning, UpdiLink};
    use crate::supervisor::Supervisor;
    use crate::transport::mock::{MockClock, MockEdge, MockPins, MockTarget};

    fn programming_session(target: &MockTarget) -> (UpdiLink, Supervisor) {
        let clock = MockClock::new();
        let mut link = UpdiLink::new(
            Box::new(target.clone()),
            Box::new(MockPins::new()),
            Arc::new(clock.clone()),
            LinkTuning::default(),
        );
        let mut sup = Supervisor::new(Arc::new(clock), Arc::new(MockEdge::new()));
        link.enter_link(&mut sup).unwrap();
        sup.arm(1200);
        link.enter_programming(&sup).unwrap();
        target.clear_stores();
        (link, sup)
    }

    #[test]
    fn even_flash_read_returns_the_stored_bytes() {
        let target = MockTarget::new();
        target.set_mem(0x8000, &[1, 2, 3, 4, 5, 6]);
        let (mut link, sup) = programming_session(&target);

        let mut out = [0u8; 6];
        read_memory(&mut link, &sup, MTYPE_XMEGA_FLASH, 0x8000, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn odd_flash_read_uses_the_byte_path() {
        let target = MockTarget::new();
        target.set_mem(0x8000, &[9, 8, 7]);
        let (mut link, sup) = programming_session(&target);

        let mut out = [0u8; 3];
        read_memory(&mut link, &sup, MTYPE_XMEGA_FLASH, 0x8000, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);
    }

    #[test]
    fn long_odd_flash_read_is_split_into_repeat_sized_bursts() {
        let target = MockTarget::new();
        let data: Vec<u8> = (0..511u32).map(|i| (i % 251) as u8).collect();
        target.set_mem(0x8000, &data);
        let (mut link, sup) = programming_session(&target);

        let mut out = vec![0u8; 511];
        read_memory(&mut link, &sup, MTYPE_XMEGA_FLASH, 0x8000, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn v2_aligned_flash_write_erases_the_page_first() {
        let target = MockTarget::new();
        let (mut link, sup) = programming_session(&target);
        let d = dialect_for(b'2').unwrap();

        let page = [0xAAu8; 64];
        write_memory(&mut link, &sup, d, MTYPE_XMEGA_FLASH, 0x8000, &page, 64).unwrap();

        let cmds = target.stores_to(NVM_REG_CTRLA);
        let pos_erase = cmds.iter().position(|&c| c == 0x08);
        let pos_write = cmds.iter().position(|&c| c == 0x02);
        assert!(pos_erase.is_some(), "page erase missing: {cmds:?}");
        assert!(pos_erase < pos_write);
        assert_eq!(target.mem_at(0x8000, 64), page.to_vec());
    }

    #[test]
    fn page_erase_is_suppressed_after_a_chip_erase() {
        let target = MockTarget::new();
        let (mut link, sup) = programming_session(&target);
        link.state.chip_erased = true;
        let d = dialect_for(b'2').unwrap();

        let page = [0x55u8; 64];
        write_memory(&mut link, &sup, d, MTYPE_XMEGA_FLASH, 0x8000, &page, 64).unwrap();
        assert!(!target.stores_to(NVM_REG_CTRLA).contains(&0x08));
    }

    #[test]
    fn unaligned_flash_write_skips_the_page_erase() {
        let target = MockTarget::new();
        let (mut link, sup) = programming_session(&target);
        let d = dialect_for(b'2').unwrap();

        write_memory(&mut link, &sup, d, MTYPE_XMEGA_FLASH, 0x8020, &[0u8; 64], 64).unwrap();
        assert!(!target.stores_to(NVM_REG_CTRLA).contains(&0x08));
    }

    #[test]
    fn generation_0_uses_only_generation_0_commands() {
        let target = MockTarget::new();
        target.set_nvm_version(b'0');
        let (mut link, sup) = programming_session(&target);
        let d = dialect_for(b'0').unwrap();

        write_memory(&mut link, &sup, d, MTYPE_XMEGA_FLASH, 0x8000, &[0u8; 64], 64).unwrap();
        write_memory(&mut link, &sup, d, MTYPE_EEPROM, 0x1400, &[1, 2], 64).unwrap();
        write_memory(&mut link, &sup, d, MTYPE_FUSE_BITS, 0x1280, &[0xC8], 64).unwrap();

        let cmds = target.stores_to(NVM_REG_CTRLA);
        assert!(!cmds.is_empty());
        assert!(cmds.iter().all(|&c| c <= 0x07), "foreign command: {cmds:?}");
    }

    #[test]
    fn generation_0_flash_commit_always_erases_and_writes() {
        let target = MockTarget::new();
        target.set_nvm_version(b'0');
        let (mut link, sup) = programming_session(&target);
        link.state.chip_erased = true;
        let d = dialect_for(b'0').unwrap();

        write_memory(&mut link, &sup, d, MTYPE_XMEGA_FLASH, 0x8000, &[0u8; 64], 64).unwrap();
        let cmds = target.stores_to(NVM_REG_CTRLA);
        assert!(cmds.contains(&0x03), "erase-write-page missing: {cmds:?}");
        assert!(!cmds.contains(&0x01), "plain write-page used: {cmds:?}");
    }

    #[test]
    fn generation_3_uses_its_combined_commit_commands() {
        let target = MockTarget::new();
        target.set_nvm_version(b'3');
        let (mut link, sup) = programming_session(&target);
        let d = dialect_for(b'3').unwrap();

        write_memory(&mut link, &sup, d, MTYPE_XMEGA_FLASH, 0x8000, &[0u8; 64], 64).unwrap();
        let cmds = target.stores_to(NVM_REG_CTRLA);
        assert!(cmds.contains(&0x05), "erase-write-page missing: {cmds:?}");
        assert!(!cmds.contains(&0x02), "generation-2 command leaked: {cmds:?}");
    }

    #[test]
    fn fuse_write_on_generation_0_goes_through_the_register_pair() {
        let target = MockTarget::new();
        target.set_nvm_version(b'0');
        let (mut link, sup) = programming_session(&target);
        let d = dialect_for(b'0').unwrap();

        write_memory(&mut link, &sup, d, MTYPE_FUSE_BITS, 0x1282, &[0xC8], 64).unwrap();
        // Data register pair at 0x1006: value, zero, address low, address high.
        assert_eq!(target.stores_to(0x1006), vec![0xC8]);
        assert_eq!(target.stores_to(0x1008), vec![0x82]);
        assert_eq!(target.stores_to(0x1009), vec![0x12]);
        assert_eq!(target.stores_to(NVM_REG_CTRLA), vec![0x07]);
    }
}
