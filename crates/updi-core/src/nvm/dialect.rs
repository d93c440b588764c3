//! Controller generation dialects.
//!
//! Three generations of the on-chip memory controller share a command
//! register at the same address but disagree on the status register
//! location, the command vocabulary and the required write choreography.
//! Each generation is a strategy object selected once at attach time from
//! the information block's version character; no generation branching
//! happens anywhere in the call tree after that.

use tracing::trace;

use super::NvmError;
use crate::link::constants::{CS_CTRLA, CTRLA_RSD, DATA2, OP_ST};
use crate::link::UpdiLink;
use crate::supervisor::Supervisor;

/// Command register, common to all generations.
pub const NVM_REG_CTRLA: u32 = 0x1000;

// Generation 0 register and command set.
const V0_REG_STATUS: u32 = 0x1002;
const V0_REG_DATA: u32 = 0x1006;
const V0_CMD_ERWP: u8 = 0x03;
const V0_CMD_PBC: u8 = 0x04;
const V0_CMD_CHER: u8 = 0x05;
const V0_CMD_WFU: u8 = 0x07;

// Generation 2 register and command set.
const V2_REG_STATUS: u32 = 0x1002;
const V2_CMD_NOCMD: u8 = 0x00;
const V2_CMD_FLWR: u8 = 0x02;
const V2_CMD_FLPER: u8 = 0x08;
const V2_CMD_EEERWR: u8 = 0x13;
const V2_CMD_CHER: u8 = 0x20;

// Generation 3 register and command set.
const V3_REG_STATUS: u32 = 0x1006;
const V3_CMD_NOCMD: u8 = 0x00;
const V3_CMD_FLPW: u8 = 0x04;
const V3_CMD_FLPERW: u8 = 0x05;
const V3_CMD_EEPERW: u8 = 0x15;
const V3_CMD_CHER: u8 = 0x20;

/// Busy bits in the status register, all generations.
const STATUS_BUSY: u8 = 0x03;

/// The idle command, all generations.
const CMD_NOCMD: u8 = 0x00;

/// One memory-controller generation.
pub trait NvmDialect: Sync {
    /// Version character this dialect answers to.
    fn tag(&self) -> u8;

    /// Write one flash page. `data` is even-length; `page_aligned` and
    /// `erase_first` decide whether the page is erased before the write
    /// (a fresh chip erase makes per-page erases pointless).
    fn write_flash_page(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
        page_aligned: bool,
        erase_first: bool,
    ) -> Result<(), NvmError>;

    /// Byte-granular erase-and-write for the EEPROM-like spaces.
    fn write_eeprom(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), NvmError>;

    /// Single fuse byte write.
    fn write_fuse(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: u8,
    ) -> Result<(), NvmError>;

    /// Controller-command chip erase, for an already-unlocked session.
    fn chip_erase(&self, link: &mut UpdiLink, sup: &Supervisor) -> Result<(), NvmError>;

    /// User-row write inside an unlocked programming session. EEPROM-like
    /// on the oldest generation, flash-like on the newer ones.
    fn write_user_row(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        self.write_eeprom(link, sup, addr, data)
    }
}

/// Select the dialect for an information-block version character.
pub fn dialect_for(tag: u8) -> Option<&'static dyn NvmDialect> {
    match tag {
        b'0' => Some(&DialectV0),
        b'2' => Some(&DialectV2),
        b'3' => Some(&DialectV3),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Shared choreography
// ----------------------------------------------------------------------------

/// Poll the status register until the controller is idle.
fn wait_idle(
    link: &mut UpdiLink,
    sup: &Supervisor,
    status_reg: u32,
) -> Result<u8, NvmError> {
    loop {
        let status = link.ld8(sup, status_reg)?;
        if status & STATUS_BUSY == 0 {
            return Ok(status);
        }
        sup.poll_pause()?;
    }
}

/// Commit check: an idle controller with any error bit set failed.
fn finish(link: &mut UpdiLink, sup: &Supervisor, status_reg: u32) -> Result<(), NvmError> {
    let status = wait_idle(link, sup, status_reg)?;
    if status != 0 {
        return Err(NvmError::Fault { status });
    }
    Ok(())
}

fn command(link: &mut UpdiLink, sup: &Supervisor, cmd: u8) -> Result<(), NvmError> {
    trace!(cmd, "controller command");
    link.st8(sup, NVM_REG_CTRLA, cmd)?;
    Ok(())
}

/// Guarded command arm for the command-latching generations: wait idle,
/// skip if the command is already latched, otherwise go through the idle
/// command first.
fn guarded_command(
    link: &mut UpdiLink,
    sup: &Supervisor,
    status_reg: u32,
    cmd: u8,
) -> Result<(), NvmError> {
    wait_idle(link, sup, status_reg)?;
    if link.ld8(sup, NVM_REG_CTRLA)? == cmd {
        return Ok(());
    }
    command(link, sup, CMD_NOCMD)?;
    if cmd != CMD_NOCMD {
        command(link, sup, cmd)?;
    }
    Ok(())
}

/// Stream words into the page buffer with response signatures disabled.
/// Twice the wire throughput; correctness is re-checked by the commit
/// status afterwards.
fn fill_words_unacked(
    link: &mut UpdiLink,
    sup: &Supervisor,
    addr: u32,
    data: &[u8],
) -> Result<(), NvmError> {
    link.stcs(sup, CS_CTRLA, CTRLA_RSD)?;
    link.send_repeat_header(sup, OP_ST | DATA2, addr, data.len() / 2)?;
    link.send_bytes(sup, data)?;
    link.stcs(sup, CS_CTRLA, 0x00)?;
    Ok(())
}

/// Stream words into the page buffer, acknowledged per word.
fn fill_words_acked(
    link: &mut UpdiLink,
    sup: &Supervisor,
    addr: u32,
    data: &[u8],
) -> Result<(), NvmError> {
    link.send_repeat_header(sup, OP_ST | DATA2, addr, data.len() / 2)?;
    for word in data.chunks_exact(2) {
        link.send(sup, word[0])?;
        link.send(sup, word[1])?;
        link.recv_ack(sup)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Generation 0: page-buffer commands, write-fuse register pair
// ----------------------------------------------------------------------------

pub struct DialectV0;

impl NvmDialect for DialectV0 {
    fn tag(&self) -> u8 {
        b'0'
    }

    fn write_flash_page(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
        _page_aligned: bool,
        _erase_first: bool,
    ) -> Result<(), NvmError> {
        // This generation always commits with the combined
        // erase-and-write command, blank page or not.
        wait_idle(link, sup, V0_REG_STATUS)?;
        command(link, sup, V0_CMD_PBC)?;
        wait_idle(link, sup, V0_REG_STATUS)?;
        fill_words_acked(link, sup, addr, data)?;
        command(link, sup, V0_CMD_ERWP)?;
        finish(link, sup, V0_REG_STATUS)
    }

    fn write_eeprom(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        wait_idle(link, sup, V0_REG_STATUS)?;
        command(link, sup, V0_CMD_PBC)?;
        wait_idle(link, sup, V0_REG_STATUS)?;
        link.sts8(sup, addr, data)?;
        command(link, sup, V0_CMD_ERWP)?;
        finish(link, sup, V0_REG_STATUS)
    }

    fn write_fuse(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: u8,
    ) -> Result<(), NvmError> {
        // The generation-0 controller takes the fuse write as a
        // data/address register pair plus a dedicated command.
        wait_idle(link, sup, V0_REG_STATUS)?;
        let record = [data, 0x00, addr as u8, (addr >> 8) as u8];
        link.sts8(sup, V0_REG_DATA, &record)?;
        command(link, sup, V0_CMD_WFU)?;
        finish(link, sup, V0_REG_STATUS)
    }

    fn chip_erase(&self, link: &mut UpdiLink, sup: &Supervisor) -> Result<(), NvmError> {
        wait_idle(link, sup, V0_REG_STATUS)?;
        command(link, sup, V0_CMD_CHER)?;
        finish(link, sup, V0_REG_STATUS)
    }
}

// ----------------------------------------------------------------------------
// Generation 2: latched write-enable commands, direct writes
// ----------------------------------------------------------------------------

pub struct DialectV2;

impl NvmDialect for DialectV2 {
    fn tag(&self) -> u8 {
        b'2'
    }

    fn write_flash_page(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
        page_aligned: bool,
        erase_first: bool,
    ) -> Result<(), NvmError> {
        if page_aligned && erase_first {
            guarded_command(link, sup, V2_REG_STATUS, V2_CMD_FLPER)?;
            link.st8(sup, addr, 0xFF)?;
        }
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_FLWR)?;
        fill_words_unacked(link, sup, addr, data)?;
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_NOCMD)?;
        finish(link, sup, V2_REG_STATUS)
    }

    fn write_eeprom(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_EEERWR)?;
        link.sts8(sup, addr, data)?;
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_NOCMD)?;
        finish(link, sup, V2_REG_STATUS)
    }

    fn write_fuse(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: u8,
    ) -> Result<(), NvmError> {
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_EEERWR)?;
        link.st8(sup, addr, data)?;
        let status = wait_idle(link, sup, V2_REG_STATUS)?;
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_NOCMD)?;
        if status != 0 {
            return Err(NvmError::Fault { status });
        }
        Ok(())
    }

    fn chip_erase(&self, link: &mut UpdiLink, sup: &Supervisor) -> Result<(), NvmError> {
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_CHER)?;
        let result = finish(link, sup, V2_REG_STATUS);
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_NOCMD)?;
        result
    }

    fn write_user_row(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        // This generation maps the user row as flash: erase its page
        // explicitly, then write without a second erase.
        guarded_command(link, sup, V2_REG_STATUS, V2_CMD_FLPER)?;
        link.st8(sup, addr, 0xFF)?;
        self.write_flash_page(link, sup, addr, data, false, false)
    }
}

// ----------------------------------------------------------------------------
// Generation 3: page-buffer fill, combined erase-write commit commands
// ----------------------------------------------------------------------------

pub struct DialectV3;

impl NvmDialect for DialectV3 {
    fn tag(&self) -> u8 {
        b'3'
    }

    fn write_flash_page(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
        _page_aligned: bool,
        erase_first: bool,
    ) -> Result<(), NvmError> {
        wait_idle(link, sup, V3_REG_STATUS)?;
        fill_words_unacked(link, sup, addr, data)?;
        guarded_command(
            link,
            sup,
            V3_REG_STATUS,
            if erase_first { V3_CMD_FLPERW } else { V3_CMD_FLPW },
        )?;
        let status = wait_idle(link, sup, V3_REG_STATUS)?;
        guarded_command(link, sup, V3_REG_STATUS, V3_CMD_NOCMD)?;
        if status != 0 {
            return Err(NvmError::Fault { status });
        }
        Ok(())
    }

    fn write_eeprom(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        wait_idle(link, sup, V3_REG_STATUS)?;
        link.sts8(sup, addr, data)?;
        guarded_command(link, sup, V3_REG_STATUS, V3_CMD_EEPERW)?;
        let status = wait_idle(link, sup, V3_REG_STATUS)?;
        guarded_command(link, sup, V3_REG_STATUS, V3_CMD_NOCMD)?;
        if status != 0 {
            return Err(NvmError::Fault { status });
        }
        Ok(())
    }

    fn write_fuse(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: u8,
    ) -> Result<(), NvmError> {
        self.write_eeprom(link, sup, addr, &[data])
    }

    fn chip_erase(&self, link: &mut UpdiLink, sup: &Supervisor) -> Result<(), NvmError> {
        guarded_command(link, sup, V3_REG_STATUS, V3_CMD_CHER)?;
        let result = finish(link, sup, V3_REG_STATUS);
        guarded_command(link, sup, V3_REG_STATUS, V3_CMD_NOCMD)?;
        result
    }

    fn write_user_row(
        &self,
        link: &mut UpdiLink,
        sup: &Supervisor,
        addr: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        self.write_flash_page(link, sup, addr, data, true, true)
    }
}
