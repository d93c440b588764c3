//! Single-wire instruction set and control/status register map.

/// Synchronization character opening every instruction.
pub const SYNCH: u8 = 0x55;

/// Acknowledge returned by the device after a store phase.
pub const ACK: u8 = 0x40;

// ============================================================================
// Instruction opcodes (upper bits; size and pointer fields OR in below)
// ============================================================================

pub const OP_LDS: u8 = 0x00;
pub const OP_STS: u8 = 0x40;
pub const OP_LD: u8 = 0x20;
pub const OP_ST: u8 = 0x60;
pub const OP_LDCS: u8 = 0x80;
pub const OP_STCS: u8 = 0xC0;
pub const OP_REPEAT: u8 = 0xA0;

/// 64-bit key transfer.
pub const KEY_64: u8 = 0xE0;

/// System information block request, 256-bit (32 byte) response.
pub const SIB_256: u8 = 0xE6;

/// Guard value written to the reset request register to hold reset.
pub const RSTREQ_MAGIC: u8 = 0x59;

// Address size field.
pub const ADDR3: u8 = 0x08;

// Data size field.
pub const DATA1: u8 = 0x00;
pub const DATA2: u8 = 0x01;
pub const DATA3: u8 = 0x02;

// Pointer access mode field.
pub const PTR_INC: u8 = 0x04;
pub const PTR_REG: u8 = 0x08;

// ============================================================================
// Control/status register space (LDCS/STCS)
// ============================================================================

pub const CS_STATUSA: u8 = 0x00;
pub const CS_STATUSB: u8 = 0x01;
pub const CS_CTRLA: u8 = 0x02;
pub const CS_CTRLB: u8 = 0x03;
pub const CS_ASI_KEY_STATUS: u8 = 0x07;
pub const CS_ASI_RESET_REQ: u8 = 0x08;
pub const CS_ASI_CTRLA: u8 = 0x09;
pub const CS_ASI_SYS_CTRLA: u8 = 0x0A;
pub const CS_ASI_SYS_STATUS: u8 = 0x0B;

// ASI_KEY_STATUS bits.
pub const KEY_UROWWRITE: u8 = 0x20;
pub const KEY_NVMPROG: u8 = 0x10;
pub const KEY_CHIPERASE: u8 = 0x08;

// ASI_SYS_STATUS bits.
pub const SYS_RSTSYS: u8 = 0x20;
pub const SYS_INSLEEP: u8 = 0x10;
pub const SYS_NVMPROG: u8 = 0x08;
pub const SYS_UROWPROG: u8 = 0x04;
pub const SYS_LOCKSTATUS: u8 = 0x01;

// CTRLA bits.
pub const CTRLA_RSD: u8 = 0x08;
pub const CTRLA_GTVAL_2: u8 = 0x06;

// CTRLB bits.
pub const CTRLB_UPDIDIS: u8 = 0x04;
pub const CTRLB_CCDETDIS: u8 = 0x08;

// ASI_SYS_CTRLA bits.
pub const SYS_CTRLA_UROWWRITE_FINAL: u8 = 0x02;
pub const SYS_CTRLA_CLKREQ: u8 = 0x01;

// ============================================================================
// Activation key payloads (64-bit, wire order)
// ============================================================================

pub const KEY_NVMPROG_PAYLOAD: [u8; 8] = [0x20, 0x67, 0x6F, 0x72, 0x50, 0x4D, 0x56, 0x4E];
pub const KEY_CHIPERASE_PAYLOAD: [u8; 8] = [0x65, 0x73, 0x61, 0x72, 0x45, 0x4D, 0x56, 0x4E];
pub const KEY_UROWWRITE_PAYLOAD: [u8; 8] = [0x65, 0x74, 0x26, 0x73, 0x55, 0x4D, 0x56, 0x4E];

/// Wake byte driven after the high-voltage pulse train.
pub const HV_HANDSHAKE: u8 = 0xFE;
