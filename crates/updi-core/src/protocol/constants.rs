//! Host protocol constants.
//!
//! Command, response, parameter and memory-type identifiers for the framed
//! serial debug protocol spoken with the controlling host, plus the fixed
//! baud-rate table the host negotiates against.

// ============================================================================
// Frame markers
// ============================================================================

/// Start-of-frame marker (first byte of every frame).
pub const MESSAGE_START: u8 = 0x1B;

/// Token byte separating the header from the body.
pub const TOKEN: u8 = 0x0E;

/// Maximum body length a frame may declare.
pub const MAX_BODY_SIZE: usize = 512 + 4 + 4 + 1;

/// Header bytes preceding the body: START + SEQ(2) + LEN(4) + TOKEN.
pub const HEADER_SIZE: usize = 8;

/// Trailing CRC bytes.
pub const CRC_SIZE: usize = 2;

// ============================================================================
// Command identifiers (host -> bridge, body byte 0)
// ============================================================================

pub const CMND_SIGN_OFF: u8 = 0x00;
pub const CMND_GET_SIGN_ON: u8 = 0x01;
pub const CMND_SET_PARAMETER: u8 = 0x02;
pub const CMND_GET_PARAMETER: u8 = 0x03;
pub const CMND_WRITE_MEMORY: u8 = 0x04;
pub const CMND_READ_MEMORY: u8 = 0x05;
pub const CMND_GO: u8 = 0x08;
pub const CMND_RESET: u8 = 0x0B;
pub const CMND_SET_DEVICE_DESCRIPTOR: u8 = 0x0C;
pub const CMND_GET_SYNC: u8 = 0x0F;
pub const CMND_ENTER_PROGMODE: u8 = 0x14;
pub const CMND_LEAVE_PROGMODE: u8 = 0x15;
pub const CMND_XMEGA_ERASE: u8 = 0x34;

// ============================================================================
// Response identifiers (bridge -> host, body byte 0)
// ============================================================================

pub const RSP_OK: u8 = 0x80;
pub const RSP_PARAMETER: u8 = 0x81;
pub const RSP_MEMORY: u8 = 0x82;
pub const RSP_SIGN_ON: u8 = 0x86;

/// Every response id at or above this value is an error and sets the
/// session's last-answer-failed flag.
pub const RSP_FAILED: u8 = 0xA0;
pub const RSP_ILLEGAL_PARAMETER: u8 = 0xA1;
pub const RSP_ILLEGAL_MEMORY_TYPE: u8 = 0xA2;
pub const RSP_ILLEGAL_MEMORY_RANGE: u8 = 0xA3;
pub const RSP_ILLEGAL_MCU_STATE: u8 = 0xA5;

// ============================================================================
// Parameter keys
// ============================================================================

pub const PARAM_HW_VER: u8 = 0x01;
pub const PARAM_FW_VER: u8 = 0x02;
pub const PARAM_EMU_MODE: u8 = 0x03;
pub const PARAM_BAUD_RATE: u8 = 0x05;
pub const PARAM_VTARGET: u8 = 0x06;

/// Reported target voltage, millivolts.
pub const PARAM_VTARGET_MV: u16 = 5000;

// ============================================================================
// Memory type sub-commands
// ============================================================================

pub const MTYPE_SRAM: u8 = 0x20;
pub const MTYPE_EEPROM: u8 = 0x22;
pub const MTYPE_FLASH_PAGE: u8 = 0xB0;
pub const MTYPE_EEPROM_PAGE: u8 = 0xB1;
pub const MTYPE_FUSE_BITS: u8 = 0xB2;
pub const MTYPE_LOCK_BITS: u8 = 0xB3;
pub const MTYPE_SIGN_JTAG: u8 = 0xB4;
pub const MTYPE_OSCCAL_BYTE: u8 = 0xB5;
pub const MTYPE_XMEGA_FLASH: u8 = 0xC0;
pub const MTYPE_BOOT_FLASH: u8 = 0xC1;
pub const MTYPE_EEPROM_XMEGA: u8 = 0xC4;
pub const MTYPE_USERSIG: u8 = 0xC5;
pub const MTYPE_PRODSIG: u8 = 0xC6;

// ============================================================================
// Erase sub-commands
// ============================================================================

pub const ERASE_CHIP: u8 = 0x00;

// ============================================================================
// Device descriptor offsets (CMND_SET_DEVICE_DESCRIPTOR body)
// ============================================================================

/// u16 LE flash page size within the descriptor body.
pub const DESCRIPTOR_FLASH_PAGESIZE_OFFSET: usize = 0xF4;

// ============================================================================
// Baud-rate table
// ============================================================================

/// Supported host baud rates, indexed by the protocol's small integer id.
/// Id 0 is reserved and never used on the wire.
pub const BAUD_TABLE: [u32; 29] = [
    2_400, // 0: reserved dummy
    2_400,
    4_800,
    9_600,
    19_200, // 4: power-on default
    38_400,
    57_600,
    115_200,
    14_400,
    153_600,
    230_400,
    460_800,
    921_600,
    128_000,
    256_000,
    512_000,
    1_024_000,
    150_000,
    200_000,
    250_000,
    300_000,
    400_000,
    500_000,
    600_000,
    666_666,
    1_000_000,
    1_500_000,
    2_000_000,
    3_000_000,
];

/// Lowest baud id accepted by this build (16 MHz reference clock).
pub const BAUD_LOWER: u8 = 2;

/// Highest baud id accepted by this build.
pub const BAUD_UPPER: u8 = 27;

/// Power-on / sign-off default baud id (19 200).
pub const BAUD_DEFAULT: u8 = 4;

// ============================================================================
// Sign-on identity record
// ============================================================================

/// Fixed identity record answered to GET_SIGN_ON: the response id followed
/// by 27 bytes of version numbers, serial and a NUL-terminated product
/// string.
pub const SIGN_ON_RESPONSE: [u8; 28] = [
    RSP_SIGN_ON, // $00: message id
    0x01,        // $01: communications protocol version
    0x01,        // $02: master boot-loader version
    0x06,        // $03: master firmware version (minor)
    0x06,        // $04: master firmware version (major)
    0x01,        // $05: master hardware version
    0x01,        // $06: slave boot-loader version
    0x00,        // $07: slave firmware version (minor)
    0x06,        // $08: slave firmware version (major)
    0x01,        // $09: slave hardware version
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // $0A-$0F: serial number
    // $10..: product string, NUL terminated
    b'U', b'P', b'D', b'I', b' ', b'b', b'r', b'i', b'd', b'g', b'e', 0,
];
