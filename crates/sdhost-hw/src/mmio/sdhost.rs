//! # References
//! - <https://github.com/raspberrypi/linux/blob/rpi-6.6.y/drivers/mmc/host/bcm2835.c>
//! - <https://www.raspberrypi.org/forums/viewtopic.php?t=94133> (SDHost register notes)

use tock_registers::register_bitfields;

/// SDHost MMIO region base address (BCM2836/BCM2837)
pub const BASE: u64 = crate::memory_map::sdhost::BASE;

/// SDHost MMIO region end address (exclusive)
pub const END: u64 = BASE + crate::memory_map::sdhost::SIZE as u64;

/// SDHost registers, valued by their byte offset from `BASE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Reg {
    /// Command register
    Cmd = 0x00,
    /// Command argument register
    Arg = 0x04,
    /// Data timeout, in SD clock cycles
    Tout = 0x08,
    /// Clock divider
    Cdiv = 0x0c,
    /// Response registers, `Rsp0` holds the least significant word
    Rsp0 = 0x10,
    Rsp1 = 0x14,
    Rsp2 = 0x18,
    Rsp3 = 0x1c,
    /// Host status register (write 1 to clear)
    Hsts = 0x20,
    /// Card power control
    Vdd = 0x30,
    /// Emergency debug mode, holds the FIFO thresholds and FIFO clear
    Edm = 0x34,
    /// Host configuration
    Hcfg = 0x38,
    /// Host byte count, i.e. the block length
    Hbct = 0x3c,
    /// Data FIFO port
    Data = 0x40,
    /// Host block count
    Hblc = 0x50,
}

impl Reg {
    /// Every register of the window, in offset order
    pub const ALL: [Reg; 15] = [
        Reg::Cmd,
        Reg::Arg,
        Reg::Tout,
        Reg::Cdiv,
        Reg::Rsp0,
        Reg::Rsp1,
        Reg::Rsp2,
        Reg::Rsp3,
        Reg::Hsts,
        Reg::Vdd,
        Reg::Edm,
        Reg::Hcfg,
        Reg::Hbct,
        Reg::Data,
        Reg::Hblc,
    ];

    /// Response registers, least significant word first
    pub const RESPONSE: [Reg; 4] = [Reg::Rsp0, Reg::Rsp1, Reg::Rsp2, Reg::Rsp3];

    /// Byte offset from the window base
    pub const fn offset(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            Reg::Cmd => "CMD",
            Reg::Arg => "ARG",
            Reg::Tout => "TOUT",
            Reg::Cdiv => "CDIV",
            Reg::Rsp0 => "RSP0",
            Reg::Rsp1 => "RSP1",
            Reg::Rsp2 => "RSP2",
            Reg::Rsp3 => "RSP3",
            Reg::Hsts => "HSTS",
            Reg::Vdd => "VDD",
            Reg::Edm => "EDM",
            Reg::Hcfg => "HCFG",
            Reg::Hbct => "HBCT",
            Reg::Data => "DATA",
            Reg::Hblc => "HBLC",
        }
    }

    /// Look a register up by its byte offset
    pub fn from_offset(offset: u32) -> Option<Reg> {
        Reg::ALL.into_iter().find(|reg| reg.offset() == offset)
    }
}

register_bitfields![u32,
    /// Command register
    pub SDCMD [
        /// SD command index
        INDEX OFFSET(0) NUMBITS(6) [],
        /// Command transfers data from the card
        READ OFFSET(6) NUMBITS(1) [],
        /// Command transfers data to the card
        WRITE OFFSET(7) NUMBITS(1) [],
        /// Expect a 136-bit response
        LONG_RESPONSE OFFSET(9) NUMBITS(1) [],
        /// Expect no response at all
        NO_RESPONSE OFFSET(10) NUMBITS(1) [],
        /// Wait for the card to release DAT0 after the response
        BUSY OFFSET(11) NUMBITS(1) [],
        /// Set by the controller when the command failed
        FAIL OFFSET(14) NUMBITS(1) [],
        /// Set by software to start a command, cleared by the controller when done
        NEW OFFSET(15) NUMBITS(1) []
    ],

    /// Host status register
    pub SDHSTS [
        /// Data FIFO holds a word to read, or can accept a word to write
        DATA_FLAG OFFSET(0) NUMBITS(1) [],
        FIFO_ERROR OFFSET(3) NUMBITS(1) [],
        /// CRC7 mismatch on a command response
        CRC7_ERROR OFFSET(4) NUMBITS(1) [],
        /// CRC16 mismatch on a data block
        CRC16_ERROR OFFSET(5) NUMBITS(1) [],
        /// No response from the card
        CMD_TIMEOUT OFFSET(6) NUMBITS(1) [],
        /// Read/erase/write timeout
        REW_TIMEOUT OFFSET(7) NUMBITS(1) [],
        SDIO_IRPT OFFSET(8) NUMBITS(1) [],
        BLOCK_IRPT OFFSET(9) NUMBITS(1) [],
        BUSY_IRPT OFFSET(10) NUMBITS(1) []
    ],

    /// Host configuration register
    pub SDHCFG [
        REL_CMD_LINE OFFSET(0) NUMBITS(1) [],
        /// Wide internal bus between the FIFO and the APB
        WIDE_INT_BUS OFFSET(1) NUMBITS(1) [],
        /// 4-bit SD bus (cleared: 1-bit)
        WIDE_EXT_BUS OFFSET(2) NUMBITS(1) [],
        /// Use every CDIV bit in data mode
        SLOW_CARD OFFSET(3) NUMBITS(1) []
    ],

    /// Emergency debug mode register
    pub SDEDM [
        /// Low byte, preserved by the full reset
        STATE OFFSET(0) NUMBITS(8) [],
        WRITE_THRESHOLD OFFSET(9) NUMBITS(5) [],
        READ_THRESHOLD OFFSET(14) NUMBITS(5) [],
        /// Self-clearing FIFO flush
        FIFO_CLEAR OFFSET(21) NUMBITS(1) []
    ]
];

/// Command register bit flags as plain masks
pub mod cmd_flags {
    pub const INDEX_MASK: u32 = 0x003f;
    pub const READ: u32 = 0x0040;
    pub const WRITE: u32 = 0x0080;
    pub const LONG_RESPONSE: u32 = 0x0200;
    pub const NO_RESPONSE: u32 = 0x0400;
    pub const BUSY: u32 = 0x0800;
    pub const FAIL: u32 = 0x4000;
    pub const NEW: u32 = 0x8000;
}

/// Host status register bit flags as plain masks
pub mod status {
    pub const DATA_FLAG: u32 = 0x0001;
    pub const FIFO_ERROR: u32 = 0x0008;
    pub const CRC7_ERROR: u32 = 0x0010;
    pub const CRC16_ERROR: u32 = 0x0020;
    pub const CMD_TIMEOUT: u32 = 0x0040;
    pub const REW_TIMEOUT: u32 = 0x0080;

    /// Every error bit the completion waiter looks at
    pub const ERROR_MASK: u32 = FIFO_ERROR | CRC7_ERROR | CRC16_ERROR | CMD_TIMEOUT | REW_TIMEOUT;

    /// Every write-1-to-clear bit, errors and interrupt flags
    pub const CLEAR_MASK: u32 = 0x07f8;
}

/// Host configuration bit flags as plain masks
pub mod host_config {
    pub const WIDE_INT_BUS: u32 = 0x0002;
    pub const WIDE_EXT_BUS: u32 = 0x0004;
    pub const SLOW_CARD: u32 = 0x0008;
}

/// Emergency debug mode values
pub mod edm {
    /// Bits kept from the previous EDM value by the full reset
    pub const KEEP_MASK: u32 = 0xff;

    /// Write and read FIFO thresholds of 4 words each
    pub const THRESHOLDS: u32 = 0x10800;

    pub const FIFO_CLEAR: u32 = 1 << 21;
}

/// Power control values
pub mod vdd {
    pub const POWER_OFF: u32 = 0;
    pub const POWER_ON: u32 = 1;
}
