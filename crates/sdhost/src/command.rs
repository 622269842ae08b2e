//! Command and transfer descriptors.
//!
//! A [`Command`] is an immutable per-call value; the engine never stores one
//! beyond the call that received it.

use std::fmt;

use sdhost_hw::mmio::sdhost::SDCMD;
use sdhost_hw::specs::transfer::MAX_BLOCK_COUNT;
use tock_registers::LocalRegisterCopy;

use crate::error::{Result, SdhcError};

/// Whether the command must be preceded by CMD55 (APP_CMD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Standard,
    App,
}

/// Expected reply shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    None,
    /// Normal response (48-bit)
    R1,
    /// Normal response with busy signalling on DAT0
    R1b,
    /// CID/CSD register (136-bit)
    R2,
    /// OCR register, no CRC (48-bit)
    R3,
    R4,
    R5,
    R5b,
    /// Published RCA (48-bit)
    R6,
    /// Card interface condition (48-bit)
    R7,
}

impl ResponseType {
    /// Number of 32-bit words [`crate::Response`] carries for this type
    pub const fn word_count(self) -> usize {
        match self {
            ResponseType::None => 0,
            ResponseType::R2 => 4,
            _ => 1,
        }
    }
}

impl TryFrom<u32> for ResponseType {
    type Error = SdhcError;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => ResponseType::None,
            1 => ResponseType::R1,
            2 => ResponseType::R1b,
            3 => ResponseType::R2,
            4 => ResponseType::R3,
            5 => ResponseType::R4,
            6 => ResponseType::R5,
            7 => ResponseType::R5b,
            8 => ResponseType::R6,
            9 => ResponseType::R7,
            _ => return Err(SdhcError::InvalidParameter("unknown response type")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    None,
    Read,
    Write,
}

/// An SD command as issued by a block-I/O consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub index: u8,
    pub class: CommandClass,
    pub response: ResponseType,
    pub direction: TransferDirection,
}

impl Command {
    pub const fn new(index: u8, response: ResponseType) -> Self {
        Self {
            index,
            class: CommandClass::Standard,
            response,
            direction: TransferDirection::None,
        }
    }

    /// Application-specific command (ACMDn)
    pub const fn app(index: u8, response: ResponseType) -> Self {
        Self {
            class: CommandClass::App,
            ..Self::new(index, response)
        }
    }

    pub const fn reading(self) -> Self {
        Self {
            direction: TransferDirection::Read,
            ..self
        }
    }

    pub const fn writing(self) -> Self {
        Self {
            direction: TransferDirection::Write,
            ..self
        }
    }

    pub const fn is_app(&self) -> bool {
        matches!(self.class, CommandClass::App)
    }

    /// CMD1, CMD5 and CMD8 legitimately time out on cards that do not
    /// implement them; voltage negotiation relies on that.
    pub const fn timeout_may_be_expected(&self) -> bool {
        matches!(self.index, 1 | 5 | 8)
    }

    /// Value to write into the command register to start this command
    pub fn register_value(&self) -> u32 {
        let mut reg: LocalRegisterCopy<u32, SDCMD::Register> = LocalRegisterCopy::new(0);
        reg.write(SDCMD::INDEX.val(u32::from(self.index)) + SDCMD::NEW::SET);

        match self.response {
            ResponseType::None => reg.modify(SDCMD::NO_RESPONSE::SET),
            ResponseType::R1b => reg.modify(SDCMD::BUSY::SET),
            ResponseType::R2 => reg.modify(SDCMD::LONG_RESPONSE::SET),
            _ => {}
        }

        match self.direction {
            TransferDirection::Read => reg.modify(SDCMD::READ::SET),
            TransferDirection::Write => reg.modify(SDCMD::WRITE::SET),
            TransferDirection::None => {}
        }

        reg.get()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_app() { "ACMD" } else { "CMD" };
        write!(f, "{prefix}{}", self.index)
    }
}

/// Shape of the data phase accompanying a data-bearing command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferInfo {
    pub block_count: u32,
    pub block_size: u32,
}

impl TransferInfo {
    pub fn validate(&self) -> Result<()> {
        if self.block_count > MAX_BLOCK_COUNT {
            return Err(SdhcError::InvalidParameter("block count exceeds host maximum"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdhost_hw::mmio::sdhost::cmd_flags;

    #[test]
    fn register_value_sets_response_flags() {
        let none = Command::new(0, ResponseType::None).register_value();
        assert_eq!(none, cmd_flags::NEW | cmd_flags::NO_RESPONSE);

        let r1b = Command::new(7, ResponseType::R1b).register_value();
        assert_eq!(r1b, cmd_flags::NEW | cmd_flags::BUSY | 7);

        let r2 = Command::new(9, ResponseType::R2).register_value();
        assert_eq!(r2, cmd_flags::NEW | cmd_flags::LONG_RESPONSE | 9);

        for short in [
            ResponseType::R1,
            ResponseType::R3,
            ResponseType::R4,
            ResponseType::R5,
            ResponseType::R5b,
            ResponseType::R6,
            ResponseType::R7,
        ] {
            assert_eq!(Command::new(13, short).register_value(), cmd_flags::NEW | 13);
        }
    }

    #[test]
    fn register_value_sets_direction_flags() {
        let read = Command::new(17, ResponseType::R1).reading().register_value();
        assert_eq!(read, cmd_flags::NEW | cmd_flags::READ | 17);

        let write = Command::new(24, ResponseType::R1).writing().register_value();
        assert_eq!(write, cmd_flags::NEW | cmd_flags::WRITE | 24);
    }

    #[test]
    fn display_marks_app_commands() {
        assert_eq!(Command::app(41, ResponseType::R3).to_string(), "ACMD41");
        assert_eq!(Command::new(8, ResponseType::R7).to_string(), "CMD8");
    }

    #[test]
    fn transfer_info_rejects_oversized_block_count() {
        let ok = TransferInfo { block_count: 0xFFFF, block_size: 512 };
        assert!(ok.validate().is_ok());

        let too_many = TransferInfo { block_count: 0x10000, block_size: 512 };
        assert!(matches!(too_many.validate(), Err(SdhcError::InvalidParameter(_))));
    }

    #[test]
    fn raw_response_type_rejects_unknown_values() {
        assert_eq!(ResponseType::try_from(3).ok(), Some(ResponseType::R2));
        assert!(ResponseType::try_from(42).is_err());
    }
}
