//! Response decoder.

use sdhost_hw::mmio::sdhost::Reg;
use tracing::trace;

use crate::command::ResponseType;
use crate::host::SdHost;
use crate::platform::Platform;
use crate::regs::RegisterWindow;

/// Response words of a completed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    None,
    /// 32 bits of card status, OCR, RCA or interface condition
    Short(u32),
    /// CID or CSD without its CRC byte, least significant word first
    Long([u32; 4]),
}

impl Response {
    pub fn words(&self) -> &[u32] {
        match self {
            Response::None => &[],
            Response::Short(word) => std::slice::from_ref(word),
            Response::Long(words) => words,
        }
    }

    /// First response word, 0 when the command had no response
    pub fn short(&self) -> u32 {
        self.words().first().copied().unwrap_or(0)
    }

    /// The long response as one 128-bit value
    pub fn as_u128(&self) -> u128 {
        self.words()
            .iter()
            .rev()
            .fold(0u128, |acc, word| (acc << 32) | u128::from(*word))
    }
}

/// Shifts the raw 128 response bits right by one byte.
///
/// The controller keeps R2[127:0] in RSP0-3 with the CRC7 byte at the
/// bottom; CID/CSD consumers expect the register without it.
pub fn strip_crc(raw: [u32; 4]) -> [u32; 4] {
    let bits = raw
        .iter()
        .rev()
        .fold(0u128, |acc, word| (acc << 32) | u128::from(*word))
        >> 8;
    [
        bits as u32,
        (bits >> 32) as u32,
        (bits >> 64) as u32,
        (bits >> 96) as u32,
    ]
}

impl<W: RegisterWindow, P: Platform> SdHost<W, P> {
    pub(crate) fn read_response(&mut self, response: ResponseType) -> Response {
        match response {
            ResponseType::None => Response::None,
            ResponseType::R2 => {
                let raw = Reg::RESPONSE.map(|reg| self.regs.read(reg));
                let words = strip_crc(raw);
                trace!(
                    "SDHC{} response ({:?}): {:08X} {:08X} {:08X} {:08X}",
                    self.config.id, response, words[0], words[1], words[2], words[3]
                );
                Response::Long(words)
            }
            _ => {
                let word = self.regs.read(Reg::Rsp0);
                trace!("SDHC{} response ({:?}): {:08X}", self.config.id, response, word);
                Response::Short(word)
            }
        }
    }
}
