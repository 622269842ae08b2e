//! SD card identification and single-block I/O on top of [`SdhcProtocol`].
//!
//! # References
//! - SD Physical Layer Simplified Specification v9.10, chapters 4.2 and 5

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::Instant;

use sdhost_hw::specs::clock::{DEFAULT_SPEED_HZ, IDENTIFICATION_HZ};
use sdhost_hw::specs::transfer::BLOCK_LENGTH;
use tracing::{debug, info, warn};

use crate::command::{Command, ResponseType, TransferInfo};
use crate::error::{DeviceFault, Result, SdhcError, TimeoutSite};
use crate::host::{BusWidth, SdhcProtocol};
use crate::reset::ResetScope;
use crate::response::Response;

const BLOCK_BYTES: usize = BLOCK_LENGTH as usize;

/// Card status (R1) bits
pub mod card_status {
    pub const OUT_OF_RANGE: u32 = 1 << 31;
    pub const ADDRESS_ERROR: u32 = 1 << 30;
    pub const BLOCK_LEN_ERROR: u32 = 1 << 29;
    pub const ILLEGAL_COMMAND: u32 = 1 << 22;
    pub const READY_FOR_DATA: u32 = 1 << 8;
    pub const APP_CMD: u32 = 1 << 5;
    pub const STATE_SHIFT: u32 = 9;
    pub const STATE_MASK: u32 = 0xf << STATE_SHIFT;

    /// Every error bit of bits 31:19, CARD_IS_LOCKED excluded
    pub const ERRORS: u32 = 0xfdf8_0000;
}

/// OCR bits
pub mod ocr {
    /// Power up finished (active low busy)
    pub const READY: u32 = 1 << 31;
    /// Card capacity status, set for block addressed cards
    pub const CCS: u32 = 1 << 30;
    /// 2.7-3.6V window
    pub const VOLTAGE_WINDOW: u32 = 0x00ff_8000;
}

/// Card state machine, valued as reported in R1 bits 12:9
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CardState {
    Idle = 0,
    Ready = 1,
    Ident = 2,
    Standby = 3,
    Transfer = 4,
    Data = 5,
    Receive = 6,
    Program = 7,
    Disconnect = 8,
}

impl CardState {
    pub fn from_status(status: u32) -> Option<Self> {
        Some(match (status & card_status::STATE_MASK) >> card_status::STATE_SHIFT {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Standby,
            4 => CardState::Transfer,
            5 => CardState::Data,
            6 => CardState::Receive,
            7 => CardState::Program,
            8 => CardState::Disconnect,
            _ => return None,
        })
    }
}

pub const GO_IDLE_STATE: Command = Command::new(0, ResponseType::None);
pub const ALL_SEND_CID: Command = Command::new(2, ResponseType::R2);
pub const SEND_RELATIVE_ADDR: Command = Command::new(3, ResponseType::R6);
pub const SELECT_CARD: Command = Command::new(7, ResponseType::R1b);
pub const SEND_IF_COND: Command = Command::new(8, ResponseType::R7);
pub const SEND_CSD: Command = Command::new(9, ResponseType::R2);
pub const STOP_TRANSMISSION: Command = Command::new(12, ResponseType::R1b);
pub const SEND_STATUS: Command = Command::new(13, ResponseType::R1);
pub const SET_BLOCKLEN: Command = Command::new(16, ResponseType::R1);
pub const READ_SINGLE_BLOCK: Command = Command::new(17, ResponseType::R1).reading();
pub const WRITE_BLOCK: Command = Command::new(24, ResponseType::R1).writing();
pub const APP_CMD: Command = Command::new(55, ResponseType::R1);
pub const SET_BUS_WIDTH: Command = Command::app(6, ResponseType::R1);
pub const SD_SEND_OP_COND: Command = Command::app(41, ResponseType::R3);
pub const SEND_SCR: Command = Command::app(51, ResponseType::R1).reading();

/// 2.7-3.6V supply and check pattern of CMD8
const IF_COND_CHECK: u32 = 0x1aa;

/// ACMD41 attempts before giving up on power up
const POWER_UP_ATTEMPTS: u32 = 1000;

/// CMD13 polls while the card programs a written block
const PROGRAM_POLLS: u32 = 1000;

/// Bits `msb..=lsb` of a CID or CSD register, given the response with its
/// CRC byte already stripped
fn field(register: u128, msb: u32, lsb: u32) -> u128 {
    (register >> (lsb - 8)) & ((1u128 << (msb - lsb + 1)) - 1)
}

/// Decoded card identification register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer: u8,
    pub oem: [u8; 2],
    pub product: [u8; 5],
    pub revision: u8,
    pub serial: u32,
    pub year: u16,
    pub month: u8,
}

impl Cid {
    pub fn parse(cid: u128) -> Self {
        let product = (field(cid, 103, 64) as u64).to_be_bytes();
        let mdt = field(cid, 19, 8) as u16;
        Self {
            manufacturer: field(cid, 127, 120) as u8,
            oem: (field(cid, 119, 104) as u16).to_be_bytes(),
            product: [product[3], product[4], product[5], product[6], product[7]],
            revision: field(cid, 63, 56) as u8,
            serial: field(cid, 55, 24) as u32,
            year: 2000 + (mdt >> 4),
            month: (mdt & 0xf) as u8,
        }
    }

    pub fn product_name(&self) -> String {
        String::from_utf8_lossy(&self.product).trim().to_string()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}/{} {} rev {}.{} SN {:08X} ({:02}/{})",
            self.manufacturer,
            String::from_utf8_lossy(&self.oem),
            self.product_name(),
            self.revision >> 4,
            self.revision & 0xf,
            self.serial,
            self.month,
            self.year
        )
    }
}

/// Number of 512-byte blocks described by a CSD (CRC byte stripped)
pub fn csd_block_count(csd: u128) -> Result<u64> {
    match field(csd, 127, 126) {
        0 => {
            let read_bl_len = field(csd, 83, 80) as u32;
            let c_size = field(csd, 73, 62) as u64;
            let mult = field(csd, 49, 47) as u32;
            if !(9..=11).contains(&read_bl_len) {
                return Err(SdhcError::InvalidParameter("unsupported CSD block length"));
            }
            Ok((c_size + 1) << (mult + 2 + read_bl_len - 9))
        }
        1 => Ok((field(csd, 69, 48) as u64 + 1) * 1024),
        _ => Err(SdhcError::InvalidParameter("unsupported CSD structure")),
    }
}

/// What identification learned about the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub rca: u16,
    /// Version 2.00 or later (answered CMD8)
    pub version2: bool,
    /// Block addressed (SDHC/SDXC)
    pub high_capacity: bool,
    pub cid: Cid,
    pub csd: u128,
    pub scr: u64,
    pub blocks: u64,
    pub wide_bus: bool,
}

impl CardInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.blocks * BLOCK_BYTES as u64
    }
}

fn check_status(cmd: &Command, status: u32) -> Result<u32> {
    if status & card_status::ERRORS != 0 {
        warn!("SD card: {} status {:#010X}", cmd, status);
        return Err(SdhcError::DeviceError(DeviceFault::CardStatus {
            command: *cmd,
            status,
        }));
    }
    Ok(status)
}

fn command<H: SdhcProtocol>(
    host: &mut H,
    cmd: &Command,
    argument: u32,
    transfer: Option<&TransferInfo>,
) -> Result<Response> {
    host.send_command(cmd, argument, transfer)?;
    host.receive_response(cmd)
}

fn app_command<H: SdhcProtocol>(
    host: &mut H,
    rca: u16,
    cmd: &Command,
    argument: u32,
    transfer: Option<&TransferInfo>,
) -> Result<Response> {
    let status = command(host, &APP_CMD, u32::from(rca) << 16, None)?.short();
    check_status(&APP_CMD, status)?;
    command(host, cmd, argument, transfer)
}

/// An identified SD card in transfer state
#[derive(Debug)]
pub struct SdCard<H> {
    host: H,
    info: CardInfo,
}

impl<H: SdhcProtocol> SdCard<H> {
    /// Runs card identification and leaves the card selected, with 512-byte
    /// blocks, the widest supported bus and the default speed clock
    pub fn init(mut host: H) -> Result<Self> {
        let start = Instant::now();
        info!("SD card: identification");

        host.software_reset(ResetScope::All)?;
        host.set_clock(IDENTIFICATION_HZ)?;
        host.set_bus_width(BusWidth::One)?;

        command(&mut host, &GO_IDLE_STATE, 0, None)?;

        let version2 = match command(&mut host, &SEND_IF_COND, IF_COND_CHECK, None) {
            Ok(response) => {
                let echo = response.short() & 0xfff;
                if echo != IF_COND_CHECK {
                    return Err(SdhcError::DeviceError(DeviceFault::CardStatus {
                        command: SEND_IF_COND,
                        status: echo,
                    }));
                }
                true
            }
            Err(e) if e.is_expected_timeout() => {
                debug!("SD card: no answer to CMD8, version 1.x card");
                host.software_reset(ResetScope::Cmd)?;
                false
            }
            Err(e) => return Err(e),
        };

        let ocr = Self::power_up(&mut host, version2)?;
        let high_capacity = ocr & ocr::CCS != 0;

        let cid = Cid::parse(command(&mut host, &ALL_SEND_CID, 0, None)?.as_u128());
        debug!("SD card: CID {}", cid);

        let rca = (command(&mut host, &SEND_RELATIVE_ADDR, 0, None)?.short() >> 16) as u16;
        debug!("SD card: RCA {:#06X}", rca);
        let addressed = u32::from(rca) << 16;

        let csd = command(&mut host, &SEND_CSD, addressed, None)?.as_u128();
        let blocks = csd_block_count(csd)?;

        let status = command(&mut host, &SELECT_CARD, addressed, None)?.short();
        check_status(&SELECT_CARD, status)?;

        let scr = Self::read_scr(&mut host, rca)?;
        // SD_BUS_WIDTHS bit 2: 4-bit bus
        let wide_bus = (scr >> 48) & 0x4 != 0;
        if wide_bus {
            let status = app_command(&mut host, rca, &SET_BUS_WIDTH, 2, None)?.short();
            check_status(&SET_BUS_WIDTH, status)?;
            host.set_bus_width(BusWidth::Four)?;
        }

        let status = command(&mut host, &SET_BLOCKLEN, BLOCK_LENGTH, None)?.short();
        check_status(&SET_BLOCKLEN, status)?;

        host.set_clock(DEFAULT_SPEED_HZ)?;

        let info = CardInfo {
            rca,
            version2,
            high_capacity,
            cid,
            csd,
            scr,
            blocks,
            wide_bus,
        };
        info!(
            "SD card: {} blocks ({}), {}-bit bus, identified in {:?}",
            info.blocks,
            if high_capacity { "SDHC" } else { "SDSC" },
            if wide_bus { 4 } else { 1 },
            start.elapsed()
        );
        Ok(Self { host, info })
    }

    fn power_up(host: &mut H, version2: bool) -> Result<u32> {
        let mut argument = ocr::VOLTAGE_WINDOW;
        if version2 {
            argument |= ocr::CCS;
        }

        for attempt in 1..=POWER_UP_ATTEMPTS {
            let ocr = app_command(host, 0, &SD_SEND_OP_COND, argument, None)?.short();
            if ocr & ocr::READY != 0 {
                debug!("SD card: powered up after {} ACMD41, OCR {:#010X}", attempt, ocr);
                return Ok(ocr);
            }
        }

        warn!("SD card: still busy after {} ACMD41", POWER_UP_ATTEMPTS);
        Err(SdhcError::Timeout(TimeoutSite::Command(SD_SEND_OP_COND)))
    }

    fn read_scr(host: &mut H, rca: u16) -> Result<u64> {
        let mut scr = [0u8; 8];
        let transfer = TransferInfo {
            block_count: 1,
            block_size: scr.len() as u32,
        };
        let status = app_command(host, rca, &SEND_SCR, 0, Some(&transfer))?.short();
        check_status(&SEND_SCR, status)?;
        host.read_block_data(&mut scr)?;
        Ok(u64::from_be_bytes(scr))
    }

    pub fn info(&self) -> &CardInfo {
        &self.info
    }

    pub fn block_count(&self) -> u64 {
        self.info.blocks
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    /// Data address of `lba`, in blocks or in bytes depending on the card
    fn address(&self, lba: u64, len: usize) -> Result<u32> {
        if len != BLOCK_BYTES {
            return Err(SdhcError::InvalidParameter("buffer is not one block"));
        }
        if lba >= self.info.blocks {
            return Err(SdhcError::InvalidParameter("block address past the end of the card"));
        }
        let address = if self.info.high_capacity {
            lba
        } else {
            lba * BLOCK_BYTES as u64
        };
        u32::try_from(address).map_err(|_| SdhcError::InvalidParameter("block address overflow"))
    }

    pub fn read_block(&mut self, lba: u64, block: &mut [u8]) -> Result<()> {
        let address = self.address(lba, block.len())?;
        let start = Instant::now();

        let transfer = TransferInfo {
            block_count: 1,
            block_size: BLOCK_LENGTH,
        };
        let status = command(&mut self.host, &READ_SINGLE_BLOCK, address, Some(&transfer))?.short();
        check_status(&READ_SINGLE_BLOCK, status)?;
        self.host.read_block_data(block).map_err(|e| self.abort(e))?;

        debug!("SD card: read block {} in {:?}", lba, start.elapsed());
        Ok(())
    }

    pub fn write_block(&mut self, lba: u64, block: &[u8]) -> Result<()> {
        let address = self.address(lba, block.len())?;
        let start = Instant::now();

        let transfer = TransferInfo {
            block_count: 1,
            block_size: BLOCK_LENGTH,
        };
        let status = command(&mut self.host, &WRITE_BLOCK, address, Some(&transfer))?.short();
        check_status(&WRITE_BLOCK, status)?;
        self.host.write_block_data(block).map_err(|e| self.abort(e))?;
        self.wait_programmed()?;

        debug!("SD card: wrote block {} in {:?}", lba, start.elapsed());
        Ok(())
    }

    /// Card status (CMD13)
    pub fn status(&mut self) -> Result<u32> {
        let status = command(
            &mut self.host,
            &SEND_STATUS,
            u32::from(self.info.rca) << 16,
            None,
        )?
        .short();
        check_status(&SEND_STATUS, status)
    }

    fn wait_programmed(&mut self) -> Result<()> {
        for _ in 0..PROGRAM_POLLS {
            let status = self.status()?;
            if status & card_status::READY_FOR_DATA != 0
                && CardState::from_status(status) == Some(CardState::Transfer)
            {
                return Ok(());
            }
        }
        warn!("SD card: still programming after {} polls", PROGRAM_POLLS);
        Err(SdhcError::Timeout(TimeoutSite::Command(SEND_STATUS)))
    }

    /// Brings controller and card back to a state where the next transfer
    /// can start, then hands `e` back
    fn abort(&mut self, e: SdhcError) -> SdhcError {
        warn!("SD card: transfer aborted: {}", e);
        for scope in [ResetScope::Cmd, ResetScope::Data] {
            if let Err(reset) = self.host.software_reset(scope) {
                warn!("SD card: {:?} reset failed: {}", scope, reset);
            }
        }
        if let Err(stop) = command(&mut self.host, &STOP_TRANSMISSION, 0, None) {
            warn!("SD card: CMD12 failed: {}", stop);
        }
        e
    }

    /// Puts the card back in stand-by (CMD7 with RCA 0)
    pub fn deselect(&mut self) -> Result<()> {
        command(&mut self.host, &SELECT_CARD, 0, None)?;
        debug!("SD card: deselected");
        Ok(())
    }
}

/// Byte-addressed view of a card for filesystem code
#[derive(Debug)]
pub struct BlockStream<H> {
    card: SdCard<H>,
    position: u64,
    block: [u8; BLOCK_BYTES],
}

impl<H: SdhcProtocol> BlockStream<H> {
    pub fn new(card: SdCard<H>) -> Self {
        Self {
            card,
            position: 0,
            block: [0; BLOCK_BYTES],
        }
    }

    pub fn len(&self) -> u64 {
        self.card.info().capacity_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn card(&self) -> &SdCard<H> {
        &self.card
    }

    pub fn into_card(self) -> SdCard<H> {
        self.card
    }

    /// Block index, offset in that block and byte count of the next access
    fn span(&self, requested: usize) -> (u64, usize, usize) {
        let lba = self.position / BLOCK_BYTES as u64;
        let offset = (self.position % BLOCK_BYTES as u64) as usize;
        let left = (self.len() - self.position).min((BLOCK_BYTES - offset) as u64) as usize;
        (lba, offset, requested.min(left))
    }
}

impl<H: SdhcProtocol> Read for BlockStream<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.len() {
            return Ok(0);
        }

        let (lba, offset, count) = self.span(buf.len());
        if count == BLOCK_BYTES {
            self.card.read_block(lba, &mut buf[..BLOCK_BYTES])?;
        } else {
            self.card.read_block(lba, &mut self.block)?;
            buf[..count].copy_from_slice(&self.block[offset..offset + count]);
        }

        self.position += count as u64;
        Ok(count)
    }
}

impl<H: SdhcProtocol> Write for BlockStream<H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position >= self.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "end of card"));
        }

        let (lba, offset, count) = self.span(buf.len());
        if count == BLOCK_BYTES {
            self.card.write_block(lba, &buf[..BLOCK_BYTES])?;
        } else {
            self.card.read_block(lba, &mut self.block)?;
            self.block[offset..offset + count].copy_from_slice(&buf[..count]);
            self.card.write_block(lba, &self.block)?;
        }

        self.position += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<H: SdhcProtocol> Seek for BlockStream<H> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the card",
            ));
        };
        self.position = target;
        Ok(target)
    }
}
