//! Behavioural model of the SDHost controller with an SD card attached.
//!
//! The model answers register accesses the way the hardware does: HSTS is
//! write-1-to-clear, CMD completes with NEW cleared and FAIL set on errors,
//! R2 responses keep the CRC byte in the low byte of RSP0 and the DATA port
//! pops and pushes a word FIFO. The card behind it implements the command
//! subset needed for identification and single-block transfers.
//!
//! Commands complete synchronously when CMD is written; faults can be
//! injected to keep the controller busy, fail a command, or wedge the FIFO.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use sdhost_hw::mmio::sdhost::{Reg, cmd_flags, edm, status, vdd};
use sdhost_hw::specs::transfer::{BLOCK_LENGTH, WORD_BYTES};
use tracing::{debug, trace, warn};

use crate::card::{CardState, card_status, ocr};
use crate::regs::RegisterWindow;

const BLOCK_BYTES: usize = BLOCK_LENGTH as usize;
const REGISTER_SLOTS: usize = Reg::Hblc.offset() as usize / 4 + 1;

/// Storage behind the simulated card
#[derive(Debug)]
pub enum CardImage {
    Memory(Vec<u8>),
    File { file: File, len: u64 },
}

impl CardImage {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        debug!("Opened SD card image: {:?} ({} bytes)", path, len);
        Ok(CardImage::File { file, len })
    }

    pub fn len(&self) -> u64 {
        match self {
            CardImage::Memory(bytes) => bytes.len() as u64,
            CardImage::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole blocks available on the image
    pub fn block_count(&self) -> u64 {
        self.len() / BLOCK_BYTES as u64
    }

    fn read_block(&mut self, lba: u64, block: &mut [u8]) -> io::Result<()> {
        let offset = lba * BLOCK_BYTES as u64;
        match self {
            CardImage::Memory(bytes) => {
                let start = offset as usize;
                block.copy_from_slice(&bytes[start..start + BLOCK_BYTES]);
                Ok(())
            }
            CardImage::File { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(block)
            }
        }
    }

    fn write_block(&mut self, lba: u64, block: &[u8]) -> io::Result<()> {
        let offset = lba * BLOCK_BYTES as u64;
        match self {
            CardImage::Memory(bytes) => {
                let start = offset as usize;
                bytes[start..start + BLOCK_BYTES].copy_from_slice(block);
                Ok(())
            }
            CardImage::File { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(block)?;
                file.flush()
            }
        }
    }
}

/// Injected controller faults
#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    /// The next command never leaves the NEW state
    hang_next_command: bool,
    /// HSTS error bits the next command fails with
    fail_next_command: Option<u32>,
    /// DATA_FLAG stays set whatever is read from DATA
    fifo_stuck: bool,
    /// DATA_FLAG never sets
    data_never_ready: bool,
}

/// Reply of the card to one command
enum Reply {
    /// No response on the CMD line, the controller reports a timeout
    Silent,
    /// Response without a valid CRC7
    NoCrc(u32),
    Short(u32),
    /// Raw 128 bits as they land in RSP0-3, CRC byte included
    Long(u128),
}

/// Block being received from the host
#[derive(Debug)]
struct Receive {
    lba: u64,
    bytes: Vec<u8>,
}

/// Emulated card identity
#[derive(Debug, Clone, Copy)]
struct Card {
    state: CardState,
    rca: u16,
    app_command_next: bool,
    /// ACMD41 polls answered busy before power up completes
    power_up_polls: u32,
    wide_bus: bool,
    high_capacity: bool,
    /// Version 1.x card, ignores CMD8
    legacy: bool,
}

/// Simulated SDHost register window
#[derive(Debug)]
pub struct SimulatedSdHost {
    regs: [u32; REGISTER_SLOTS],
    card: Card,
    image: CardImage,
    fifo: VecDeque<u32>,
    receive: Option<Receive>,
    faults: Faults,
    writes: Option<Vec<(Reg, u32)>>,
}

/// RCA the card publishes on CMD3
pub const DEFAULT_RCA: u16 = 0xb368;

/// SCR advertising SD 2.0 with 1-bit and 4-bit bus support
pub const SCR: u64 = 0x0235_0000_0000_0000;

impl SimulatedSdHost {
    pub fn new(image: CardImage) -> Self {
        let blocks = image.block_count();
        let high_capacity = blocks >= 1024 && blocks % 1024 == 0;
        debug!(
            "Simulated SD card: {} blocks ({})",
            blocks,
            if high_capacity { "SDHC" } else { "SDSC" }
        );

        let mut regs = [0; REGISTER_SLOTS];
        regs[slot(Reg::Edm)] = 0x0000_000f;

        Self {
            regs,
            card: Card {
                state: CardState::Idle,
                rca: 0,
                app_command_next: false,
                power_up_polls: 1,
                wide_bus: false,
                high_capacity,
                legacy: false,
            },
            image,
            fifo: VecDeque::new(),
            receive: None,
            faults: Faults::default(),
            writes: None,
        }
    }

    /// Card backed by an in-memory image
    pub fn with_memory(bytes: Vec<u8>) -> Self {
        Self::new(CardImage::Memory(bytes))
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(CardImage::open(path)?))
    }

    pub fn image(&self) -> &CardImage {
        &self.image
    }

    pub fn into_image(self) -> CardImage {
        self.image
    }

    pub fn card_state(&self) -> CardState {
        self.card.state
    }

    pub fn is_wide_bus(&self) -> bool {
        self.card.wide_bus
    }

    /// Register value without any access side effect
    pub fn peek(&self, reg: Reg) -> u32 {
        self.regs[slot(reg)]
    }

    /// Forces a register value without going through the write path
    pub fn poke(&mut self, reg: Reg, value: u32) {
        self.regs[slot(reg)] = value;
    }

    /// Starts recording register writes, off by default
    pub fn record_writes(&mut self) {
        self.writes.get_or_insert_with(Vec::new);
    }

    /// Every register write seen since recording started, in order
    pub fn writes(&self) -> &[(Reg, u32)] {
        self.writes.as_deref().unwrap_or(&[])
    }

    pub fn clear_writes(&mut self) {
        if let Some(writes) = &mut self.writes {
            writes.clear();
        }
    }

    /// Words waiting in the read FIFO
    pub fn fifo_len(&self) -> usize {
        self.fifo.len()
    }

    /// Queues words into the read FIFO as if the card had sent them
    pub fn fill_fifo(&mut self, words: impl IntoIterator<Item = u32>) {
        self.fifo.extend(words);
    }

    /// ACMD41 polls the card answers busy before reporting power up
    pub fn set_power_up_polls(&mut self, polls: u32) {
        self.card.power_up_polls = polls;
    }

    /// Behave as a version 1.x card: no CMD8, no high capacity
    pub fn set_legacy(&mut self, legacy: bool) {
        self.card.legacy = legacy;
        if legacy {
            self.card.high_capacity = false;
        }
    }

    pub fn hang_next_command(&mut self) {
        self.faults.hang_next_command = true;
    }

    pub fn fail_next_command(&mut self, hsts_bits: u32) {
        self.faults.fail_next_command = Some(hsts_bits);
    }

    pub fn set_fifo_stuck(&mut self, stuck: bool) {
        self.faults.fifo_stuck = stuck;
    }

    pub fn set_data_never_ready(&mut self, never_ready: bool) {
        self.faults.data_never_ready = never_ready;
    }

    /// CID as the card returns it, CRC byte included
    pub fn cid(&self) -> u128 {
        let mut cid = 0u128;
        cid |= 0x03u128 << 120; // MID
        cid |= u128::from(u16::from_be_bytes(*b"SD")) << 104;
        cid |= u128::from(u64::from_be_bytes(*b"\0\0\0SIMUL")) << 64;
        cid |= 0x10u128 << 56; // PRV 1.0
        cid |= 0x1234_5678u128 << 24; // PSN
        cid |= ((26u128 << 4) | 10) << 8; // MDT October 2026
        cid | 0x01
    }

    /// CSD describing the image capacity, CRC byte included
    pub fn csd(&self) -> u128 {
        let blocks = self.image.block_count();
        let mut csd = 0u128;
        csd |= 0x0eu128 << 112; // TAAC
        csd |= 0x32u128 << 96; // TRAN_SPEED 25 MHz
        csd |= 0x5b5u128 << 84; // CCC
        csd |= 9u128 << 80; // READ_BL_LEN 512

        if self.card.high_capacity {
            csd |= 1u128 << 126;
            csd |= u128::from((blocks / 1024 - 1) as u32) << 48;
        } else {
            let mult = (0..=7u32)
                .rev()
                .find(|mult| blocks % (1u64 << (mult + 2)) == 0 && blocks >> (mult + 2) <= 4096)
                .unwrap_or(0);
            let c_size = (blocks >> (mult + 2)).saturating_sub(1);
            csd |= u128::from(c_size as u32 & 0xfff) << 62;
            csd |= u128::from(mult) << 47;
        }

        csd | 0x01
    }

    fn powered(&self) -> bool {
        self.peek(Reg::Vdd) & vdd::POWER_ON != 0
    }

    fn data_flag(&self) -> bool {
        if self.faults.data_never_ready {
            return false;
        }
        if self.faults.fifo_stuck || !self.fifo.is_empty() {
            return true;
        }
        matches!(&self.receive, Some(receive) if receive.bytes.len() < BLOCK_BYTES)
    }

    fn r1(&self) -> u32 {
        let mut r1 = (self.card.state as u32) << card_status::STATE_SHIFT;
        if self.card.app_command_next {
            r1 |= card_status::APP_CMD;
        }
        if self.receive.is_none() && self.fifo.is_empty() {
            r1 |= card_status::READY_FOR_DATA;
        }
        r1
    }

    fn block_address(&self, argument: u32) -> u64 {
        if self.card.high_capacity {
            u64::from(argument)
        } else {
            u64::from(argument) / BLOCK_BYTES as u64
        }
    }

    fn issue(&mut self, value: u32) {
        let index = (value & cmd_flags::INDEX_MASK) as u8;
        let argument = self.peek(Reg::Arg);

        if self.faults.hang_next_command {
            self.faults.hang_next_command = false;
            debug!("SDHost sim: CMD{} left in flight", index);
            self.regs[slot(Reg::Cmd)] = value | cmd_flags::NEW;
            return;
        }

        if let Some(bits) = self.faults.fail_next_command.take() {
            debug!("SDHost sim: CMD{} forced to fail with {:#X}", index, bits);
            self.complete(value, true, bits);
            return;
        }

        let reply = if self.powered() {
            self.execute(index, argument)
        } else {
            warn!("SDHost sim: CMD{} issued with the card powered off", index);
            Reply::Silent
        };

        let expects_response = value & cmd_flags::NO_RESPONSE == 0;
        match reply {
            Reply::Silent if expects_response => {
                self.complete(value, true, status::CMD_TIMEOUT);
            }
            Reply::Silent => self.complete(value, false, 0),
            Reply::NoCrc(word) => {
                self.regs[slot(Reg::Rsp0)] = word;
                self.complete(value, true, status::CRC7_ERROR);
            }
            Reply::Short(word) => {
                self.regs[slot(Reg::Rsp0)] = word;
                self.complete(value, false, 0);
            }
            Reply::Long(bits) => {
                for (i, reg) in Reg::RESPONSE.into_iter().enumerate() {
                    self.regs[slot(reg)] = (bits >> (32 * i)) as u32;
                }
                self.complete(value, false, 0);
            }
        }
    }

    fn complete(&mut self, value: u32, failed: bool, hsts_bits: u32) {
        let mut cmd = value & !cmd_flags::NEW;
        if failed {
            cmd |= cmd_flags::FAIL;
        }
        self.regs[slot(Reg::Cmd)] = cmd;
        self.regs[slot(Reg::Hsts)] |= hsts_bits;
        trace!("SDHost sim: CMD -> {:#X}, HSTS |= {:#X}", cmd, hsts_bits);
    }

    fn execute(&mut self, index: u8, argument: u32) -> Reply {
        let app = std::mem::take(&mut self.card.app_command_next);
        if app {
            debug!("SDHost sim: ACMD{} ({:#X})", index, argument);
            if let Some(reply) = self.execute_app(index, argument) {
                return reply;
            }
        } else {
            debug!("SDHost sim: CMD{} ({:#X})", index, argument);
        }

        let addressed = argument >> 16 == u32::from(self.card.rca);
        match index {
            0 => {
                self.card.state = CardState::Idle;
                self.card.rca = 0;
                self.fifo.clear();
                self.receive = None;
                Reply::Silent
            }
            2 if self.card.state == CardState::Ready => {
                self.card.state = CardState::Ident;
                Reply::Long(self.cid())
            }
            3 if matches!(self.card.state, CardState::Ident | CardState::Standby) => {
                self.card.rca = DEFAULT_RCA;
                self.card.state = CardState::Standby;
                // R6 carries the low card status bits only
                let status = self.r1() & 0x1fff;
                Reply::Short((u32::from(self.card.rca) << 16) | status)
            }
            7 if argument == 0 => {
                if self.card.state == CardState::Transfer {
                    self.card.state = CardState::Standby;
                }
                Reply::Silent
            }
            7 if addressed && self.card.state == CardState::Standby => {
                let r1 = self.r1();
                self.card.state = CardState::Transfer;
                Reply::Short(r1)
            }
            8 => {
                if self.card.legacy
                    || self.card.state != CardState::Idle
                    || argument & 0xf00 != 0x100
                {
                    return Reply::Silent;
                }
                Reply::Short(argument & 0xfff)
            }
            9 if addressed && self.card.state == CardState::Standby => Reply::Long(self.csd()),
            10 if addressed && self.card.state == CardState::Standby => Reply::Long(self.cid()),
            12 => {
                let r1 = self.r1();
                self.fifo.clear();
                self.receive = None;
                if matches!(self.card.state, CardState::Data | CardState::Receive) {
                    self.card.state = CardState::Transfer;
                }
                Reply::Short(r1)
            }
            13 if addressed => Reply::Short(self.r1()),
            16 if self.card.state == CardState::Transfer => {
                let r1 = self.r1();
                if argument == BLOCK_LENGTH {
                    Reply::Short(r1)
                } else {
                    Reply::Short(r1 | card_status::BLOCK_LEN_ERROR)
                }
            }
            17 if self.card.state == CardState::Transfer => self.read_single_block(argument),
            24 if self.card.state == CardState::Transfer => self.write_single_block(argument),
            55 => {
                self.card.app_command_next = true;
                Reply::Short(self.r1())
            }
            _ => {
                warn!(
                    "SDHost sim: CMD{} rejected in state {:?}",
                    index, self.card.state
                );
                Reply::Silent
            }
        }
    }

    fn execute_app(&mut self, index: u8, argument: u32) -> Option<Reply> {
        let reply = match index {
            6 if self.card.state == CardState::Transfer => {
                self.card.wide_bus = argument & 0x3 == 0x2;
                Reply::Short(self.r1() | card_status::APP_CMD)
            }
            41 if matches!(self.card.state, CardState::Idle | CardState::Ready) => {
                let mut ocr = ocr::VOLTAGE_WINDOW;
                if self.card.power_up_polls > 0 {
                    self.card.power_up_polls -= 1;
                } else {
                    ocr |= ocr::READY;
                    if self.card.high_capacity {
                        ocr |= ocr::CCS;
                    }
                    self.card.state = CardState::Ready;
                }
                // R3 has no CRC, the controller flags a CRC7 error
                Reply::NoCrc(ocr)
            }
            51 if self.card.state == CardState::Transfer => {
                let bytes = SCR.to_be_bytes();
                self.fifo.extend(
                    bytes
                        .chunks_exact(WORD_BYTES)
                        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])),
                );
                Reply::Short(self.r1() | card_status::APP_CMD)
            }
            _ => return None,
        };
        Some(reply)
    }

    fn read_single_block(&mut self, argument: u32) -> Reply {
        let lba = self.block_address(argument);
        let r1 = self.r1();
        if lba >= self.image.block_count() {
            warn!("SDHost sim: read past the end of the card (block {})", lba);
            return Reply::Short(r1 | card_status::OUT_OF_RANGE);
        }

        let mut block = [0u8; BLOCK_BYTES];
        if let Err(e) = self.image.read_block(lba, &mut block) {
            warn!("Failed to read SD card image block {}: {}", lba, e);
            block.fill(0);
        }
        self.fifo.extend(
            block
                .chunks_exact(WORD_BYTES)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])),
        );
        self.card.state = CardState::Data;
        trace!("SDHost sim: block {} queued", lba);
        Reply::Short(r1)
    }

    fn write_single_block(&mut self, argument: u32) -> Reply {
        let lba = self.block_address(argument);
        let r1 = self.r1();
        if lba >= self.image.block_count() {
            warn!("SDHost sim: write past the end of the card (block {})", lba);
            return Reply::Short(r1 | card_status::OUT_OF_RANGE);
        }

        self.receive = Some(Receive {
            lba,
            bytes: Vec::with_capacity(BLOCK_BYTES),
        });
        self.card.state = CardState::Receive;
        Reply::Short(r1)
    }

    fn pop_data(&mut self) -> u32 {
        let Some(word) = self.fifo.pop_front() else {
            trace!("SDHost sim: DATA read with an empty FIFO");
            return 0;
        };
        if self.fifo.is_empty() && self.card.state == CardState::Data {
            self.card.state = CardState::Transfer;
        }
        word
    }

    fn push_data(&mut self, word: u32) {
        let Some(receive) = self.receive.as_mut() else {
            warn!("SDHost sim: DATA write {:#X} with no block pending", word);
            return;
        };
        receive.bytes.extend_from_slice(&word.to_le_bytes());
        if receive.bytes.len() < BLOCK_BYTES {
            return;
        }

        if let Some(receive) = self.receive.take() {
            if let Err(e) = self.image.write_block(receive.lba, &receive.bytes) {
                warn!("Failed to write SD card image block {}: {}", receive.lba, e);
            } else {
                trace!("SDHost sim: block {} programmed", receive.lba);
            }
        }
        self.card.state = CardState::Transfer;
    }
}

fn slot(reg: Reg) -> usize {
    reg.offset() as usize / 4
}

impl RegisterWindow for SimulatedSdHost {
    fn read32(&mut self, reg: Reg) -> u32 {
        match reg {
            Reg::Hsts => {
                let mut value = self.peek(Reg::Hsts);
                if self.data_flag() {
                    value |= status::DATA_FLAG;
                }
                value
            }
            Reg::Data => self.pop_data(),
            _ => self.peek(reg),
        }
    }

    fn write32(&mut self, reg: Reg, value: u32) {
        if let Some(writes) = &mut self.writes {
            writes.push((reg, value));
        }

        match reg {
            Reg::Cmd if value & cmd_flags::NEW != 0 => self.issue(value),
            Reg::Hsts => self.regs[slot(Reg::Hsts)] &= !(value & status::CLEAR_MASK),
            Reg::Edm => {
                if value & edm::FIFO_CLEAR != 0 {
                    trace!("SDHost sim: FIFO cleared");
                    self.fifo.clear();
                    self.receive = None;
                }
                self.regs[slot(Reg::Edm)] = value & !edm::FIFO_CLEAR;
            }
            Reg::Vdd => {
                if value & vdd::POWER_ON == 0 && self.powered() {
                    debug!("SDHost sim: card powered off");
                    self.card.state = CardState::Idle;
                    self.card.rca = 0;
                    self.card.wide_bus = false;
                    self.fifo.clear();
                    self.receive = None;
                }
                self.regs[slot(Reg::Vdd)] = value;
            }
            Reg::Data => self.push_data(value),
            _ => self.regs[slot(reg)] = value,
        }
    }
}
