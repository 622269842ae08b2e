//! Register access shim.
//!
//! The engine only ever talks to the controller through [`RegisterWindow`],
//! so the same code drives real MMIO and the simulated controller.

use std::ptr::NonNull;

use sdhost_hw::mmio::sdhost::{Reg, SDCMD, SDHSTS, status};
use tock_registers::LocalRegisterCopy;
use tracing::trace;

use crate::error::{Result, SdhcError};

/// Typed 32-bit access to a fixed set of controller registers.
///
/// Reads take `&mut self`: reading DATA pops the FIFO.
pub trait RegisterWindow {
    fn read32(&mut self, reg: Reg) -> u32;
    fn write32(&mut self, reg: Reg, value: u32);
}

/// Volatile access to a memory-mapped SDHost window
#[derive(Debug)]
pub struct MmioWindow {
    base: NonNull<u8>,
}

impl MmioWindow {
    /// Wraps the register window starting at `base`.
    ///
    /// # Safety
    /// `base` must be the start of a mapped SDHost register window that
    /// stays mapped for the lifetime of the returned value, and nothing else
    /// may access that window while the returned value is alive.
    pub unsafe fn new(base: *mut u8) -> Result<Self> {
        NonNull::new(base)
            .map(|base| Self { base })
            .ok_or(SdhcError::InvalidParameter("null register window base"))
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn register(&self, reg: Reg) -> *mut u32 {
        // SAFETY: every `Reg` offset lies inside the window promised by `new`.
        unsafe { self.base.as_ptr().add(reg.offset() as usize).cast::<u32>() }
    }
}

impl RegisterWindow for MmioWindow {
    fn read32(&mut self, reg: Reg) -> u32 {
        // SAFETY: aligned register inside an exclusively owned window.
        unsafe { self.register(reg).read_volatile() }
    }

    fn write32(&mut self, reg: Reg, value: u32) {
        // SAFETY: aligned register inside an exclusively owned window.
        unsafe { self.register(reg).write_volatile(value) }
    }
}

/// Register window plus the typed helpers shared by every engine component
#[derive(Debug)]
pub struct Registers<W> {
    window: W,
}

impl<W: RegisterWindow> Registers<W> {
    pub fn new(window: W) -> Self {
        Self { window }
    }

    pub fn read(&mut self, reg: Reg) -> u32 {
        let value = self.window.read32(reg);
        trace!("SDHost read {}: {:#010X}", reg.name(), value);
        value
    }

    pub fn write(&mut self, reg: Reg, value: u32) {
        trace!("SDHost write {}: {:#010X}", reg.name(), value);
        self.window.write32(reg, value);
    }

    /// Read-modify-write of a whole register
    pub fn update(&mut self, reg: Reg, f: impl FnOnce(u32) -> u32) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }

    pub fn command(&mut self) -> LocalRegisterCopy<u32, SDCMD::Register> {
        LocalRegisterCopy::new(self.read(Reg::Cmd))
    }

    pub fn status(&mut self) -> LocalRegisterCopy<u32, SDHSTS::Register> {
        LocalRegisterCopy::new(self.read(Reg::Hsts))
    }

    /// Write-1-to-clear every status flag
    pub fn clear_status(&mut self) {
        self.write(Reg::Hsts, status::CLEAR_MASK);
    }

    /// Trace-level dump of the whole window. DATA is skipped, reading it
    /// would consume a FIFO word.
    pub fn dump(&mut self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        trace!("SDHost registers dump:");
        for reg in Reg::ALL {
            if reg == Reg::Data {
                continue;
            }
            let value = self.window.read32(reg);
            trace!("  {:<4}: {:#010X}", reg.name(), value);
        }
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut W {
        &mut self.window
    }

    pub fn into_window(self) -> W {
        self.window
    }
}
