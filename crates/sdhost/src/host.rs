//! The controller instance and the capability surface it publishes.

use std::time::Duration;

use sdhost_hw::mmio::sdhost::{Reg, host_config};
use sdhost_hw::specs::timing::STABILIZE_US;
use sdhost_hw::specs::transfer::{BLOCK_LENGTH, MAX_BLOCK_COUNT};
use tracing::{info, instrument, trace};

use crate::command::{Command, TransferInfo};
use crate::error::{Result, SdhcError};
use crate::platform::Platform;
use crate::poll::PollPolicy;
use crate::regs::{MmioWindow, RegisterWindow, Registers};
use crate::reset::ResetScope;
use crate::response::Response;

/// Configuration of one controller instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Identifier used in diagnostics
    pub id: u32,
    /// Retry budget shared by every polling site
    pub poll: PollPolicy,
    /// Power rail stabilization delay of the full reset
    pub stabilize: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            id: 1,
            poll: PollPolicy::default(),
            stabilize: Duration::from_micros(STABILIZE_US),
        }
    }
}

/// Transfer limits reported to block-I/O consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_block_size: u32,
    pub max_block_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

impl TryFrom<u32> for BusWidth {
    type Error = SdhcError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            1 => Ok(BusWidth::One),
            4 => Ok(BusWidth::Four),
            8 => Ok(BusWidth::Eight),
            _ => Err(SdhcError::InvalidParameter("unknown bus width")),
        }
    }
}

/// Operations an SD host controller exposes to the card/block layer.
///
/// No method may be called while another one is running on the same
/// controller; implementations do no locking of their own.
pub trait SdhcProtocol {
    fn capabilities(&self) -> Capabilities;

    fn software_reset(&mut self, scope: ResetScope) -> Result<()>;

    /// Programs the SD clock as close to `target_hz` as the divider allows
    fn set_clock(&mut self, target_hz: u32) -> Result<()>;

    fn set_bus_width(&mut self, width: BusWidth) -> Result<()>;

    fn is_card_present(&mut self) -> bool;

    fn is_read_only(&mut self) -> bool;

    /// Issues `cmd` and waits for the controller to complete it
    fn send_command(
        &mut self,
        cmd: &Command,
        argument: u32,
        transfer: Option<&TransferInfo>,
    ) -> Result<()>;

    /// Reads the response of the last completed `cmd`
    fn receive_response(&mut self, cmd: &Command) -> Result<Response>;

    /// Fills `buffer` from the data FIFO; its length must be a multiple of 4
    fn read_block_data(&mut self, buffer: &mut [u8]) -> Result<()>;

    /// Drains `buffer` into the data FIFO; its length must be a multiple of
    /// the block length
    fn write_block_data(&mut self, buffer: &[u8]) -> Result<()>;

    /// Releases the controller and everything it owns
    fn cleanup(self)
    where
        Self: Sized;
}

/// BCM283x SDHost controller instance.
///
/// Owns its register window exclusively; two instances must never be
/// created over the same window.
#[derive(Debug)]
pub struct SdHost<W, P> {
    pub(crate) config: HostConfig,
    pub(crate) regs: Registers<W>,
    pub(crate) platform: P,
}

impl<W: RegisterWindow, P: Platform> SdHost<W, P> {
    pub fn new(window: W, platform: P, config: HostConfig) -> Self {
        info!("Initializing SDHC{}", config.id);
        Self {
            config,
            regs: Registers::new(window),
            platform,
        }
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn window(&self) -> &W {
        self.regs.window()
    }

    pub fn window_mut(&mut self) -> &mut W {
        self.regs.window_mut()
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Gives the register window and platform back to the owner
    pub fn into_parts(self) -> (W, P) {
        (self.regs.into_window(), self.platform)
    }
}

impl<P: Platform> SdHost<MmioWindow, P> {
    /// Creates an instance driving the memory-mapped window at `base`.
    ///
    /// # Safety
    /// Same contract as [`MmioWindow::new`].
    pub unsafe fn mmio(base: *mut u8, platform: P, config: HostConfig) -> Result<Self> {
        // SAFETY: forwarded to the caller.
        let window = unsafe { MmioWindow::new(base) }?;
        info!("SDHC{} register window @{:p}", config.id, window.base());
        Ok(Self::new(window, platform, config))
    }
}

impl<W: RegisterWindow, P: Platform> SdhcProtocol for SdHost<W, P> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_block_size: BLOCK_LENGTH,
            max_block_count: MAX_BLOCK_COUNT,
        }
    }

    #[instrument(level = "trace", skip(self), fields(sdhc = self.config.id))]
    fn software_reset(&mut self, scope: ResetScope) -> Result<()> {
        self.reset(scope);
        Ok(())
    }

    #[instrument(level = "trace", skip(self), fields(sdhc = self.config.id))]
    fn set_clock(&mut self, target_hz: u32) -> Result<()> {
        self.program_clock(target_hz)
    }

    #[instrument(level = "trace", skip(self), fields(sdhc = self.config.id))]
    fn set_bus_width(&mut self, width: BusWidth) -> Result<()> {
        let wide = match width {
            BusWidth::One => false,
            BusWidth::Four => true,
            BusWidth::Eight => {
                return Err(SdhcError::InvalidParameter("8-bit bus is not supported"));
            }
        };

        self.regs.update(Reg::Hcfg, |hcfg| {
            if wide {
                hcfg | host_config::WIDE_EXT_BUS
            } else {
                hcfg & !host_config::WIDE_EXT_BUS
            }
        });
        Ok(())
    }

    fn is_card_present(&mut self) -> bool {
        // No card detect line is wired to the SDHost
        let present = true;
        trace!("SDHC{} card present: {}", self.config.id, present);
        present
    }

    fn is_read_only(&mut self) -> bool {
        let read_only = false;
        trace!("SDHC{} read only: {}", self.config.id, read_only);
        read_only
    }

    #[instrument(level = "trace", skip(self, cmd, transfer), fields(sdhc = self.config.id, cmd = %cmd))]
    fn send_command(
        &mut self,
        cmd: &Command,
        argument: u32,
        transfer: Option<&TransferInfo>,
    ) -> Result<()> {
        self.dispatch(cmd, argument, transfer)
    }

    #[instrument(level = "trace", skip(self, cmd), fields(sdhc = self.config.id, cmd = %cmd))]
    fn receive_response(&mut self, cmd: &Command) -> Result<Response> {
        Ok(self.read_response(cmd.response))
    }

    #[instrument(level = "trace", skip(self, buffer), fields(sdhc = self.config.id, len = buffer.len()))]
    fn read_block_data(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.read_data(buffer)
    }

    #[instrument(level = "trace", skip(self, buffer), fields(sdhc = self.config.id, len = buffer.len()))]
    fn write_block_data(&mut self, buffer: &[u8]) -> Result<()> {
        self.write_data(buffer)
    }

    fn cleanup(self) {
        info!("Releasing SDHC{}", self.config.id);
        drop(self.into_parts());
    }
}
