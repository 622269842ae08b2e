//! Software reset sequencer.

use sdhost_hw::mmio::sdhost::{Reg, edm, host_config, vdd};
use sdhost_hw::specs::transfer::BLOCK_LENGTH;
use tracing::{debug, trace};

use crate::error::{Result, SdhcError};
use crate::host::SdHost;
use crate::platform::Platform;
use crate::regs::RegisterWindow;

/// Which part of the controller a software reset applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Power cycle the card and restore every controller default
    All,
    /// Command and argument registers only
    Cmd,
    /// Status flags and the data FIFO only
    Data,
}

impl TryFrom<u32> for ResetScope {
    type Error = SdhcError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(ResetScope::All),
            1 => Ok(ResetScope::Cmd),
            2 => Ok(ResetScope::Data),
            _ => Err(SdhcError::InvalidParameter("unknown reset scope")),
        }
    }
}

impl<W: RegisterWindow, P: Platform> SdHost<W, P> {
    pub(crate) fn reset(&mut self, scope: ResetScope) {
        match scope {
            ResetScope::All => self.reset_all(),
            ResetScope::Cmd => self.reset_cmd(),
            ResetScope::Data => self.reset_data(),
        }
    }

    fn reset_all(&mut self) {
        debug!("SDHC{}: software reset (all)", self.config.id);
        trace!("Registers before reset");
        self.regs.dump();

        self.regs.write(Reg::Vdd, vdd::POWER_OFF);

        self.regs.write(Reg::Cmd, 0);
        self.regs.write(Reg::Arg, 0);
        self.regs.write(Reg::Cdiv, 0);
        self.regs.clear_status();
        self.regs.write(Reg::Hcfg, 0);
        self.regs.write(Reg::Hblc, 0);
        self.regs.write(Reg::Hbct, 0);
        self.platform.stall(self.config.stabilize);

        self.regs.write(Reg::Vdd, vdd::POWER_ON);
        self.platform.stall(self.config.stabilize);

        self.regs
            .write(Reg::Hcfg, host_config::WIDE_INT_BUS | host_config::SLOW_CARD);

        let previous = self.regs.read(Reg::Edm);
        trace!("EDM {:#X}", previous);
        self.regs
            .write(Reg::Edm, (previous & edm::KEEP_MASK) | edm::THRESHOLDS);

        self.regs.write(Reg::Hbct, BLOCK_LENGTH);

        debug!("SDHC{}: reset all complete", self.config.id);
    }

    fn reset_cmd(&mut self) {
        debug!("SDHC{}: software reset (cmd)", self.config.id);
        self.regs.write(Reg::Cmd, 0);
        self.regs.write(Reg::Arg, 0);
        self.regs.clear_status();
    }

    fn reset_data(&mut self) {
        debug!("SDHC{}: software reset (data)", self.config.id);
        self.regs.clear_status();
        self.regs.update(Reg::Edm, |value| value | edm::FIFO_CLEAR);
    }
}
