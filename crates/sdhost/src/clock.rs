//! Clock programmer.

use sdhost_hw::mmio::sdhost::Reg;
use sdhost_hw::specs::clock::CORE_CLOCK_ID;
use tracing::{error, trace};

use crate::error::{Result, SdhcError};
use crate::host::SdHost;
use crate::platform::Platform;
use crate::regs::RegisterWindow;

/// Largest SD clock target the divider math accepts
pub const MAX_TARGET_HZ: u32 = u32::MAX / 2;

/// Divider setting for a requested SD clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDivider {
    /// Value for CDIV, the SD clock is `core / (divider + 2)`
    pub divider: u32,
    /// SD clock actually produced by `divider`
    pub actual_hz: u32,
}

impl ClockDivider {
    /// Integer divider for `target_hz`; no rounding correction, the result
    /// may be off by one divider step. `None` for a target of zero or above
    /// [`MAX_TARGET_HZ`].
    pub fn for_target(core_hz: u32, target_hz: u32) -> Option<Self> {
        if target_hz == 0 {
            return None;
        }
        let twice = target_hz.checked_mul(2)?;
        let divider = core_hz.saturating_sub(twice) / target_hz;
        let actual_hz = core_hz / (divider + 2);
        Some(Self { divider, actual_hz })
    }
}

impl<W: RegisterWindow, P: Platform> SdHost<W, P> {
    pub(crate) fn program_clock(&mut self, target_hz: u32) -> Result<()> {
        if target_hz == 0 {
            return Err(SdhcError::InvalidParameter("zero SD clock"));
        }
        if target_hz > MAX_TARGET_HZ {
            return Err(SdhcError::InvalidParameter("SD clock target too high"));
        }

        let core_hz = self.platform.clock_rate(CORE_CLOCK_ID).inspect_err(|e| {
            error!("SDHC{}: failed to query core clock: {}", self.config.id, e);
        })?;

        let Some(clock) = ClockDivider::for_target(core_hz, target_hz) else {
            return Err(SdhcError::InvalidParameter("SD clock target out of range"));
        };

        trace!(
            "SDHC{}: core clock={}Hz, CDIV={}, requested={}Hz, actual={}Hz",
            self.config.id, core_hz, clock.divider, target_hz, clock.actual_hz
        );

        self.regs.write(Reg::Cdiv, clock.divider);
        // Data timeout of one second worth of SD clock cycles
        self.regs.write(Reg::Tout, clock.actual_hz);
        Ok(())
    }
}
