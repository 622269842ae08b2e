//! Platform collaborators the engine depends on but does not implement:
//! the stall, the firmware clock query and the disk activity indicator.

use std::time::Duration;

use sdhost_hw::specs::clock::{CORE_CLOCK_ID, CORE_HZ};
use tracing::trace;

use crate::error::{DeviceFault, Result, SdhcError};
use crate::poll::Stall;

pub trait Platform: Stall {
    /// Frequency in hertz of the firmware clock `clock_id`
    fn clock_rate(&mut self, clock_id: u32) -> Result<u32>;

    /// Turns the disk activity indicator on or off
    fn set_activity(&mut self, on: bool);
}

/// Hosted platform: sleeps the calling thread and reports a fixed core clock
#[derive(Debug, Clone)]
pub struct StdPlatform {
    core_clock_hz: u32,
}

impl StdPlatform {
    pub fn new(core_clock_hz: u32) -> Self {
        Self { core_clock_hz }
    }
}

impl Default for StdPlatform {
    fn default() -> Self {
        Self::new(CORE_HZ)
    }
}

impl Stall for StdPlatform {
    fn stall(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl Platform for StdPlatform {
    fn clock_rate(&mut self, clock_id: u32) -> Result<u32> {
        if clock_id != CORE_CLOCK_ID {
            return Err(SdhcError::DeviceError(DeviceFault::ClockUnavailable { clock_id }));
        }
        trace!("Clock {} rate: {}Hz", clock_id, self.core_clock_hz);
        Ok(self.core_clock_hz)
    }

    fn set_activity(&mut self, on: bool) {
        trace!("Activity LED: {}", if on { "on" } else { "off" });
    }
}
