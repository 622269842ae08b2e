#![allow(dead_code)]

use std::time::Duration;

use sdhost::error::DeviceFault;
use sdhost::{HostConfig, Platform, PollPolicy, Result, SdHost, SdhcError, SimulatedSdHost, Stall};
use sdhost_hw::specs::clock::CORE_HZ;

pub const BLOCK: usize = 512;

/// Retry budget small enough to exhaust quickly in tests
pub const RETRIES: u32 = 64;

/// Platform double recording every interaction
#[derive(Debug)]
pub struct RecordingPlatform {
    pub stalls: u32,
    pub stalled: Duration,
    pub activity: Vec<bool>,
    pub clock_queries: Vec<u32>,
    pub clock: Result<u32>,
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self {
            stalls: 0,
            stalled: Duration::ZERO,
            activity: Vec::new(),
            clock_queries: Vec::new(),
            clock: Ok(CORE_HZ),
        }
    }
}

impl RecordingPlatform {
    pub fn failing_clock() -> Self {
        Self {
            clock: Err(SdhcError::DeviceError(DeviceFault::ClockUnavailable { clock_id: 4 })),
            ..Self::default()
        }
    }

    pub fn forget(&mut self) {
        self.stalls = 0;
        self.stalled = Duration::ZERO;
        self.activity.clear();
        self.clock_queries.clear();
    }
}

impl Stall for RecordingPlatform {
    fn stall(&mut self, duration: Duration) {
        self.stalls += 1;
        self.stalled += duration;
    }
}

impl Platform for RecordingPlatform {
    fn clock_rate(&mut self, clock_id: u32) -> Result<u32> {
        self.clock_queries.push(clock_id);
        self.clock.clone()
    }

    fn set_activity(&mut self, on: bool) {
        self.activity.push(on);
    }
}

pub type TestHost = SdHost<SimulatedSdHost, RecordingPlatform>;

pub fn config() -> HostConfig {
    HostConfig {
        id: 7,
        poll: PollPolicy {
            retries: RETRIES,
            wait: Duration::from_micros(20),
        },
        ..HostConfig::default()
    }
}

pub fn image(blocks: usize) -> Vec<u8> {
    (0..blocks * BLOCK).map(|i| (i / BLOCK) as u8 ^ (i % 251) as u8).collect()
}

/// Simulated controller over `bytes` with the write spy on
pub fn spied(bytes: Vec<u8>) -> SimulatedSdHost {
    let mut sim = SimulatedSdHost::with_memory(bytes);
    sim.record_writes();
    sim
}

/// Host over a fresh card, nothing done yet
pub fn host(blocks: usize) -> TestHost {
    SdHost::new(spied(image(blocks)), RecordingPlatform::default(), config())
}

/// Host after a full reset, with the spy and the platform records cleared
pub fn powered_host(blocks: usize) -> TestHost {
    use sdhost::{ResetScope, SdhcProtocol};

    let mut host = host(blocks);
    host.software_reset(ResetScope::All).unwrap();
    host.window_mut().clear_writes();
    host.platform_mut().forget();
    host
}
