//! Bounded busy-wait shared by every waiting site of the engine.
//!
//! The controller needs a minimum spacing between two polls of the same
//! register to update its state, so the stall happens on every iteration.

use std::time::Duration;

use sdhost_hw::specs::timing::{POLL_RETRY_COUNT, POLL_WAIT_US};

/// Cooperative delay between two polls
pub trait Stall {
    fn stall(&mut self, duration: Duration);
}

/// Retry budget and per-iteration wait of a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub retries: u32,
    pub wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            retries: POLL_RETRY_COUNT,
            wait: Duration::from_micros(POLL_WAIT_US),
        }
    }
}

/// Result of a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polled<T> {
    /// Retries left when the loop stopped, 0 signals a timeout
    pub remaining: u32,
    /// Last sampled register value
    pub snapshot: T,
}

impl<T> Polled<T> {
    pub fn timed_out(&self) -> bool {
        self.remaining == 0
    }
}

/// Samples with `step` until it reports it no longer needs to wait, or the
/// retry budget of `policy` runs out.
///
/// `step` returns `(keep_waiting, snapshot)`. It runs once up front and once
/// after every stall.
pub fn poll_while<S, T>(
    stall: &mut S,
    policy: PollPolicy,
    mut step: impl FnMut() -> (bool, T),
) -> Polled<T>
where
    S: Stall + ?Sized,
{
    let mut remaining = policy.retries;
    let (mut waiting, mut snapshot) = step();

    while waiting && remaining > 0 {
        stall.stall(policy.wait);
        remaining -= 1;
        (waiting, snapshot) = step();
    }

    Polled {
        remaining,
        snapshot,
    }
}
