//! Completion waiter: decides whether an issued command finished and how.
//!
//! Classification is split in two so it can be tested without any polling:
//! a baseline derived from the register snapshot, then the ordered
//! [`QUIRKS`] table of known controller artifacts.

use sdhost_hw::mmio::sdhost::{Reg, SDCMD, cmd_flags, status};
use tock_registers::LocalRegisterCopy;
use tracing::{error, trace, warn};

use crate::command::Command;
use crate::error::{DeviceFault, Result, SdhcError, TimeoutSite};
use crate::host::SdHost;
use crate::platform::Platform;
use crate::poll::poll_while;
use crate::regs::RegisterWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Timeout,
    DeviceError,
}

/// Register state sampled once the busy wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Retries left, 0 when the NEW bit never cleared
    pub remaining: u32,
    /// Last command register value
    pub cmd: u32,
    /// Host status masked with the error bits
    pub errors: u32,
}

impl Completion {
    pub fn baseline(&self) -> Outcome {
        let cmd: LocalRegisterCopy<u32, SDCMD::Register> = LocalRegisterCopy::new(self.cmd);

        if self.remaining == 0 {
            Outcome::Timeout
        } else if cmd.is_set(SDCMD::FAIL) {
            if self.errors & status::CMD_TIMEOUT != 0 {
                Outcome::Timeout
            } else {
                Outcome::DeviceError
            }
        } else {
            Outcome::Success
        }
    }
}

/// A known controller artifact and the outcome it overrides to
pub struct Quirk {
    pub name: &'static str,
    pub applies: fn(&Command, u32, &Completion, Outcome) -> bool,
    pub outcome: Outcome,
}

/// Quirks in evaluation order; each one sees the outcome left by the
/// previous ones.
pub static QUIRKS: &[Quirk] = &[
    Quirk {
        name: "ignored CRC7 error",
        applies: crc7_only,
        outcome: Outcome::Success,
    },
    Quirk {
        name: "CMD7 deselect",
        applies: deselect_rca_zero,
        outcome: Outcome::Success,
    },
];

// R3 (OCR) and other CRC-less responses trip the CRC7 check
fn crc7_only(_: &Command, _: u32, completion: &Completion, outcome: Outcome) -> bool {
    outcome == Outcome::DeviceError && completion.errors == status::CRC7_ERROR
}

// Deselecting with CMD7 and RCA 0 always times out on the SDHost
fn deselect_rca_zero(cmd: &Command, argument: u32, _: &Completion, _: Outcome) -> bool {
    cmd.index == 7 && argument == 0
}

/// Baseline classification followed by every applicable quirk
pub fn classify(cmd: &Command, argument: u32, completion: &Completion) -> Outcome {
    let mut outcome = completion.baseline();

    for quirk in QUIRKS {
        if (quirk.applies)(cmd, argument, completion, outcome) {
            if quirk.outcome != outcome {
                warn!(
                    "{} for {}: {:?} reported as {:?} (status {:#X})",
                    quirk.name, cmd, outcome, quirk.outcome, completion.errors
                );
            }
            outcome = quirk.outcome;
        }
    }

    outcome
}

impl<W: RegisterWindow, P: Platform> SdHost<W, P> {
    /// Waits for a previously issued command to leave the NEW state
    pub(crate) fn wait_for_idle(&mut self) -> Result<()> {
        let regs = &mut self.regs;
        let polled = poll_while(&mut self.platform, self.config.poll, || {
            let cmd = regs.command();
            (cmd.is_set(SDCMD::NEW), cmd.get())
        });

        if polled.snapshot & cmd_flags::NEW != 0 {
            error!("SDHC{}: previous command never completed", self.config.id);
            return Err(SdhcError::DeviceError(DeviceFault::ControllerBusy));
        }
        Ok(())
    }

    /// Waits for `cmd` to complete and classifies the result. The status
    /// register is clean when this returns, whatever the outcome.
    pub(crate) fn wait_for_completion(&mut self, cmd: &Command, argument: u32) -> Result<()> {
        let regs = &mut self.regs;
        let polled = poll_while(&mut self.platform, self.config.poll, || {
            let reg = regs.command();
            (reg.is_set(SDCMD::NEW), reg.get())
        });

        let completion = Completion {
            remaining: polled.remaining,
            cmd: polled.snapshot,
            errors: self.regs.read(Reg::Hsts) & status::ERROR_MASK,
        };
        trace!("{} completion: {:?}", cmd, completion);

        let outcome = classify(cmd, argument, &completion);
        if outcome != Outcome::Success {
            error!(
                "SDHC{}: error in getting {} response, {:?}, status {:#X}",
                self.config.id, cmd, outcome, completion.errors
            );
            if outcome == Outcome::Timeout && cmd.timeout_may_be_expected() {
                warn!("SDHC{}: timeout for {} may be expected", self.config.id, cmd);
            } else {
                self.regs.dump();
            }
        }

        self.regs.clear_status();

        match outcome {
            Outcome::Success => Ok(()),
            Outcome::Timeout => Err(SdhcError::Timeout(TimeoutSite::Command(*cmd))),
            Outcome::DeviceError => Err(SdhcError::DeviceError(DeviceFault::CommandFailed {
                command: *cmd,
                status: completion.errors,
            })),
        }
    }
}
