//! Command dispatcher and read FIFO flush.

use sdhost_hw::mmio::sdhost::{Reg, status};
use sdhost_hw::specs::transfer::MAX_BLOCK_COUNT;
use tracing::{error, trace};

use crate::command::{Command, TransferDirection, TransferInfo};
use crate::error::{Result, SdhcError, TimeoutSite};
use crate::host::SdHost;
use crate::platform::Platform;
use crate::poll::poll_while;
use crate::regs::RegisterWindow;

impl<W: RegisterWindow, P: Platform> SdHost<W, P> {
    pub(crate) fn dispatch(
        &mut self,
        cmd: &Command,
        argument: u32,
        transfer: Option<&TransferInfo>,
    ) -> Result<()> {
        trace!("SDHC{}: send {} ({:#010X})", self.config.id, cmd, argument);

        if let Some(transfer) = transfer
            && let Err(e) = transfer.validate()
        {
            error!(
                "SDHC{}: {} blocks requested, host maximum is {}",
                self.config.id,
                transfer.block_count,
                MAX_BLOCK_COUNT
            );
            return Err(e);
        }

        self.wait_for_idle().inspect_err(|_| {
            error!("SDHC{}: wait for previous command failed", self.config.id);
        })?;

        self.regs.clear_status();

        let value = cmd.register_value();
        if cmd.direction == TransferDirection::Read {
            self.flush_read_fifo()?;
        }

        // The controller samples ARG when CMD is written
        self.regs.clear_status();
        self.regs.write(Reg::Arg, argument);
        self.regs.write(Reg::Cmd, value);

        self.wait_for_completion(cmd, argument)
    }

    /// Discards stale words left in the data FIFO
    pub(crate) fn flush_read_fifo(&mut self) -> Result<()> {
        let regs = &mut self.regs;
        let polled = poll_while(&mut self.platform, self.config.poll, || {
            let hsts = regs.read(Reg::Hsts);
            let pending = hsts & status::DATA_FLAG != 0;
            if pending {
                regs.read(Reg::Data);
            }
            (pending, hsts)
        });

        if polled.timed_out() {
            error!("SDHC{}: time-out for flush FIFO", self.config.id);
            return Err(SdhcError::Timeout(TimeoutSite::FifoFlush));
        }
        Ok(())
    }
}
