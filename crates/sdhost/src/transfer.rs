//! Block data transfer through the data FIFO, one 32-bit word at a time.

use sdhost_hw::mmio::sdhost::{Reg, status};
use sdhost_hw::specs::transfer::{BLOCK_LENGTH, WORD_BYTES};
use tracing::error;

use crate::error::{Result, SdhcError, TimeoutSite};
use crate::host::SdHost;
use crate::platform::Platform;
use crate::poll::poll_while;
use crate::regs::RegisterWindow;

impl<W: RegisterWindow, P: Platform> SdHost<W, P> {
    pub(crate) fn read_data(&mut self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() % WORD_BYTES != 0 {
            return Err(SdhcError::InvalidParameter("read length is not word aligned"));
        }

        self.platform.set_activity(true);
        let result = self.read_words(buffer);
        self.platform.set_activity(false);
        result
    }

    pub(crate) fn write_data(&mut self, buffer: &[u8]) -> Result<()> {
        if buffer.len() % BLOCK_LENGTH as usize != 0 {
            return Err(SdhcError::InvalidParameter("write length is not block aligned"));
        }

        self.platform.set_activity(true);
        let result = self.write_words(buffer);
        self.platform.set_activity(false);
        result
    }

    fn read_words(&mut self, buffer: &mut [u8]) -> Result<()> {
        for (index, word) in buffer.chunks_exact_mut(WORD_BYTES).enumerate() {
            self.wait_for_fifo(index, false)?;
            word.copy_from_slice(&self.regs.read(Reg::Data).to_le_bytes());
        }
        Ok(())
    }

    fn write_words(&mut self, buffer: &[u8]) -> Result<()> {
        for (index, word) in buffer.chunks_exact(WORD_BYTES).enumerate() {
            self.wait_for_fifo(index, true)?;
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.regs.write(Reg::Data, value);
        }
        Ok(())
    }

    /// Waits, with a fresh retry budget, until the FIFO can provide or
    /// accept word `index`
    fn wait_for_fifo(&mut self, index: usize, write: bool) -> Result<()> {
        let regs = &mut self.regs;
        let polled = poll_while(&mut self.platform, self.config.poll, || {
            let hsts = regs.read(Reg::Hsts);
            (hsts & status::DATA_FLAG == 0, hsts)
        });

        if polled.timed_out() {
            error!(
                "SDHC{}: block word {} {} poll timed out",
                self.config.id,
                index,
                if write { "write" } else { "read" }
            );
            self.regs.dump();
            self.regs.clear_status();
            return Err(SdhcError::Timeout(TimeoutSite::DataWord { index, write }));
        }
        Ok(())
    }
}
