/// Clock specifications
pub mod clock {
    /// VideoCore core clock feeding the SDHost divider (250 MHz)
    ///
    /// Note: the real value should be queried from the firmware mailbox,
    /// this is only the documented default.
    pub const CORE_HZ: u32 = 250_000_000;

    /// Card identification mode clock (400 kHz)
    pub const IDENTIFICATION_HZ: u32 = 400_000;

    /// Default speed data transfer clock (25 MHz)
    pub const DEFAULT_SPEED_HZ: u32 = 25_000_000;

    /// Mailbox clock identifier of the core clock
    pub const CORE_CLOCK_ID: u32 = 4;
}

/// Data transfer limits
pub mod transfer {
    /// Fixed block length in bytes
    pub const BLOCK_LENGTH: u32 = 512;

    /// Largest block count the host can describe in one transfer
    pub const MAX_BLOCK_COUNT: u32 = 0xFFFF;

    /// FIFO granularity in bytes
    pub const WORD_BYTES: usize = 4;
}

/// Polling and stabilization timing
pub mod timing {
    /// Register polls before giving up (~100 ms at the nominal poll rate)
    pub const POLL_RETRY_COUNT: u32 = 1_000_000;

    /// Delay between two consecutive polls of the same register (20 us)
    pub const POLL_WAIT_US: u64 = 20;

    /// Power rail stabilization delay used by the full reset (10 ms)
    pub const STABILIZE_US: u64 = 10_000;
}
