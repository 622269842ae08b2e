//! # References
//! - <https://www.raspberrypi.org/documentation/hardware/raspberrypi/bcm2836/README.md>
//! - BCM2835 ARM Peripherals, section 1.2.3 (peripheral addresses)

/// Peripheral bus window as seen from the ARM cores
pub mod peripherals {
    /// BCM2836/BCM2837 peripheral base (Raspberry Pi 2/3)
    pub const BASE: u64 = 0x3F000000;

    /// BCM2835 peripheral base (Raspberry Pi 1/Zero)
    pub const BASE_BCM2835: u64 = 0x20000000;

    /// Size of the peripheral window (16 MB)
    pub const SIZE: usize = 16 * 1024 * 1024;
}

/// SDHost register window
pub mod sdhost {
    /// Offset of the SDHost block inside the peripheral window
    pub const OFFSET: u64 = 0x202000;

    /// SDHost base address on BCM2836/BCM2837
    pub const BASE: u64 = super::peripherals::BASE + OFFSET;

    /// Size of the SDHost register window
    pub const SIZE: usize = 0x100;
}
