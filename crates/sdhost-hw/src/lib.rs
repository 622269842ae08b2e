//! Hardware description of the BCM283x SDHost controller.
//!
//! Register offsets, bit-exact field layouts and fixed timing constants
//! consumed by the `sdhost` driver engine. Nothing in here touches hardware.

pub mod memory_map;
pub mod mmio;
pub mod specs;
