//! Memory-mapped register windows.

pub mod sdhost;
