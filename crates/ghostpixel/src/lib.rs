//! Umbrella crate for GhostPixel.
//!
//! Re-exports the engine and protocol crates so downstream code can depend on a
//! single crate name (`ghostpixel`).

pub use ghostpixel_engine as engine;
pub use ghostpixel_protocol as protocol;
