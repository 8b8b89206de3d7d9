//! Common infrastructure for mock devices.
//!
//! - **timing**: hardware-like delays (camera readout, bus latency)
//! - **errors**: error injection framework
//! - **rng**: seeded random number generator

pub mod errors;
pub mod rng;
pub mod timing;

// Re-export commonly used types
pub use errors::{ErrorConfig, ErrorScenario};
pub use rng::MockRng;
pub use timing::TimingConfig;
