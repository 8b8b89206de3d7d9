//! Mock hardware for the multiplexed imaging rig.
//!
//! This crate provides simulated devices so the synchronization core can be
//! exercised without a digital-output card or a camera attached. All mock
//! devices use async-safe operations (`tokio::time::sleep`, never
//! `std::thread::sleep`), so tests can run them under paused time.
//!
//! # Available Mock Drivers
//!
//! - [`MockDigitalOutput`] - Digital-output card replaying a line pattern
//!   at its sample clock and emitting a [`TriggerPulse`] per exposure
//! - [`MockCamera`] - Newest-frame camera that exposes a frame per trigger
//!   pulse, with optional frame loss and error injection
//!
//! # Wiring
//!
//! ```rust,ignore
//! use daq_driver_mock::{MockCamera, MockDigitalOutput};
//!
//! let output = MockDigitalOutput::new();
//! let camera = MockCamera::new(64, 64);
//! camera.attach_trigger(output.subscribe_pulses());
//! ```

pub mod common;
mod mock_camera;
mod mock_digital_output;
pub mod pattern;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, MockRng, TimingConfig};

// Re-export driver types
pub use mock_camera::{FrameStatistics, MockCamera, MockCameraBuilder};
pub use mock_digital_output::{MockDigitalOutput, MockDigitalOutputBuilder, TriggerPulse};
