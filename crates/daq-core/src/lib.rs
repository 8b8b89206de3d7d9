//! `daq-core`
//!
//! Shared vocabulary for the multiplexed imaging synchronisation workspace.
//!
//! This crate defines the types every other crate speaks: acquisition modes
//! and the ordered mode set that defines a cycle, camera frames, the error
//! hierarchy, and the capability traits implemented by hardware drivers and
//! persistence back-ends.
//!
//! ## Key Types
//!
//! - [`Mode`] / [`ModeSet`]: phases of the acquisition cycle, in cycle order
//! - [`Frame`]: raw image payload with optional hardware frame counter
//! - [`DaqError`]: application-wide error type
//! - [`FrameSource`], [`PatternOutput`], [`FrameSink`]: collaborator traits
//!
//! ## Example
//!
//! ```rust
//! use daq_core::{Mode, ModeSet};
//!
//! let cycle: ModeSet = "unlit,blue".parse().unwrap();
//! assert_eq!(cycle.mode_at(3), Some(Mode::ExcitationA));
//! ```

pub mod capabilities;
pub mod data;
pub mod error;
pub mod mode;

pub use capabilities::{FrameSink, FrameSource, PatternOutput, SaveReport};
pub use data::Frame;
pub use error::{DaqError, DriverError, DriverErrorKind};
pub use mode::{Mode, ModeError, ModeSet};
