//! `daq-sync`
//!
//! Synchronisation core for multiplexed optical imaging: a camera captures
//! frames while a digital-output device cycles through up to three
//! illumination modes on a shared timeline.
//!
//! ## Components
//!
//! - [`WaveformCompiler`]: pure function from [`CycleConfig`] to the sample
//!   pattern the output device replays forever
//! - [`TriggerSequencer`]: owns the output channel and the live waveform
//! - [`AcquisitionLoop`]: assigns each arriving frame to a mode by cycle
//!   position, publishes it and retains it for saving
//! - [`FrameRateMonitor`]: rolling per-mode interval statistics
//! - [`AcquisitionStateMachine`]: Idle / Running / Error lifecycle
//! - [`AcquisitionSession`]: orchestrates all of the above
//!
//! ## Data flow
//!
//! ```text
//!  CycleConfig ──▶ WaveformCompiler ──▶ TriggerSequencer ──▶ output device (1 kHz, looping)
//!                                                                  │ trigger line
//!                                                                  ▼
//!  display ◀── broadcast ◀── AcquisitionLoop ◀── wait/read ◀── camera
//!                                  │
//!                                  └──▶ SaveBuffer ──▶ FrameSink (at stop)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use daq_sync::{compile, waveform::TRIGGER_MASK};
//!
//! let waveform = compile("unlit,blue".parse().unwrap(), 2.0, 200, 10).unwrap();
//! assert_eq!(waveform.len(), 1000);
//! assert_eq!(waveform.samples()[0], TRIGGER_MASK);
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod rate_monitor;
pub mod sequencer;
pub mod session;
pub mod state;
pub mod waveform;

pub use acquisition::{
    AcquisitionLoop, AcquisitionStats, FrameRecord, LoopEvent, LoopOutcome, LoopSettings,
    SaveBuffer,
};
pub use config::{CycleConfig, ExposureClamp};
pub use error::{Result, SyncError};
pub use rate_monitor::{FrameRateMonitor, IntervalRing};
pub use sequencer::TriggerSequencer;
pub use session::{AcquisitionSession, PersistenceOutcome, RunMetadata, RunSummary};
pub use state::{AcquisitionState, AcquisitionStateMachine, StateSnapshot};
pub use waveform::{compile, ExposureWindow, Waveform, WaveformCompiler};
