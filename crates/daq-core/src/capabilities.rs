//! Capability traits for the collaborators the sync core drives.
//!
//! Following the capability-trait convention used across the workspace, each
//! trait is small, object safe and returns `anyhow::Result` so drivers can
//! attach context freely. Drivers that want callers to react to a specific
//! failure category wrap a [`DriverError`](crate::error::DriverError) in the
//! returned error.
//!
//! - [`FrameSource`]: a camera delivering frames in trigger order
//! - [`PatternOutput`]: a clocked digital-output device replaying a bit pattern
//! - [`FrameSink`]: persistence of per-mode image stacks at the end of a run

use crate::data::Frame;
use crate::mode::Mode;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Capability: Frame Delivery
///
/// Cameras running in an externally triggered mode. The sync core only
/// consumes frames; exposure, gain and cooling are configured elsewhere.
///
/// # Contract
/// - `wait_for_frame()` suspends until a new frame is available or `timeout`
///   elapses. It returns `Ok(false)` on timeout, which is not an error.
/// - `read_newest_frame()` returns the most recent unread frame, or `None`
///   when nothing new arrived since the previous read.
/// - Frames are delivered in the order the exposure triggers fired.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Wait for the next frame, bounded by `timeout`.
    async fn wait_for_frame(&self, timeout: Duration) -> Result<bool>;

    /// Fetch the newest unread frame.
    async fn read_newest_frame(&self) -> Result<Option<Frame>>;
}

/// Capability: Clocked Pattern Output
///
/// Digital-output devices that accept a sample buffer and replay it on a
/// hardware sample clock in continuous (regenerating) mode.
///
/// # Contract
/// - `configure()` sets the sample clock and buffer length; it fails with a
///   [`DriverErrorKind::Busy`](crate::error::DriverErrorKind::Busy) driver
///   error while another pattern is playing.
/// - `write_and_start()` loads the buffer and starts regenerating playback.
///   Repetitions follow each other without gaps.
/// - `stop()` halts playback and disarms the task. Lines keep their last value.
/// - `write_static()` drives the lines to `mask` immediately (software timed).
#[async_trait]
pub trait PatternOutput: Send + Sync {
    /// Short device identifier for logs.
    fn name(&self) -> &str;

    /// Configure the sample clock for a buffer of `samples_per_channel` samples.
    async fn configure(&self, sample_rate_hz: u32, samples_per_channel: usize) -> Result<()>;

    /// Load `samples` and start continuous playback.
    async fn write_and_start(&self, samples: &[u32]) -> Result<()>;

    /// Drive every line to `mask` once, outside of any playback task.
    async fn write_static(&self, mask: u32) -> Result<()>;

    /// Stop playback and release the output task.
    async fn stop(&self) -> Result<()>;
}

/// Outcome of persisting a set of per-mode stacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Files written, one entry per stack file.
    pub written: Vec<PathBuf>,
    /// Modes with frames that could not be written, with the reason.
    pub failed: Vec<(Mode, String)>,
    /// Modes skipped because they held no frames.
    pub skipped: Vec<Mode>,
}

impl SaveReport {
    /// True when every non-empty mode was written.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Capability: Stack Persistence
///
/// Blocking file output; callers in async code run it on a blocking thread.
///
/// # Contract
/// - Empty stacks are skipped and listed in [`SaveReport::skipped`].
/// - A failure for one mode does not prevent the other modes from being
///   written; it is listed in [`SaveReport::failed`].
/// - `Err` is reserved for failures that prevent any output at all (for
///   example an unusable target directory).
pub trait FrameSink: Send + Sync {
    /// Persist one stack per mode.
    fn save_stacks(&self, stacks: &BTreeMap<Mode, Vec<Frame>>) -> Result<SaveReport>;

    /// Persist run metadata as key/value pairs.
    fn save_metadata(&self, metadata: &BTreeMap<String, String>) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_report_completeness() {
        let mut report = SaveReport::default();
        assert!(report.is_complete());
        report.skipped.push(Mode::ExcitationB);
        assert!(report.is_complete());
        report.failed.push((Mode::Unlit, "disk full".into()));
        assert!(!report.is_complete());
    }
}
