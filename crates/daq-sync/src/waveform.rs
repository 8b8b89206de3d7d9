//! Waveform compilation.
//!
//! Turns a [`CycleConfig`] into the digital sample pattern the output device
//! replays forever. The pattern is one period long at a fixed 1 kHz sample
//! clock, so one sample equals one millisecond.
//!
//! # Line assignment
//!
//! | Line | Meaning |
//! |------|---------|
//! | 0 | unused |
//! | 1 | illumination for [`Mode::ExcitationA`] |
//! | 2 | illumination for [`Mode::ExcitationB`] |
//! | 3 | unused |
//! | 4 | camera exposure trigger, shared by all modes |
//!
//! # Time division
//!
//! ```text
//!  sample 0                                            samples_per_period
//!  |<---- slot 0 ---->|<---- slot 1 ---->|<- slot 2 ->|..|
//!  [##exposure##......][#exp#............][##exp##.....]
//! ```
//!
//! Slots have equal width `samples_per_period / |modes|`; the truncation
//! remainder at the end of the period stays low. Within a slot only the first
//! `exposure` samples are set, and masks are OR'd into the sample.

use crate::config::CycleConfig;
use crate::error::Result;
use daq_core::{Mode, ModeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hardware sample clock of the output device.
pub const SAMPLE_RATE_HZ: u32 = 1000;

/// Output line carrying the exposure trigger.
pub const TRIGGER_LINE: u32 = 4;

/// Bit mask of [`TRIGGER_LINE`].
pub const TRIGGER_MASK: u32 = 1 << TRIGGER_LINE;

/// Illumination bit mask for `mode`; zero for [`Mode::Unlit`].
pub fn illumination_mask(mode: Mode) -> u32 {
    match mode {
        Mode::Unlit => 0,
        Mode::ExcitationA => 1 << 1,
        Mode::ExcitationB => 1 << 2,
    }
}

/// Every bit the compiler may set.
pub const ALL_LINES_MASK: u32 = TRIGGER_MASK | (1 << 1) | (1 << 2);

/// Active exposure range of one mode inside the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureWindow {
    /// Mode owning the slot.
    pub mode: Mode,
    /// Position of the slot in the cycle.
    pub slot: usize,
    /// First sample of the window.
    pub start: usize,
    /// Number of samples with the trigger asserted.
    pub len: usize,
}

impl ExposureWindow {
    /// One past the last sample of the window.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Whether sample `index` lies inside the window.
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end()
    }

    /// Mask OR'd into each sample of the window.
    pub fn mask(&self) -> u32 {
        TRIGGER_MASK | illumination_mask(self.mode)
    }
}

/// Compiled sample pattern. Immutable once built; cloning is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Arc<[u32]>,
    slot_width: usize,
    windows: Vec<ExposureWindow>,
    config: CycleConfig,
}

impl Waveform {
    /// Sample masks, one per 1 ms tick.
    pub fn samples(&self) -> &[u32] {
        &self.samples
    }

    /// Number of samples in one period.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false; a waveform has at least one sample.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Width of each mode slot in samples.
    pub fn slot_width(&self) -> usize {
        self.slot_width
    }

    /// Exposure windows in cycle order.
    pub fn windows(&self) -> &[ExposureWindow] {
        &self.windows
    }

    /// Cycle order the waveform was compiled for.
    pub fn modes(&self) -> &ModeSet {
        &self.config.modes
    }

    /// Configuration actually compiled, exposures already clamped.
    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Sample clock the pattern must be replayed at.
    pub fn sample_rate_hz(&self) -> u32 {
        SAMPLE_RATE_HZ
    }

    /// Duration of one repetition on the hardware clock.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.samples.len() as u64 * 1000 / SAMPLE_RATE_HZ as u64)
    }

    /// Number of trigger pulses per repetition (windows with a non-zero length).
    pub fn trigger_count(&self) -> usize {
        self.windows.iter().filter(|w| w.len > 0).count()
    }
}

/// Pure compiler from timing request to sample pattern.
pub struct WaveformCompiler;

impl WaveformCompiler {
    /// Compile `config` into a waveform.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`](crate::SyncError::InvalidConfig) for an
    /// empty mode set, a non-positive or non-finite frequency, or a negative
    /// exposure.
    ///
    /// Exposures longer than 90% of the per-mode period are clamped (and
    /// logged) before compilation.
    pub fn compile(config: &CycleConfig) -> Result<Waveform> {
        config.validate()?;

        let (effective, clamps) = config.clamped();
        for clamp in &clamps {
            warn!(
                mode = %clamp.mode,
                requested_ms = clamp.requested_ms,
                applied_ms = clamp.applied_ms,
                "Exposure exceeds 90% of the per-mode period, clamping"
            );
        }

        let n = effective.samples_per_period();
        let slot_width = n / effective.modes.len();
        let mut samples = vec![0u32; n];
        let mut windows = Vec::with_capacity(effective.modes.len());

        for (slot, mode) in effective.modes.iter().enumerate() {
            let start = slot * slot_width;
            let exposure = usize::try_from(effective.exposure_for(mode)).unwrap_or(0);
            let len = exposure.min(slot_width).min(n.saturating_sub(start));
            let window = ExposureWindow {
                mode,
                slot,
                start,
                len,
            };

            let mask = window.mask();
            for sample in &mut samples[start..window.end()] {
                *sample |= mask;
            }

            if len == 0 {
                warn!(mode = %mode, slot, slot_width, "Exposure window is empty, mode will never trigger");
            } else if len < exposure {
                debug!(
                    mode = %mode,
                    requested = exposure,
                    applied = len,
                    "Exposure truncated to slot width"
                );
            }
            windows.push(window);
        }

        warn_on_merged_pulses(&windows, n);

        debug!(windows = ?windows, "Compiled exposure windows");
        info!(
            modes = %effective.modes,
            cycle_frequency_hz = effective.cycle_frequency_hz,
            samples = n,
            slot_width,
            triggers = windows.iter().filter(|w| w.len > 0).count(),
            "Compiled waveform"
        );

        Ok(Waveform {
            samples: samples.into(),
            slot_width,
            windows,
            config: effective,
        })
    }
}

/// Compile from individual parameters.
///
/// Equivalent to building a [`CycleConfig`] and calling
/// [`WaveformCompiler::compile`].
pub fn compile(
    modes: ModeSet,
    cycle_frequency_hz: f64,
    unlit_exposure_ms: i64,
    excited_exposure_ms: i64,
) -> Result<Waveform> {
    WaveformCompiler::compile(&CycleConfig::new(
        modes,
        cycle_frequency_hz,
        unlit_exposure_ms,
        excited_exposure_ms,
    ))
}

/// Two windows that touch produce one long trigger pulse, which the camera
/// sees as a single exposure.
fn warn_on_merged_pulses(windows: &[ExposureWindow], n: usize) {
    let active: Vec<&ExposureWindow> = windows.iter().filter(|w| w.len > 0).collect();
    for pair in active.windows(2) {
        if pair[0].end() == pair[1].start {
            warn!(
                first = %pair[0].mode,
                second = %pair[1].mode,
                sample = pair[1].start,
                "Adjacent exposure windows merge into one trigger pulse"
            );
        }
    }
    if let (Some(first), Some(last)) = (active.first(), active.last()) {
        if active.len() > 1 && last.end() == n && first.start == 0 {
            warn!(
                first = %last.mode,
                second = %first.mode,
                "Exposure windows merge across the period boundary"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use tracing_test::traced_test;

    fn modes(s: &str) -> ModeSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_two_mode_reference_pattern() {
        let wf = compile(modes("unlit,excitation_a"), 2.0, 200, 10).unwrap();
        assert_eq!(wf.len(), 1000);
        assert_eq!(wf.slot_width(), 500);

        for (i, &s) in wf.samples().iter().enumerate() {
            let expected = if i < 200 {
                TRIGGER_MASK
            } else if (500..510).contains(&i) {
                TRIGGER_MASK | (1 << 1)
            } else {
                0
            };
            assert_eq!(s, expected, "sample {i}");
        }
        assert_eq!(wf.trigger_count(), 2);
        assert_eq!(wf.period(), Duration::from_secs(1));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let a = compile(modes("green,unlit,blue"), 3.0, 123, 45).unwrap();
        let b = compile(modes("green,unlit,blue"), 3.0, 123, 45).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.samples(), b.samples());
    }

    #[test]
    fn test_bits_match_windows() {
        let wf = compile(modes("blue,unlit,green"), 10.0, 80, 40).unwrap();
        assert_eq!(wf.len(), 300);
        assert_eq!(wf.slot_width(), 100);

        for (i, &s) in wf.samples().iter().enumerate() {
            let owner = wf.windows().iter().find(|w| w.contains(i));
            assert_eq!(s & TRIGGER_MASK != 0, owner.is_some(), "trigger at {i}");
            assert_eq!(
                s & (1 << 1) != 0,
                owner.map(|w| w.mode) == Some(Mode::ExcitationA),
                "line 1 at {i}"
            );
            assert_eq!(
                s & (1 << 2) != 0,
                owner.map(|w| w.mode) == Some(Mode::ExcitationB),
                "line 2 at {i}"
            );
            assert_eq!(s & !ALL_LINES_MASK, 0);
        }
    }

    #[test]
    fn test_unlit_only_sets_trigger() {
        let wf = compile(modes("unlit"), 1.0, 700, 10).unwrap();
        assert_eq!(wf.len(), 1000);
        assert!(wf.samples()[..700].iter().all(|&s| s == TRIGGER_MASK));
        assert!(wf.samples()[700..].iter().all(|&s| s == 0));
    }

    #[test]
    #[traced_test]
    fn test_exposure_clamped_to_ninety_percent() {
        let wf = compile(modes("blue"), 1.0, 0, 990).unwrap();
        let lit = wf.samples().iter().filter(|&&s| s != 0).count();
        assert_eq!(lit, 900);
        assert_eq!(wf.config().excited_exposure_ms, 900);
        assert!(logs_contain("clamping"));
    }

    #[test]
    fn test_remainder_is_dropped() {
        // 3 modes at 7 Hz: 429 samples, slots of 143, last sample never used.
        let wf = compile(modes("unlit,blue,green"), 7.0, 1000, 1000).unwrap();
        assert_eq!(wf.len(), 429);
        assert_eq!(wf.slot_width(), 143);
        let last = wf.windows().last().unwrap();
        assert_eq!(last.start, 286);
        assert_eq!(last.end(), 429);
        assert!(wf.windows().iter().all(|w| w.len == 143));
    }

    #[test]
    fn test_window_never_exceeds_slot() {
        let wf = compile(modes("unlit,blue"), 2.0, 900, 900).unwrap();
        for w in wf.windows() {
            assert!(w.len <= wf.slot_width());
        }
        assert_eq!(wf.samples()[499], TRIGGER_MASK);
        assert_eq!(wf.samples()[500], TRIGGER_MASK | (1 << 1));
    }

    #[test]
    #[traced_test]
    fn test_adjacent_windows_are_reported() {
        let _ = compile(modes("unlit,blue"), 2.0, 900, 900).unwrap();
        assert!(logs_contain("merge into one trigger pulse"));
    }

    #[test]
    #[traced_test]
    fn test_zero_exposure_window() {
        let wf = compile(modes("unlit,blue"), 2.0, 0, 10).unwrap();
        assert_eq!(wf.windows()[0].len, 0);
        assert_eq!(wf.trigger_count(), 1);
        assert!(logs_contain("Exposure window is empty"));
    }

    #[test]
    fn test_single_sample_pattern() {
        let wf = compile(modes("unlit,blue,green"), 30_000.0, 5, 5).unwrap();
        assert_eq!(wf.len(), 1);
        assert_eq!(wf.slot_width(), 0);
        assert_eq!(wf.samples(), &[0]);
    }

    #[test]
    fn test_invalid_inputs() {
        let err = compile(ModeSet::default(), 1.0, 10, 10).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));
        assert!(compile(modes("unlit"), 0.0, 10, 10).is_err());
        assert!(compile(modes("unlit"), 1.0, -10, 10).is_err());
    }
}
