//! Cycle configuration: validation, derived timing and exposure clamping.
//!
//! All derived quantities are computed here so that the compiler, the
//! acquisition loop and the session agree on one notion of "per-mode period".

use crate::error::{Result, SyncError};
use crate::waveform::SAMPLE_RATE_HZ;
use daq_core::{Mode, ModeSet};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest accepted pattern length (one hour of samples at 1 kHz).
pub const MAX_SAMPLES_PER_PERIOD: usize = 3_600_000;

/// Fraction of the per-mode period an exposure may occupy.
pub const EXPOSURE_LIMIT_FRACTION: f64 = 0.9;

/// Frame wait window as a multiple of the per-mode period.
pub const FRAME_TIMEOUT_FACTOR: f64 = 1.5;

/// A mode is reported stalled after this many per-mode periods without a frame.
pub const STALL_FACTOR: f64 = 2.0;

/// Requested acquisition timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Active modes in cycle order.
    pub modes: ModeSet,
    /// Target cycle frequency in Hz.
    pub cycle_frequency_hz: f64,
    /// Exposure of the unlit mode in ms.
    pub unlit_exposure_ms: i64,
    /// Exposure shared by the excitation modes in ms.
    pub excited_exposure_ms: i64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            modes: ModeSet::new([Mode::Unlit]).unwrap_or_default(),
            cycle_frequency_hz: 1.0,
            unlit_exposure_ms: 700,
            excited_exposure_ms: 10,
        }
    }
}

/// One exposure that had to be shortened to fit the per-mode period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureClamp {
    /// Mode whose exposure was clamped. For the shared excitation exposure
    /// this is the first excitation mode in the cycle.
    pub mode: Mode,
    /// Requested exposure in ms.
    pub requested_ms: i64,
    /// Exposure actually used in ms.
    pub applied_ms: i64,
}

impl CycleConfig {
    /// Build a config from its parts.
    pub fn new(
        modes: ModeSet,
        cycle_frequency_hz: f64,
        unlit_exposure_ms: i64,
        excited_exposure_ms: i64,
    ) -> Self {
        Self {
            modes,
            cycle_frequency_hz,
            unlit_exposure_ms,
            excited_exposure_ms,
        }
    }

    /// Reject inputs that cannot be compiled.
    pub fn validate(&self) -> Result<()> {
        if self.modes.is_empty() {
            return Err(SyncError::invalid_config("mode set is empty"));
        }
        if !self.cycle_frequency_hz.is_finite() || self.cycle_frequency_hz <= 0.0 {
            return Err(SyncError::invalid_config(format!(
                "cycle frequency must be a positive number of Hz, got {}",
                self.cycle_frequency_hz
            )));
        }
        if self.unlit_exposure_ms < 0 {
            return Err(SyncError::invalid_config(format!(
                "unlit exposure must not be negative, got {} ms",
                self.unlit_exposure_ms
            )));
        }
        if self.excited_exposure_ms < 0 {
            return Err(SyncError::invalid_config(format!(
                "excited exposure must not be negative, got {} ms",
                self.excited_exposure_ms
            )));
        }
        let samples = (SAMPLE_RATE_HZ as f64 / self.effective_period_hz()).round();
        if samples > MAX_SAMPLES_PER_PERIOD as f64 {
            return Err(SyncError::invalid_config(format!(
                "cycle frequency {} Hz needs {} samples per period (max {})",
                self.cycle_frequency_hz, samples, MAX_SAMPLES_PER_PERIOD
            )));
        }
        Ok(())
    }

    /// Repetition rate of the compiled pattern.
    ///
    /// With more than one mode each mode gets its own share of the cycle
    /// frequency, so the pattern repeats at `cycle_frequency_hz / |modes|`.
    pub fn effective_period_hz(&self) -> f64 {
        if self.modes.len() <= 1 {
            self.cycle_frequency_hz
        } else {
            self.cycle_frequency_hz / self.modes.len() as f64
        }
    }

    /// Pattern length in samples, never less than one.
    pub fn samples_per_period(&self) -> usize {
        let samples = (SAMPLE_RATE_HZ as f64 / self.effective_period_hz()).round();
        if samples.is_finite() && samples >= 1.0 {
            samples as usize
        } else {
            1
        }
    }

    /// Per-mode period in ms (one repetition at the effective per-mode rate).
    pub fn per_mode_period_ms(&self) -> f64 {
        1000.0 / self.effective_period_hz()
    }

    /// Longest exposure the per-mode period allows, in ms.
    pub fn exposure_limit_ms(&self) -> i64 {
        (self.per_mode_period_ms() * EXPOSURE_LIMIT_FRACTION).floor() as i64
    }

    /// Requested exposure for `mode` in ms.
    pub fn exposure_for(&self, mode: Mode) -> i64 {
        if mode.is_excitation() {
            self.excited_exposure_ms
        } else {
            self.unlit_exposure_ms
        }
    }

    /// Copy of this config with both exposures clamped to the 90% bound,
    /// plus one entry per clamped value.
    ///
    /// Only exposures used by an active mode are reported.
    pub fn clamped(&self) -> (CycleConfig, Vec<ExposureClamp>) {
        let limit = self.exposure_limit_ms().max(0);
        let mut out = self.clone();
        let mut clamps = Vec::new();

        if self.unlit_exposure_ms > limit {
            out.unlit_exposure_ms = limit;
            if self.modes.position(Mode::Unlit).is_some() {
                clamps.push(ExposureClamp {
                    mode: Mode::Unlit,
                    requested_ms: self.unlit_exposure_ms,
                    applied_ms: limit,
                });
            }
        }
        if self.excited_exposure_ms > limit {
            out.excited_exposure_ms = limit;
            if let Some(mode) = self.modes.iter().find(|m| m.is_excitation()) {
                clamps.push(ExposureClamp {
                    mode,
                    requested_ms: self.excited_exposure_ms,
                    applied_ms: limit,
                });
            }
        }
        (out, clamps)
    }

    /// Frame wait window: 1.5 × the per-mode period.
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.per_mode_period_ms() * FRAME_TIMEOUT_FACTOR / 1000.0)
    }

    /// Silence after which a mode counts as stalled: 2 × the per-mode period.
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.per_mode_period_ms() * STALL_FACTOR / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(modes: &str, hz: f64, unlit: i64, excited: i64) -> CycleConfig {
        CycleConfig::new(modes.parse().unwrap(), hz, unlit, excited)
    }

    #[test]
    fn test_defaults_match_instrument_startup() {
        let cfg = CycleConfig::default();
        assert_eq!(cfg.modes.as_slice(), &[Mode::Unlit]);
        assert_eq!(cfg.cycle_frequency_hz, 1.0);
        assert_eq!(cfg.unlit_exposure_ms, 700);
        assert_eq!(cfg.excited_exposure_ms, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_inputs() {
        assert!(config("", 1.0, 10, 10).validate().is_err());
        assert!(config("unlit", 0.0, 10, 10).validate().is_err());
        assert!(config("unlit", -2.0, 10, 10).validate().is_err());
        assert!(config("unlit", f64::NAN, 10, 10).validate().is_err());
        assert!(config("unlit", 1.0, -1, 10).validate().is_err());
        assert!(config("unlit,blue", 1.0, 10, -5).validate().is_err());
        assert!(config("unlit", 1e-6, 10, 10).validate().is_err());
    }

    #[test]
    fn test_samples_per_period() {
        assert_eq!(config("unlit", 1.0, 0, 0).samples_per_period(), 1000);
        assert_eq!(config("unlit,blue", 2.0, 0, 0).samples_per_period(), 1000);
        assert_eq!(config("unlit,blue,green", 10.0, 0, 0).samples_per_period(), 300);
        assert_eq!(config("unlit,blue,green", 7.0, 0, 0).samples_per_period(), 429);
        // Very fast cycles still produce one sample.
        assert_eq!(config("unlit", 5000.0, 0, 0).samples_per_period(), 1);
    }

    #[test]
    fn test_clamping_reports_active_modes_only() {
        let cfg = config("blue", 1.0, 5000, 950);
        assert_eq!(cfg.exposure_limit_ms(), 900);

        let (clamped, clamps) = cfg.clamped();
        assert_eq!(clamped.unlit_exposure_ms, 900);
        assert_eq!(clamped.excited_exposure_ms, 900);
        assert_eq!(
            clamps,
            vec![ExposureClamp {
                mode: Mode::ExcitationA,
                requested_ms: 950,
                applied_ms: 900
            }]
        );
    }

    #[test]
    fn test_timing_windows_track_frequency() {
        let cfg = config("unlit,blue", 2.0, 200, 10);
        assert_eq!(cfg.per_mode_period_ms(), 1000.0);
        assert_eq!(cfg.frame_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.stall_threshold(), Duration::from_millis(2000));
    }

    #[test]
    fn test_deserialize_with_aliases_and_defaults() {
        let cfg: CycleConfig = toml::from_str(
            r#"
            modes = ["bioluminescence", "green"]
            cycle_frequency_hz = 4.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.modes.as_slice(), &[Mode::Unlit, Mode::ExcitationB]);
        assert_eq!(cfg.unlit_exposure_ms, 700);
        assert_eq!(cfg.excited_exposure_ms, 10);
    }
}
