//! Timing configuration for mock devices.
//!
//! Zero delays keep unit tests deterministic; the presets add hardware-like
//! latencies for integration runs.

use std::time::Duration;

/// Simulated device latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Delay between end of exposure and frame availability, in milliseconds
    pub frame_readout_ms: u64,
    /// Delay added to every configuration call, in milliseconds
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// No delays at all.
    pub fn instant() -> Self {
        Self::default()
    }

    /// Scientific CMOS camera reading out a small ROI.
    pub fn camera() -> Self {
        Self {
            frame_readout_ms: 5,
            communication_delay_ms: 0,
        }
    }

    /// PCI digital-output card.
    pub fn digital_output() -> Self {
        Self {
            frame_readout_ms: 0,
            communication_delay_ms: 1,
        }
    }

    /// Readout delay as a `Duration`.
    pub fn readout(&self) -> Duration {
        Duration::from_millis(self.frame_readout_ms)
    }

    /// Sleep for the communication delay, if any.
    pub async fn communicate(&self) {
        if self.communication_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.communication_delay_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(TimingConfig::instant().readout(), Duration::ZERO);
        assert_eq!(TimingConfig::camera().readout(), Duration::from_millis(5));
        assert_eq!(TimingConfig::digital_output().communication_delay_ms, 1);
    }
}
