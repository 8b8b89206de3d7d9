//! Trigger sequencer: owns the digital-output channel and the live waveform.
//!
//! At most one waveform is live at a time. Replacing it means `stop()` then
//! `start()`; there is no hot swap. Playback itself is device-clocked, the
//! sequencer never re-issues the pattern per cycle.

use crate::error::{Result, SyncError};
use crate::waveform::Waveform;
use daq_core::PatternOutput;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Commits compiled waveforms to a [`PatternOutput`] device.
pub struct TriggerSequencer {
    device: Arc<dyn PatternOutput>,
    live: Mutex<Option<Waveform>>,
}

impl TriggerSequencer {
    /// Take ownership of an output device.
    pub fn new(device: Arc<dyn PatternOutput>) -> Self {
        Self {
            device,
            live: Mutex::new(None),
        }
    }

    /// Name of the underlying device.
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Whether a waveform is currently playing.
    pub async fn is_live(&self) -> bool {
        self.live.lock().await.is_some()
    }

    /// Copy of the live waveform, if any.
    pub async fn live_waveform(&self) -> Option<Waveform> {
        self.live.lock().await.clone()
    }

    /// Load `waveform` and start continuous playback.
    ///
    /// # Errors
    ///
    /// - [`SyncError::DeviceBusy`] if a waveform is already live here, or the
    ///   device reports it is owned elsewhere.
    /// - [`SyncError::DeviceError`] if the channel cannot be configured or
    ///   armed. The device is returned to a stopped, all-low state first.
    pub async fn start(&self, waveform: Waveform) -> Result<()> {
        let mut live = self.live.lock().await;
        if live.is_some() {
            return Err(SyncError::DeviceBusy {
                device: self.device.name().to_string(),
            });
        }

        if let Err(e) = self
            .device
            .configure(waveform.sample_rate_hz(), waveform.len())
            .await
        {
            let err = SyncError::from_device(self.device.name(), &e);
            if !matches!(err, SyncError::DeviceBusy { .. }) {
                self.release().await;
            }
            error!(device = self.device.name(), error = %err, "Failed to configure pattern output");
            return Err(err);
        }

        if let Err(e) = self.device.write_and_start(waveform.samples()).await {
            let err = SyncError::from_device(self.device.name(), &e);
            self.release().await;
            error!(device = self.device.name(), error = %err, "Failed to arm pattern output");
            return Err(err);
        }

        info!(
            device = self.device.name(),
            samples = waveform.len(),
            sample_rate_hz = waveform.sample_rate_hz(),
            modes = %waveform.modes(),
            "Trigger sequence started"
        );
        *live = Some(waveform);
        Ok(())
    }

    /// Stop playback and drive every line low.
    ///
    /// Safe to call at any time: the device is told to stop and go low even
    /// when nothing is live here. Both the stop and the all-low write are
    /// attempted even if the first fails; the first failure is returned and
    /// the waveform stays live until a later call succeeds.
    pub async fn stop(&self) -> Result<()> {
        let mut live = self.live.lock().await;

        let stopped = self.device.stop().await;
        let lowered = self.device.write_static(0).await;

        match (stopped, lowered) {
            (Ok(()), Ok(())) => {
                match live.take() {
                    Some(waveform) => info!(
                        device = self.device.name(),
                        samples = waveform.len(),
                        "Trigger sequence stopped, lines low"
                    ),
                    None => debug!(device = self.device.name(), "Output idle, lines low"),
                }
                Ok(())
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                let err = SyncError::from_device(self.device.name(), &e);
                error!(
                    device = self.device.name(),
                    error = %err,
                    still_live = live.is_some(),
                    "Failed to stop pattern output cleanly"
                );
                Err(err)
            }
        }
    }

    /// Best-effort return to a stopped, all-low device after a failed start.
    async fn release(&self) {
        if let Err(e) = self.device.stop().await {
            warn!(device = self.device.name(), error = %e, "Rollback: stop failed");
        }
        if let Err(e) = self.device.write_static(0).await {
            warn!(device = self.device.name(), error = %e, "Rollback: could not drive lines low");
        }
    }
}

impl std::fmt::Debug for TriggerSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSequencer")
            .field("device", &self.device.name())
            .finish()
    }
}
