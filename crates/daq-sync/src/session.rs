//! Acquisition session: orchestrates compiler, sequencer and loop under the
//! state machine.
//!
//! - **start** (Idle → Running): compile, start the trigger sequence, start
//!   the loop, in that order. Any failure rolls back what was started and
//!   moves to Error.
//! - **stop** (Running → Idle): stop the loop, stop the sequence, hand the
//!   save buffer to the [`FrameSink`]. A failed save is reported in the
//!   [`RunSummary`] but does not move the session to Error.
//! - **reset** (Error → Idle → Running): release hardware, then start again.

use crate::acquisition::{
    AcquisitionLoop, AcquisitionStats, FrameRecord, LoopEvent, LoopSettings, SaveBuffer,
    DEFAULT_DISPLAY_CAPACITY,
};
use crate::config::CycleConfig;
use crate::error::{Result, SyncError};
use crate::sequencer::TriggerSequencer;
use crate::state::{AcquisitionState, AcquisitionStateMachine, StateSnapshot};
use crate::waveform::{Waveform, WaveformCompiler};
use chrono::{DateTime, Utc};
use daq_core::{FrameSink, FrameSource, Mode, PatternOutput, SaveReport};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

/// Descriptive record of one run, handed to the sink next to the stacks.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub stopped_at: DateTime<Utc>,
    /// Configuration actually compiled (exposures clamped).
    pub config: CycleConfig,
    /// Frames acquired per mode.
    pub frames_per_mode: BTreeMap<Mode, u64>,
}

impl RunMetadata {
    /// Flatten into `key: value` pairs.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("started_at".to_string(), self.started_at.to_rfc3339());
        map.insert("stopped_at".to_string(), self.stopped_at.to_rfc3339());
        map.insert("modes".to_string(), self.config.modes.to_string());
        map.insert(
            "cycle_frequency_hz".to_string(),
            self.config.cycle_frequency_hz.to_string(),
        );
        map.insert(
            "pattern_frequency_hz".to_string(),
            format!("{:.4}", self.config.effective_period_hz()),
        );
        map.insert(
            "samples_per_period".to_string(),
            self.config.samples_per_period().to_string(),
        );
        map.insert(
            "unlit_exposure_ms".to_string(),
            self.config.unlit_exposure_ms.to_string(),
        );
        map.insert(
            "excited_exposure_ms".to_string(),
            self.config.excited_exposure_ms.to_string(),
        );
        for (mode, frames) in &self.frames_per_mode {
            map.insert(format!("frames_{}", mode), frames.to_string());
        }
        map
    }
}

/// What happened to the save buffer at stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceOutcome {
    /// Saving was not enabled for the run.
    Disabled,
    /// Saving was enabled but nothing was retained.
    NothingToSave,
    /// Stacks (and metadata) handed to the sink.
    Saved {
        /// Per-mode result.
        report: SaveReport,
        /// Metadata file, if it could be written.
        metadata: Option<PathBuf>,
    },
    /// The sink failed as a whole.
    Failed {
        /// Reason.
        message: String,
    },
}

/// Returned by [`AcquisitionSession::stop`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Run metadata.
    pub metadata: RunMetadata,
    /// Final loop statistics.
    pub stats: AcquisitionStats,
    /// Persistence result.
    pub persistence: PersistenceOutcome,
}

struct ActiveRun {
    config: CycleConfig,
    save_enabled: bool,
    started_at: DateTime<Utc>,
}

/// Owner of one output device, one camera and the acquisition state.
pub struct AcquisitionSession {
    sequencer: TriggerSequencer,
    camera: Arc<dyn FrameSource>,
    sink: Option<Arc<dyn FrameSink>>,
    state: AcquisitionStateMachine,
    acquisition: AcquisitionLoop,
    run: Mutex<Option<ActiveRun>>,
}

impl AcquisitionSession {
    /// Session driving `output` and reading from `camera`, without persistence.
    pub fn new(output: Arc<dyn PatternOutput>, camera: Arc<dyn FrameSource>) -> Self {
        Self {
            sequencer: TriggerSequencer::new(output),
            camera,
            sink: None,
            state: AcquisitionStateMachine::new(),
            acquisition: AcquisitionLoop::new(DEFAULT_DISPLAY_CAPACITY),
            run: Mutex::new(None),
        }
    }

    /// Attach a persistence back-end.
    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the display channel with one of `capacity` records.
    ///
    /// Must be called before anyone subscribes.
    pub fn with_display_capacity(mut self, capacity: usize) -> Self {
        self.acquisition = AcquisitionLoop::new(capacity);
        self
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state.current()
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// Receive state snapshots.
    pub fn subscribe_state(&self) -> watch::Receiver<StateSnapshot> {
        self.state.subscribe()
    }

    /// Receive demultiplexed frames. Subscriptions survive restarts.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameRecord> {
        self.acquisition.subscribe_frames()
    }

    /// Receive loop timeouts, faults and discontinuities.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LoopEvent> {
        self.acquisition.subscribe_events()
    }

    /// Live statistics of the current (or last) run.
    pub fn statistics(&self) -> AcquisitionStats {
        self.acquisition.statistics()
    }

    /// Rate of `mode` in the current run, Hz.
    pub fn mode_rate(&self, mode: Mode) -> f64 {
        self.acquisition.instantaneous_rate(mode)
    }

    /// Modes silent for longer than 2 × the per-mode period.
    pub async fn stalled_modes(&self) -> Vec<Mode> {
        let run = self.run.lock().await;
        match run.as_ref() {
            Some(active) => self
                .acquisition
                .stalled_modes(active.config.stall_threshold()),
            None => Vec::new(),
        }
    }

    /// Waveform currently replayed by the output device.
    pub async fn live_waveform(&self) -> Option<Waveform> {
        self.sequencer.live_waveform().await
    }

    /// Idle → Running.
    ///
    /// An empty mode set is refused and leaves the session Idle. Any other
    /// failure rolls back and moves the session to Error.
    pub async fn start(&self, config: CycleConfig, save_enabled: bool) -> Result<Waveform> {
        let mut run = self.run.lock().await;
        self.start_locked(&mut run, config, save_enabled).await
    }

    async fn start_locked(
        &self,
        run: &mut Option<ActiveRun>,
        config: CycleConfig,
        save_enabled: bool,
    ) -> Result<Waveform> {
        let state = self.state.current();
        if state != AcquisitionState::Idle {
            return Err(SyncError::InvalidTransition {
                operation: "start acquisition",
                state: state.to_string(),
            });
        }
        if config.modes.is_empty() {
            warn!("No acquisition mode selected, staying idle");
            return Err(SyncError::invalid_config("mode set is empty"));
        }

        let save_enabled = if save_enabled && self.sink.is_none() {
            warn!("No save destination configured, saving disabled");
            false
        } else {
            save_enabled
        };

        let waveform = match WaveformCompiler::compile(&config) {
            Ok(waveform) => waveform,
            Err(e) => return Err(self.abort_start(e)),
        };

        if let Err(e) = self.sequencer.start(waveform.clone()).await {
            return Err(self.abort_start(e));
        }

        let settings = LoopSettings::from_config(waveform.config(), save_enabled);
        if let Err(e) = self.acquisition.start(Arc::clone(&self.camera), settings) {
            if let Err(stop_err) = self.sequencer.stop().await {
                warn!(error = %stop_err, "Rollback: trigger sequence did not stop cleanly");
            }
            return Err(self.abort_start(e));
        }

        self.state.begin_run(waveform.config().clone(), save_enabled)?;
        *run = Some(ActiveRun {
            config: waveform.config().clone(),
            save_enabled,
            started_at: Utc::now(),
        });

        info!(
            modes = %waveform.modes(),
            cycle_frequency_hz = waveform.config().cycle_frequency_hz,
            save_enabled,
            "Acquisition started"
        );
        Ok(waveform)
    }

    fn abort_start(&self, err: SyncError) -> SyncError {
        error!(error = %err, "Failed to start acquisition");
        self.state.fail(err.to_string());
        err
    }

    /// Running → Idle.
    ///
    /// Hardware failures while stopping move the session to Error. Frames
    /// retained for saving are still handed to the sink first.
    pub async fn stop(&self) -> Result<RunSummary> {
        let mut run = self.run.lock().await;
        let state = self.state.current();
        if state != AcquisitionState::Running {
            return Err(SyncError::InvalidTransition {
                operation: "stop acquisition",
                state: state.to_string(),
            });
        }
        let Some(active) = run.take() else {
            return Err(SyncError::InvalidTransition {
                operation: "stop acquisition",
                state: "no run is recorded".to_string(),
            });
        };

        let loop_result = self.acquisition.stop().await;
        let sequencer_result = self.sequencer.stop().await;

        let outcome = match loop_result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Failed to stop acquisition");
                self.state.fail(e.to_string());
                return Err(e);
            }
        };

        let metadata = RunMetadata {
            started_at: active.started_at,
            stopped_at: Utc::now(),
            config: active.config,
            frames_per_mode: outcome.stats.frames_per_mode.clone(),
        };

        // Retained frames are flushed even when the output device misbehaved.
        let persistence = if active.save_enabled {
            self.persist(outcome.save_buffer, &metadata).await
        } else {
            PersistenceOutcome::Disabled
        };

        if let Err(e) = sequencer_result {
            error!(
                error = %e,
                total_frames = outcome.stats.total_frames,
                persistence = ?persistence,
                "Failed to stop trigger sequence"
            );
            self.state.fail(e.to_string());
            return Err(e);
        }

        self.state.finish_run()?;
        info!(
            total_frames = outcome.stats.total_frames,
            persistence = ?persistence,
            "Acquisition stopped"
        );

        Ok(RunSummary {
            metadata,
            stats: outcome.stats,
            persistence,
        })
    }

    /// Error → Idle → Running with a (possibly new) configuration.
    pub async fn reset(&self, config: CycleConfig, save_enabled: bool) -> Result<Waveform> {
        let mut run = self.run.lock().await;
        let state = self.state.current();
        if state != AcquisitionState::Error {
            return Err(SyncError::InvalidTransition {
                operation: "reset",
                state: state.to_string(),
            });
        }

        if let Err(e) = self.acquisition.stop().await {
            warn!(error = %e, "Reset: acquisition loop did not stop cleanly");
        }
        if let Err(e) = self.sequencer.stop().await {
            self.state.fail(e.to_string());
            return Err(e);
        }
        *run = None;
        self.state.reset()?;
        info!("Acquisition reset, retrying start");

        self.start_locked(&mut run, config, save_enabled).await
    }

    async fn persist(&self, buffer: SaveBuffer, metadata: &RunMetadata) -> PersistenceOutcome {
        let Some(sink) = self.sink.clone() else {
            return PersistenceOutcome::Disabled;
        };
        if buffer.is_empty() {
            warn!("Saving enabled but no frames were retained");
            return PersistenceOutcome::NothingToSave;
        }

        let stacks = buffer.into_stacks();
        let fields = metadata.to_map();
        let joined = tokio::task::spawn_blocking(move || {
            let report = sink.save_stacks(&stacks)?;
            let metadata = match sink.save_metadata(&fields) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "Failed to save run metadata");
                    None
                }
            };
            anyhow::Ok((report, metadata))
        })
        .await;

        match joined {
            Ok(Ok((report, metadata))) => {
                for (mode, reason) in &report.failed {
                    error!(mode = %mode, reason = %reason, "Stack not saved");
                }
                PersistenceOutcome::Saved { report, metadata }
            }
            Ok(Err(e)) => {
                let err = SyncError::Persistence {
                    message: format!("{:#}", e),
                };
                error!(error = %err, "Failed to save image stacks");
                PersistenceOutcome::Failed {
                    message: err.to_string(),
                }
            }
            Err(e) => PersistenceOutcome::Failed {
                message: format!("save task ended abnormally: {}", e),
            },
        }
    }
}

impl std::fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("sequencer", &self.sequencer)
            .field("state", &self.state.current())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
