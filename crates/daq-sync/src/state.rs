//! Acquisition state machine.
//!
//! ```text
//!            begin_run            finish_run
//!   Idle ─────────────▶ Running ─────────────▶ Idle
//!    │                    │
//!    │ fail               │ fail
//!    ▼                    ▼
//!  Error ◀────────────────┘
//!    │ reset
//!    └──────────▶ Idle
//! ```
//!
//! Subscribers receive immutable [`StateSnapshot`]s through a
//! `tokio::sync::watch` channel; they never hold a reference into the machine.

use crate::config::CycleConfig;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle state of the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// Nothing running; configuration may change.
    Idle,
    /// Waveform live and loop consuming frames.
    Running,
    /// Start or stop failed; only `reset` leaves this state.
    Error,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::Running => "running",
            AcquisitionState::Error => "error",
        };
        f.write_str(label)
    }
}

impl AcquisitionState {
    /// Whether `self → to` is a legal transition.
    pub fn can_transition(self, to: AcquisitionState) -> bool {
        use AcquisitionState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, Idle)
                | (Idle, Error)
                | (Running, Error)
                | (Error, Error)
                | (Error, Idle)
        )
    }
}

const ALL_STATES: [AcquisitionState; 3] = [
    AcquisitionState::Idle,
    AcquisitionState::Running,
    AcquisitionState::Error,
];

/// Immutable view of the state machine.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Current state.
    pub state: AcquisitionState,
    /// Configuration of the current or last run.
    pub config: Option<CycleConfig>,
    /// Whether the current or last run retains frames.
    pub save_enabled: bool,
    /// Reason for entering [`AcquisitionState::Error`].
    pub last_error: Option<String>,
    /// When the state last changed.
    pub changed_at: DateTime<Utc>,
    /// Incremented on every transition.
    pub revision: u64,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: AcquisitionState::Idle,
            config: None,
            save_enabled: false,
            last_error: None,
            changed_at: Utc::now(),
            revision: 0,
        }
    }
}

/// Single owner of the acquisition state.
#[derive(Debug)]
pub struct AcquisitionStateMachine {
    tx: watch::Sender<StateSnapshot>,
}

impl AcquisitionStateMachine {
    /// Machine in [`AcquisitionState::Idle`].
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StateSnapshot::default());
        Self { tx }
    }

    /// Current state.
    pub fn current(&self) -> AcquisitionState {
        self.tx.borrow().state
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        self.tx.borrow().clone()
    }

    /// Receive a snapshot after every transition.
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.tx.subscribe()
    }

    /// Idle → Running, recording the run configuration.
    pub fn begin_run(&self, config: CycleConfig, save_enabled: bool) -> Result<()> {
        self.transition(
            "start acquisition",
            &[AcquisitionState::Idle],
            AcquisitionState::Running,
            |snap| {
                snap.config = Some(config);
                snap.save_enabled = save_enabled;
                snap.last_error = None;
            },
        )
    }

    /// Running → Idle.
    pub fn finish_run(&self) -> Result<()> {
        self.transition(
            "stop acquisition",
            &[AcquisitionState::Running],
            AcquisitionState::Idle,
            |_| {},
        )
    }

    /// Any state → Error.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        // Every state may enter Error, so this cannot be rejected.
        let _ = self.transition(
            "record failure",
            &ALL_STATES,
            AcquisitionState::Error,
            |snap| snap.last_error = Some(reason),
        );
    }

    /// Error → Idle.
    pub fn reset(&self) -> Result<()> {
        self.transition("reset", &[AcquisitionState::Error], AcquisitionState::Idle, |_| {})
    }

    fn transition(
        &self,
        operation: &'static str,
        allowed_from: &[AcquisitionState],
        to: AcquisitionState,
        update: impl FnOnce(&mut StateSnapshot),
    ) -> Result<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|snap| {
            let from = snap.state;
            if !allowed_from.contains(&from) || !from.can_transition(to) {
                outcome = Err(SyncError::InvalidTransition {
                    operation,
                    state: from.to_string(),
                });
                return false;
            }
            snap.state = to;
            snap.changed_at = Utc::now();
            snap.revision += 1;
            update(snap);
            info!(from = %from, to = %to, "Acquisition state changed");
            true
        });
        outcome
    }
}

impl Default for AcquisitionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
