//! Acquisition loop: frame demultiplexing by cycle position.
//!
//! The loop runs as one spawned task. Each iteration waits for the camera,
//! reads the newest frame, assigns it to `modes[counter % |modes|]`, updates
//! the [`FrameRateMonitor`], publishes a [`FrameRecord`] and, when saving is
//! enabled, appends a copy to the [`SaveBuffer`].
//!
//! # Ordering assumption
//!
//! Frame delivery order is assumed identical to the compiled waveform's mode
//! order. Nothing in a frame confirms which mode exposed it. When the camera
//! reports hardware frame numbers, gaps are detected and reported as
//! [`LoopEvent::Discontinuity`], but the mode assignment is not corrected.
//!
//! # Channels
//!
//! - Display: `broadcast::Sender<FrameRecord>` with bounded capacity. A slow
//!   consumer loses the oldest queued records (`RecvError::Lagged`); the loop
//!   never waits for it.
//! - Events: `broadcast::Sender<LoopEvent>` carrying timeouts, faults and
//!   discontinuities. Every event is also logged and counted.
//!
//! # Cancellation
//!
//! Cooperative: the running flag is checked once per iteration, so `stop()`
//! returns within one frame wait. The save buffer is owned by the task and
//! handed back through its `JoinHandle`, so no lock is needed on it.

use crate::config::CycleConfig;
use crate::error::{Result, SyncError};
use crate::rate_monitor::FrameRateMonitor;
use chrono::{DateTime, Utc};
use daq_core::{Frame, FrameSource, Mode, ModeSet};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Default depth of the display channel.
pub const DEFAULT_DISPLAY_CAPACITY: usize = 16;

/// Default depth of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Pause after a loop fault before the next iteration.
pub const DEFAULT_FAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Extra time granted to a camera wait beyond its own timeout.
const WAIT_GUARD: Duration = Duration::from_millis(50);

/// Health log period, in cycles.
const HEALTH_LOG_CYCLES: u64 = 10;

/// One demultiplexed frame.
///
/// The payload is shared with every subscriber; copy it to keep it beyond
/// the current callback.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Mode assigned from the cycle position.
    pub mode: Mode,
    /// Image data.
    pub payload: Arc<Frame>,
    /// Zero-based position in the run; strictly increasing.
    pub sequence_number: u64,
    /// Wall-clock arrival time.
    pub arrived_at: DateTime<Utc>,
}

/// Per-mode frames retained for persistence.
///
/// Cleared on every start, append-only while running, read once at stop.
#[derive(Debug, Clone, Default)]
pub struct SaveBuffer {
    stacks: BTreeMap<Mode, Vec<Frame>>,
}

impl SaveBuffer {
    /// Empty buffer with one (empty) stack per mode.
    pub fn new(modes: &ModeSet) -> Self {
        Self {
            stacks: modes.iter().map(|m| (m, Vec::new())).collect(),
        }
    }

    /// Append a frame to the stack of `mode`.
    pub fn push(&mut self, mode: Mode, frame: Frame) {
        self.stacks.entry(mode).or_default().push(frame);
    }

    /// Frames held for `mode`.
    pub fn frames(&self, mode: Mode) -> &[Frame] {
        self.stacks.get(&mode).map_or(&[], Vec::as_slice)
    }

    /// Frames held across all modes.
    pub fn total(&self) -> usize {
        self.stacks.values().map(Vec::len).sum()
    }

    /// True when no frame was retained.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Borrow the per-mode stacks.
    pub fn stacks(&self) -> &BTreeMap<Mode, Vec<Frame>> {
        &self.stacks
    }

    /// Take the per-mode stacks.
    pub fn into_stacks(self) -> BTreeMap<Mode, Vec<Frame>> {
        self.stacks
    }
}

/// Notable conditions observed by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// No frame arrived within the wait window. Not fatal.
    FrameTimeout {
        /// Wait window in ms.
        timeout_ms: u64,
        /// Timeouts in a row, including this one.
        consecutive: u64,
    },
    /// An iteration failed unexpectedly. The loop backs off and continues.
    Fault {
        /// Error description.
        message: String,
        /// Faults in a row, including this one.
        consecutive: u64,
    },
    /// The hardware frame counter jumped.
    Discontinuity {
        /// Frame number that should have arrived.
        expected: u64,
        /// Frame number that did arrive.
        received: u64,
    },
}

/// Counters and rates of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionStats {
    /// Frames assigned to a mode.
    pub total_frames: u64,
    /// Frames per mode.
    pub frames_per_mode: BTreeMap<Mode, u64>,
    /// Frame waits that timed out.
    pub timeouts: u64,
    /// Iterations that failed.
    pub faults: u64,
    /// Frame-counter gaps observed.
    pub discontinuities: u64,
    /// Frames missing according to the hardware frame counter.
    pub lost_frames: u64,
    /// Session rate over the last 10 intervals, Hz.
    pub current_rate_hz: f64,
    /// Session rate over the last 100 intervals, Hz.
    pub average_rate_hz: f64,
    /// Rate per mode over its last 10 intervals, Hz.
    pub per_mode_rate_hz: BTreeMap<Mode, f64>,
}

/// Parameters of one loop run.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Cycle order; must match the live waveform.
    pub modes: ModeSet,
    /// Camera wait window.
    pub frame_timeout: Duration,
    /// Retain frames for persistence.
    pub save_enabled: bool,
    /// Pause after a fault.
    pub fault_backoff: Duration,
    /// Silence after which a mode is reported stalled in the health log.
    pub stall_threshold: Duration,
}

impl LoopSettings {
    /// Settings derived from a cycle configuration: the wait window is
    /// 1.5 × the per-mode period.
    pub fn from_config(config: &CycleConfig, save_enabled: bool) -> Self {
        Self {
            modes: config.modes.clone(),
            frame_timeout: config.frame_timeout(),
            save_enabled,
            fault_backoff: DEFAULT_FAULT_BACKOFF,
            stall_threshold: config.stall_threshold(),
        }
    }

    /// Override the fault backoff.
    pub fn with_fault_backoff(mut self, backoff: Duration) -> Self {
        self.fault_backoff = backoff;
        self
    }
}

/// What `stop()` hands back.
#[derive(Debug, Clone, Default)]
pub struct LoopOutcome {
    /// Retained frames (empty when saving was disabled).
    pub save_buffer: SaveBuffer,
    /// Final statistics.
    pub stats: AcquisitionStats,
}

#[derive(Debug, Default)]
struct LoopCounters {
    total_frames: AtomicU64,
    timeouts: AtomicU64,
    faults: AtomicU64,
    discontinuities: AtomicU64,
    lost_frames: AtomicU64,
}

impl LoopCounters {
    fn reset(&self) {
        self.total_frames.store(0, Ordering::SeqCst);
        self.timeouts.store(0, Ordering::SeqCst);
        self.faults.store(0, Ordering::SeqCst);
        self.discontinuities.store(0, Ordering::SeqCst);
        self.lost_frames.store(0, Ordering::SeqCst);
    }
}

/// Frame consumption loop.
pub struct AcquisitionLoop {
    frame_tx: broadcast::Sender<FrameRecord>,
    event_tx: broadcast::Sender<LoopEvent>,
    running: Arc<AtomicBool>,
    monitor: Arc<RwLock<FrameRateMonitor>>,
    counters: Arc<LoopCounters>,
    task: Mutex<Option<JoinHandle<SaveBuffer>>>,
}

impl AcquisitionLoop {
    /// Loop with its own display and event channels.
    pub fn new(display_capacity: usize) -> Self {
        let (frame_tx, _) = broadcast::channel(display_capacity.max(1));
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self::with_channels(frame_tx, event_tx)
    }

    /// Loop publishing on existing channels, so subscribers survive restarts.
    pub fn with_channels(
        frame_tx: broadcast::Sender<FrameRecord>,
        event_tx: broadcast::Sender<LoopEvent>,
    ) -> Self {
        Self {
            frame_tx,
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
            monitor: Arc::new(RwLock::new(FrameRateMonitor::new(&ModeSet::default()))),
            counters: Arc::new(LoopCounters::default()),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to demultiplexed frames.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameRecord> {
        self.frame_tx.subscribe()
    }

    /// Subscribe to timeouts, faults and discontinuities.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LoopEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the loop task is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start consuming frames from `source`.
    ///
    /// Clears the save buffer, counters and rate monitor of any previous run.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] for an empty mode set,
    /// [`SyncError::InvalidTransition`] if the loop is already running.
    pub fn start(&self, source: Arc<dyn FrameSource>, settings: LoopSettings) -> Result<()> {
        if settings.modes.is_empty() {
            return Err(SyncError::invalid_config("mode set is empty"));
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return Err(SyncError::InvalidTransition {
                operation: "start the acquisition loop",
                state: "it is already running".to_string(),
            });
        }

        self.counters.reset();
        *self.monitor.write() = FrameRateMonitor::new(&settings.modes);
        self.running.store(true, Ordering::SeqCst);

        info!(
            modes = %settings.modes,
            frame_timeout_ms = settings.frame_timeout.as_millis() as u64,
            save_enabled = settings.save_enabled,
            "Starting acquisition loop"
        );

        let worker = LoopWorker {
            source,
            settings,
            running: Arc::clone(&self.running),
            monitor: Arc::clone(&self.monitor),
            counters: Arc::clone(&self.counters),
            frame_tx: self.frame_tx.clone(),
            event_tx: self.event_tx.clone(),
        };
        *task = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Stop the loop and collect what it retained.
    ///
    /// Waits at most one frame wait for the task to observe cancellation.
    /// Calling `stop()` on a stopped loop returns an empty buffer and the
    /// last statistics.
    pub async fn stop(&self) -> Result<LoopOutcome> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.task.lock().take();
        let Some(handle) = handle else {
            return Ok(LoopOutcome {
                save_buffer: SaveBuffer::default(),
                stats: self.statistics(),
            });
        };

        let save_buffer = handle.await.map_err(|e| SyncError::LoopFault {
            message: format!("acquisition task ended abnormally: {}", e),
        })?;

        let stats = self.statistics();
        info!(
            total_frames = stats.total_frames,
            timeouts = stats.timeouts,
            faults = stats.faults,
            discontinuities = stats.discontinuities,
            average_rate_hz = format!("{:.2}", stats.average_rate_hz),
            retained = save_buffer.total(),
            "Acquisition loop stopped"
        );
        for (mode, frames) in &stats.frames_per_mode {
            info!(mode = %mode, frames, "Frames acquired");
        }

        Ok(LoopOutcome { save_buffer, stats })
    }

    /// Live statistics snapshot.
    pub fn statistics(&self) -> AcquisitionStats {
        let monitor = self.monitor.read();
        AcquisitionStats {
            total_frames: self.counters.total_frames.load(Ordering::SeqCst),
            frames_per_mode: monitor.frames_per_mode(),
            timeouts: self.counters.timeouts.load(Ordering::SeqCst),
            faults: self.counters.faults.load(Ordering::SeqCst),
            discontinuities: self.counters.discontinuities.load(Ordering::SeqCst),
            lost_frames: self.counters.lost_frames.load(Ordering::SeqCst),
            current_rate_hz: monitor.current_rate_hz(),
            average_rate_hz: monitor.average_rate_hz(),
            per_mode_rate_hz: monitor.per_mode_rates(),
        }
    }

    /// Rate of `mode` in Hz; 0 before two frames of that mode arrived.
    pub fn instantaneous_rate(&self, mode: Mode) -> f64 {
        self.monitor.read().instantaneous_rate(mode)
    }

    /// Rate of `mode` in Hz averaged over its interval ring.
    pub fn mean_rate(&self, mode: Mode) -> f64 {
        self.monitor.read().mean_rate(mode)
    }

    /// Modes silent for longer than `threshold`.
    pub fn stalled_modes(&self, threshold: Duration) -> Vec<Mode> {
        self.monitor.read().stalled_modes(Instant::now(), threshold)
    }
}

impl Default for AcquisitionLoop {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_CAPACITY)
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Result of one iteration.
enum Step {
    Frame,
    Timeout,
    Empty,
}

/// State moved into the spawned task.
struct LoopWorker {
    source: Arc<dyn FrameSource>,
    settings: LoopSettings,
    running: Arc<AtomicBool>,
    monitor: Arc<RwLock<FrameRateMonitor>>,
    counters: Arc<LoopCounters>,
    frame_tx: broadcast::Sender<FrameRecord>,
    event_tx: broadcast::Sender<LoopEvent>,
}

/// Per-run bookkeeping local to the task.
struct LoopState {
    counter: u64,
    save: SaveBuffer,
    consecutive_timeouts: u64,
    consecutive_faults: u64,
    last_frame_number: Option<u64>,
}

impl LoopWorker {
    async fn run(self) -> SaveBuffer {
        let mut state = LoopState {
            counter: 0,
            save: SaveBuffer::new(&self.settings.modes),
            consecutive_timeouts: 0,
            consecutive_faults: 0,
            last_frame_number: None,
        };

        while self.running.load(Ordering::SeqCst) {
            match self.iterate(&mut state).await {
                Ok(Step::Frame) => {
                    state.consecutive_timeouts = 0;
                    state.consecutive_faults = 0;
                }
                Ok(Step::Timeout) => {
                    state.consecutive_timeouts += 1;
                    self.counters.timeouts.fetch_add(1, Ordering::SeqCst);
                    let timeout_ms = self.settings.frame_timeout.as_millis() as u64;
                    warn!(
                        timeout_ms,
                        consecutive = state.consecutive_timeouts,
                        "Frame timeout"
                    );
                    let _ = self.event_tx.send(LoopEvent::FrameTimeout {
                        timeout_ms,
                        consecutive: state.consecutive_timeouts,
                    });
                }
                Ok(Step::Empty) => {
                    trace!("Frame signalled but no payload available");
                }
                Err(e) => {
                    state.consecutive_faults += 1;
                    self.counters.faults.fetch_add(1, Ordering::SeqCst);
                    let err = SyncError::LoopFault {
                        message: format!("{:#}", e),
                    };
                    error!(
                        error = %err,
                        consecutive = state.consecutive_faults,
                        "Error in acquisition loop"
                    );
                    let _ = self.event_tx.send(LoopEvent::Fault {
                        message: err.to_string(),
                        consecutive: state.consecutive_faults,
                    });
                    tokio::time::sleep(self.settings.fault_backoff).await;
                }
            }
        }

        debug!(frames = state.counter, "Acquisition loop exiting");
        state.save
    }

    async fn iterate(&self, state: &mut LoopState) -> anyhow::Result<Step> {
        let timeout = self.settings.frame_timeout;
        let ready = match tokio::time::timeout(
            timeout + WAIT_GUARD,
            self.source.wait_for_frame(timeout),
        )
        .await
        {
            Ok(ready) => ready?,
            Err(_) => false,
        };
        if !ready {
            return Ok(Step::Timeout);
        }

        let Some(frame) = self.source.read_newest_frame().await? else {
            return Ok(Step::Empty);
        };

        let modes = &self.settings.modes;
        let Some(mode) = modes.mode_at(state.counter) else {
            anyhow::bail!("mode set is empty");
        };

        let interval = self.monitor.write().record(mode, Instant::now());
        if let Some(interval) = interval {
            trace!(mode = %mode, interval_ms = interval.as_millis() as u64, "Frame interval");
        }

        self.check_frame_number(state, frame.frame_number);

        let payload = Arc::new(frame);
        let record = FrameRecord {
            mode,
            payload: Arc::clone(&payload),
            sequence_number: state.counter,
            arrived_at: Utc::now(),
        };
        // No subscriber is fine; a lagging one loses its oldest records.
        let _ = self.frame_tx.send(record);

        if self.settings.save_enabled {
            state.save.push(mode, payload.as_ref().clone());
        }

        state.counter += 1;
        self.counters
            .total_frames
            .store(state.counter, Ordering::SeqCst);

        if state.counter % (modes.len() as u64 * HEALTH_LOG_CYCLES) == 0 {
            self.log_health(state.counter);
        }

        Ok(Step::Frame)
    }

    fn check_frame_number(&self, state: &mut LoopState, frame_number: Option<u64>) {
        let Some(received) = frame_number else {
            return;
        };
        if let Some(previous) = state.last_frame_number.replace(received) {
            let expected = previous.wrapping_add(1);
            if received != expected {
                let lost = received.saturating_sub(expected);
                self.counters.discontinuities.fetch_add(1, Ordering::SeqCst);
                self.counters.lost_frames.fetch_add(lost, Ordering::SeqCst);
                warn!(
                    expected,
                    received,
                    lost,
                    "Frame number discontinuity, mode assignment may be out of step"
                );
                let _ = self
                    .event_tx
                    .send(LoopEvent::Discontinuity { expected, received });
            }
        }
    }

    fn log_health(&self, frames: u64) {
        let monitor = self.monitor.read();
        for mode in self.settings.modes.iter() {
            info!(
                mode = %mode,
                rate_hz = format!("{:.2}", monitor.instantaneous_rate(mode)),
                frames = monitor.frames(mode),
                "Mode frame rate"
            );
        }
        let stalled = monitor.stalled_modes(Instant::now(), self.settings.stall_threshold);
        if !stalled.is_empty() {
            warn!(stalled = ?stalled, frames, "Modes without recent frames");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    enum Scripted {
        Frame(Frame),
        Timeout,
        Empty,
        ReadError,
    }

    /// Camera replaying a fixed script, then timing out forever.
    struct ScriptedSource {
        script: Mutex<VecDeque<Scripted>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn wait_for_frame(&self, timeout: Duration) -> anyhow::Result<bool> {
            let ready = {
                let mut script = self.script.lock();
                match script.front() {
                    None => false,
                    Some(Scripted::Timeout) => {
                        script.pop_front();
                        false
                    }
                    Some(_) => true,
                }
            };
            if !ready {
                tokio::time::sleep(timeout).await;
            }
            Ok(ready)
        }

        async fn read_newest_frame(&self) -> anyhow::Result<Option<Frame>> {
            match self.script.lock().pop_front() {
                Some(Scripted::Frame(f)) => Ok(Some(f)),
                Some(Scripted::ReadError) => anyhow::bail!("readout failed"),
                _ => Ok(None),
            }
        }
    }

    fn frame(n: u64) -> Frame {
        Frame::from_u8(2, 2, vec![n as u8; 4]).with_frame_number(n)
    }

    fn settings(modes: &str, save: bool) -> LoopSettings {
        LoopSettings {
            modes: modes.parse().unwrap(),
            frame_timeout: Duration::from_millis(100),
            save_enabled: save,
            fault_backoff: DEFAULT_FAULT_BACKOFF,
            stall_threshold: Duration::from_millis(200),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cyclic_mode_assignment() {
        let source = ScriptedSource::new((1..=10).map(|n| Scripted::Frame(frame(n))).collect());
        let acq = AcquisitionLoop::default();
        let mut rx = acq.subscribe_frames();

        acq.start(source, settings("unlit,blue,green", true)).unwrap();

        let mut ordinals = Vec::new();
        for expected_seq in 0..10u64 {
            let record = rx.recv().await.unwrap();
            assert_eq!(record.sequence_number, expected_seq);
            ordinals.push(record.mode.ordinal());
        }
        assert_eq!(ordinals, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);

        let outcome = acq.stop().await.unwrap();
        assert_eq!(outcome.save_buffer.frames(Mode::Unlit).len(), 4);
        assert_eq!(outcome.save_buffer.frames(Mode::ExcitationA).len(), 3);
        assert_eq!(outcome.save_buffer.frames(Mode::ExcitationB).len(), 3);
        assert_eq!(outcome.stats.total_frames, 10);
        assert_eq!(outcome.stats.frames_per_mode[&Mode::Unlit], 4);
        assert_eq!(outcome.stats.discontinuities, 0);
        assert!(!acq.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_and_empty_reads_do_not_advance_counter() {
        let source = ScriptedSource::new(vec![
            Scripted::Frame(frame(1)),
            Scripted::Timeout,
            Scripted::Empty,
            Scripted::Frame(frame(2)),
        ]);
        let acq = AcquisitionLoop::default();
        let mut rx = acq.subscribe_frames();
        let mut events = acq.subscribe_events();

        acq.start(source, settings("unlit,blue", false)).unwrap();

        assert_eq!(rx.recv().await.unwrap().mode, Mode::Unlit);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.mode, Mode::ExcitationA);
        assert_eq!(second.sequence_number, 1);

        assert_eq!(
            events.recv().await.unwrap(),
            LoopEvent::FrameTimeout {
                timeout_ms: 100,
                consecutive: 1
            }
        );

        let outcome = acq.stop().await.unwrap();
        assert!(outcome.save_buffer.is_empty());
        assert!(outcome.stats.timeouts >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_is_reported_and_loop_continues() {
        let source = ScriptedSource::new(vec![
            Scripted::ReadError,
            Scripted::Frame(frame(1)),
        ]);
        let acq = AcquisitionLoop::default();
        let mut rx = acq.subscribe_frames();
        let mut events = acq.subscribe_events();

        acq.start(source, settings("unlit", true)).unwrap();

        match events.recv().await.unwrap() {
            LoopEvent::Fault {
                message,
                consecutive,
            } => {
                assert!(message.contains("readout failed"));
                assert_eq!(consecutive, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let record = rx.recv().await.unwrap();
        assert_eq!(record.sequence_number, 0);

        let outcome = acq.stop().await.unwrap();
        assert_eq!(outcome.stats.faults, 1);
        assert_eq!(outcome.save_buffer.total(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_frame_number_gap_is_reported_not_corrected() {
        let source = ScriptedSource::new(vec![
            Scripted::Frame(frame(1)),
            Scripted::Frame(frame(2)),
            Scripted::Frame(frame(4)),
        ]);
        let acq = AcquisitionLoop::default();
        let mut rx = acq.subscribe_frames();
        let mut events = acq.subscribe_events();

        acq.start(source, settings("unlit,blue", false)).unwrap();

        let modes: Vec<Mode> = vec![
            rx.recv().await.unwrap().mode,
            rx.recv().await.unwrap().mode,
            rx.recv().await.unwrap().mode,
        ];
        assert_eq!(modes, vec![Mode::Unlit, Mode::ExcitationA, Mode::Unlit]);
        assert_eq!(
            events.recv().await.unwrap(),
            LoopEvent::Discontinuity {
                expected: 3,
                received: 4
            }
        );

        let outcome = acq.stop().await.unwrap();
        assert_eq!(outcome.stats.discontinuities, 1);
        assert_eq!(outcome.stats.lost_frames, 1);
        assert!(logs_contain("Frame number discontinuity"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_and_stop_idempotent() {
        let acq = AcquisitionLoop::default();
        acq.start(ScriptedSource::new(vec![]), settings("unlit", false))
            .unwrap();
        let err = acq
            .start(ScriptedSource::new(vec![]), settings("unlit", false))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));

        acq.stop().await.unwrap();
        let again = acq.stop().await.unwrap();
        assert!(again.save_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_empty_mode_set_rejected() {
        let acq = AcquisitionLoop::default();
        let err = acq
            .start(ScriptedSource::new(vec![]), settings("", false))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));
        assert!(!acq.is_running());
    }

    #[test]
    fn test_settings_from_config() {
        let cfg = CycleConfig::new("unlit,blue".parse().unwrap(), 2.0, 200, 10);
        let s = LoopSettings::from_config(&cfg, true);
        assert_eq!(s.frame_timeout, Duration::from_millis(1500));
        assert!(s.save_enabled);
        assert_eq!(s.modes.len(), 2);
    }
}
