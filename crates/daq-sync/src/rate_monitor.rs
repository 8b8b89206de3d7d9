//! Rolling per-mode frame-interval statistics.
//!
//! Each mode keeps the last [`PER_MODE_WINDOW`] inter-arrival intervals,
//! measured against that mode's own previous frame. A second ring of the last
//! [`GLOBAL_WINDOW`] intervals across all modes gives the session frame rate.

use daq_core::{Mode, ModeSet};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Intervals kept per mode.
pub const PER_MODE_WINDOW: usize = 10;

/// Intervals kept across all modes.
pub const GLOBAL_WINDOW: usize = 100;

/// Intervals of the global ring used for the "current" session rate.
pub const CURRENT_RATE_WINDOW: usize = 10;

/// Bounded ring of intervals in seconds. Oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct IntervalRing {
    buf: VecDeque<f64>,
    capacity: usize,
}

impl IntervalRing {
    /// Empty ring holding at most `capacity` intervals.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append an interval, evicting the oldest on overflow.
    pub fn push(&mut self, seconds: f64) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(seconds);
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no interval has been recorded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum number of stored intervals.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mean of the stored intervals.
    pub fn mean(&self) -> Option<f64> {
        Self::mean_of(self.buf.iter().copied())
    }

    /// Mean of the newest `count` intervals.
    pub fn mean_of_last(&self, count: usize) -> Option<f64> {
        let skip = self.buf.len().saturating_sub(count);
        Self::mean_of(self.buf.iter().skip(skip).copied())
    }

    /// Stored intervals, oldest first.
    pub fn to_vec(&self) -> Vec<f64> {
        self.buf.iter().copied().collect()
    }

    /// Drop every stored interval.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
        let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
        (count > 0).then(|| sum / count as f64)
    }
}

/// `1 / mean`, or 0 when there is nothing to average.
fn rate_from_mean(mean: Option<f64>) -> f64 {
    match mean {
        Some(m) if m > 0.0 => 1.0 / m,
        _ => 0.0,
    }
}

#[derive(Debug, Clone)]
struct ModeTrack {
    ring: IntervalRing,
    last_arrival: Option<Instant>,
    frames: u64,
}

impl ModeTrack {
    fn new() -> Self {
        Self {
            ring: IntervalRing::new(PER_MODE_WINDOW),
            last_arrival: None,
            frames: 0,
        }
    }
}

/// Per-mode and session frame-rate tracker.
///
/// Lives for one acquisition run. Rates are `1 / mean(interval ring)` and 0
/// while the ring is empty.
#[derive(Debug, Clone)]
pub struct FrameRateMonitor {
    modes: BTreeMap<Mode, ModeTrack>,
    global: IntervalRing,
    last_global: Option<Instant>,
    started_at: Instant,
}

impl FrameRateMonitor {
    /// Tracker for the modes of one run, started now.
    pub fn new(modes: &ModeSet) -> Self {
        Self::starting_at(modes, Instant::now())
    }

    /// Tracker whose stall clock starts at `started_at`.
    pub fn starting_at(modes: &ModeSet, started_at: Instant) -> Self {
        Self {
            modes: modes.iter().map(|m| (m, ModeTrack::new())).collect(),
            global: IntervalRing::new(GLOBAL_WINDOW),
            last_global: None,
            started_at,
        }
    }

    /// Record a frame of `mode` arriving at `at`.
    ///
    /// Returns the interval since the previous frame of the same mode; the
    /// first frame of a mode has none.
    pub fn record(&mut self, mode: Mode, at: Instant) -> Option<Duration> {
        if let Some(prev) = self.last_global.replace(at) {
            self.global
                .push(at.saturating_duration_since(prev).as_secs_f64());
        }

        let track = self.modes.entry(mode).or_insert_with(ModeTrack::new);
        track.frames += 1;
        let interval = track
            .last_arrival
            .replace(at)
            .map(|prev| at.saturating_duration_since(prev));
        if let Some(interval) = interval {
            track.ring.push(interval.as_secs_f64());
        }
        interval
    }

    /// Push a pre-computed interval for `mode` directly into its ring.
    pub fn record_interval(&mut self, mode: Mode, seconds: f64) {
        self.modes
            .entry(mode)
            .or_insert_with(ModeTrack::new)
            .ring
            .push(seconds);
    }

    /// Current rate of `mode` in Hz.
    pub fn instantaneous_rate(&self, mode: Mode) -> f64 {
        rate_from_mean(self.modes.get(&mode).and_then(|t| t.ring.mean()))
    }

    /// Rate of `mode` in Hz averaged over its ring. Same window as
    /// [`instantaneous_rate`](Self::instantaneous_rate).
    pub fn mean_rate(&self, mode: Mode) -> f64 {
        self.instantaneous_rate(mode)
    }

    /// Number of intervals currently held for `mode`.
    pub fn ring_len(&self, mode: Mode) -> usize {
        self.modes.get(&mode).map_or(0, |t| t.ring.len())
    }

    /// Intervals held for `mode`, oldest first, in seconds.
    pub fn intervals(&self, mode: Mode) -> Vec<f64> {
        self.modes
            .get(&mode)
            .map(|t| t.ring.to_vec())
            .unwrap_or_default()
    }

    /// Frames recorded for `mode`.
    pub fn frames(&self, mode: Mode) -> u64 {
        self.modes.get(&mode).map_or(0, |t| t.frames)
    }

    /// Frames recorded per mode.
    pub fn frames_per_mode(&self) -> BTreeMap<Mode, u64> {
        self.modes.iter().map(|(m, t)| (*m, t.frames)).collect()
    }

    /// Rate per mode in Hz.
    pub fn per_mode_rates(&self) -> BTreeMap<Mode, f64> {
        self.modes
            .keys()
            .map(|m| (*m, self.instantaneous_rate(*m)))
            .collect()
    }

    /// Session frame rate over the last [`CURRENT_RATE_WINDOW`] intervals.
    pub fn current_rate_hz(&self) -> f64 {
        rate_from_mean(self.global.mean_of_last(CURRENT_RATE_WINDOW))
    }

    /// Session frame rate over the last [`GLOBAL_WINDOW`] intervals.
    pub fn average_rate_hz(&self) -> f64 {
        rate_from_mean(self.global.mean())
    }

    /// Modes that have produced no frame for longer than `threshold`.
    ///
    /// A mode that never produced a frame is measured from the start of the
    /// run.
    pub fn stalled_modes(&self, now: Instant, threshold: Duration) -> Vec<Mode> {
        self.modes
            .iter()
            .filter(|(_, t)| {
                let since = t.last_arrival.unwrap_or(self.started_at);
                now.saturating_duration_since(since) > threshold
            })
            .map(|(m, _)| *m)
            .collect()
    }
}
