//! Mock digital-output card that replays a line pattern.
//!
//! The card latches one `u32` per sample, where bit `k` drives output line
//! `k`. After [`PatternOutput::write_and_start`] a playback task walks the
//! pattern at the configured sample rate and repeats it until stopped.
//! Every time the trigger line falls, a [`TriggerPulse`] is broadcast so a
//! [`MockCamera`](crate::MockCamera) can expose a frame for it.

use crate::common::{ErrorConfig, TimingConfig};
use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::PatternOutput;
use daq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

const DRIVER_TYPE: &str = "mock_digital_output";
const DEFAULT_TRIGGER_LINE: u32 = 4;
const DEFAULT_PULSE_CAPACITY: usize = 256;

/// One completed camera trigger pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPulse {
    /// Pattern repetition in which the pulse started (0-based)
    pub cycle: u64,
    /// Sample index at which the trigger line rose
    pub start_sample: usize,
    /// Time the trigger line stayed high
    pub width: Duration,
    /// Non-trigger lines that were high at any point during the pulse
    pub illumination_mask: u32,
}

/// A run of identical samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: usize,
    value: u32,
}

fn segments(pattern: &[u32]) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::new();
    for (start, &value) in pattern.iter().enumerate() {
        if out.last().is_none_or(|s| s.value != value) {
            out.push(Segment { start, value });
        }
    }
    out
}

#[derive(Debug, Default)]
struct ChannelConfig {
    sample_rate_hz: u32,
    samples_per_channel: usize,
    pattern: Option<Arc<[u32]>>,
    static_writes: Vec<u32>,
}

struct Shared {
    lines: AtomicU32,
    cycles: AtomicU64,
    pulses: AtomicU64,
    pulse_tx: broadcast::Sender<TriggerPulse>,
}

/// Builder for [`MockDigitalOutput`].
#[derive(Debug)]
pub struct MockDigitalOutputBuilder {
    name: String,
    trigger_line: u32,
    pulse_capacity: usize,
    error_config: ErrorConfig,
    timing: TimingConfig,
}

impl Default for MockDigitalOutputBuilder {
    fn default() -> Self {
        Self {
            name: "Dev1/port0".to_string(),
            trigger_line: DEFAULT_TRIGGER_LINE,
            pulse_capacity: DEFAULT_PULSE_CAPACITY,
            error_config: ErrorConfig::none(),
            timing: TimingConfig::instant(),
        }
    }
}

impl MockDigitalOutputBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Line whose falling edge produces a [`TriggerPulse`].
    pub fn trigger_line(mut self, line: u32) -> Self {
        self.trigger_line = line.min(31);
        self
    }

    pub fn pulse_capacity(mut self, capacity: usize) -> Self {
        self.pulse_capacity = capacity.max(1);
        self
    }

    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn build(self) -> MockDigitalOutput {
        let (pulse_tx, _) = broadcast::channel(self.pulse_capacity);
        MockDigitalOutput {
            name: self.name,
            trigger_mask: 1 << self.trigger_line,
            channel: Mutex::new(ChannelConfig::default()),
            shared: Arc::new(Shared {
                lines: AtomicU32::new(0),
                cycles: AtomicU64::new(0),
                pulses: AtomicU64::new(0),
                pulse_tx,
            }),
            task: Mutex::new(None),
            error_config: self.error_config,
            timing: self.timing,
        }
    }
}

/// Simulated digital-output card.
pub struct MockDigitalOutput {
    name: String,
    trigger_mask: u32,
    channel: Mutex<ChannelConfig>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    error_config: ErrorConfig,
    timing: TimingConfig,
}

impl MockDigitalOutput {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockDigitalOutputBuilder {
        MockDigitalOutputBuilder::default()
    }

    /// Lines currently driven by the card.
    pub fn line_state(&self) -> u32 {
        self.shared.lines.load(Ordering::SeqCst)
    }

    /// Whether a pattern is being replayed.
    pub fn is_armed(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// The last pattern written by `write_and_start`.
    pub fn pattern(&self) -> Option<Arc<[u32]>> {
        self.channel.lock().pattern.clone()
    }

    /// `(sample_rate_hz, samples_per_channel)` from the last `configure`.
    pub fn timing_config(&self) -> Option<(u32, usize)> {
        let channel = self.channel.lock();
        (channel.sample_rate_hz > 0).then_some((channel.sample_rate_hz, channel.samples_per_channel))
    }

    /// Every mask written with `write_static`, oldest first.
    pub fn static_writes(&self) -> Vec<u32> {
        self.channel.lock().static_writes.clone()
    }

    /// Complete pattern repetitions since the last start.
    pub fn cycles_completed(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }

    /// Trigger pulses emitted since the last start.
    pub fn pulses_emitted(&self) -> u64 {
        self.shared.pulses.load(Ordering::SeqCst)
    }

    /// Receive a [`TriggerPulse`] for every falling trigger edge.
    pub fn subscribe_pulses(&self) -> broadcast::Receiver<TriggerPulse> {
        self.shared.pulse_tx.subscribe()
    }

    /// Error injection handle shared with this device.
    pub fn error_config(&self) -> &ErrorConfig {
        &self.error_config
    }

    fn busy(&self, operation: &str) -> anyhow::Error {
        DriverError::new(
            DRIVER_TYPE,
            DriverErrorKind::Busy,
            format!("Cannot {operation} on {} while a pattern is playing", self.name),
        )
        .into()
    }
}

impl Default for MockDigitalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockDigitalOutput {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl PatternOutput for MockDigitalOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, sample_rate_hz: u32, samples_per_channel: usize) -> Result<()> {
        self.timing.communicate().await;
        self.error_config.check_operation(DRIVER_TYPE, "configure")?;
        if self.is_armed() {
            return Err(self.busy("configure"));
        }
        if sample_rate_hz == 0 || samples_per_channel == 0 {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::InvalidParameter,
                format!("Invalid timing: {sample_rate_hz} Hz, {samples_per_channel} samples"),
            )
            .into());
        }
        if u32::try_from(samples_per_channel).is_err() {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::InvalidParameter,
                format!("{samples_per_channel} samples exceed the on-board buffer"),
            )
            .into());
        }

        let mut channel = self.channel.lock();
        channel.sample_rate_hz = sample_rate_hz;
        channel.samples_per_channel = samples_per_channel;
        tracing::debug!(
            device = %self.name,
            sample_rate_hz,
            samples_per_channel,
            "Configured sample clock"
        );
        Ok(())
    }

    async fn write_and_start(&self, samples: &[u32]) -> Result<()> {
        self.timing.communicate().await;
        self.error_config.check_operation(DRIVER_TYPE, "arm")?;

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(self.busy("start"));
        }

        let (sample_rate_hz, pattern) = {
            let mut channel = self.channel.lock();
            if channel.sample_rate_hz == 0 {
                return Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::Configuration,
                    "Sample clock not configured",
                )
                .into());
            }
            if samples.len() != channel.samples_per_channel {
                return Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::InvalidParameter,
                    format!(
                        "Expected {} samples, got {}",
                        channel.samples_per_channel,
                        samples.len()
                    ),
                )
                .into());
            }
            let pattern: Arc<[u32]> = Arc::from(samples);
            channel.pattern = Some(pattern.clone());
            (channel.sample_rate_hz, pattern)
        };

        self.shared.cycles.store(0, Ordering::SeqCst);
        self.shared.pulses.store(0, Ordering::SeqCst);
        let tick = Duration::from_nanos(1_000_000_000 / u64::from(sample_rate_hz));
        *task = Some(tokio::spawn(playback(
            pattern,
            tick,
            self.trigger_mask,
            self.shared.clone(),
        )));

        tracing::info!(
            device = %self.name,
            samples = samples.len(),
            sample_rate_hz,
            "Pattern playback started"
        );
        Ok(())
    }

    async fn write_static(&self, mask: u32) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, "write")?;
        if self.is_armed() {
            return Err(self.busy("write static lines"));
        }
        self.shared.lines.store(mask, Ordering::SeqCst);
        self.channel.lock().static_writes.push(mask);
        tracing::debug!(device = %self.name, mask = format_args!("{mask:#07b}"), "Static lines written");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, "stop")?;
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!(
                device = %self.name,
                cycles = self.cycles_completed(),
                "Pattern playback stopped"
            );
        }
        Ok(())
    }
}

/// Replay `pattern` forever, one sample per `tick`.
async fn playback(pattern: Arc<[u32]>, tick: Duration, trigger_mask: u32, shared: Arc<Shared>) {
    struct OpenPulse {
        cycle: u64,
        start_sample: usize,
        started: Instant,
        mask: u32,
    }

    let segments = segments(&pattern);
    let period = tick * pattern.len() as u32;
    let mut origin = Instant::now();
    let mut cycle = 0u64;
    let mut open: Option<OpenPulse> = None;

    loop {
        for segment in &segments {
            let at = origin + tick * segment.start as u32;
            sleep_until(at).await;
            shared.lines.store(segment.value, Ordering::SeqCst);

            let illumination = segment.value & !trigger_mask;
            if segment.value & trigger_mask != 0 {
                match open.as_mut() {
                    Some(pulse) => pulse.mask |= illumination,
                    None => {
                        open = Some(OpenPulse {
                            cycle,
                            start_sample: segment.start,
                            started: at,
                            mask: illumination,
                        })
                    }
                }
            } else if let Some(pulse) = open.take() {
                shared.pulses.fetch_add(1, Ordering::SeqCst);
                // No subscribers is fine
                let _ = shared.pulse_tx.send(TriggerPulse {
                    cycle: pulse.cycle,
                    start_sample: pulse.start_sample,
                    width: at - pulse.started,
                    illumination_mask: pulse.mask,
                });
            }
        }
        origin += period;
        cycle += 1;
        shared.cycles.store(cycle, Ordering::SeqCst);
    }
}
