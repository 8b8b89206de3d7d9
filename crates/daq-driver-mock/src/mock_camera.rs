//! Mock camera exposing the newest-frame acquisition model.
//!
//! The camera keeps a single slot holding the most recent unread frame.
//! A new frame overwrites an unread one (counted in
//! [`FrameStatistics::overwritten_frames`]), matching how a scientific
//! camera in "newest frame" readout mode behaves when the consumer is slow.
//!
//! Frames arrive either from [`MockCamera::push_frame`] (tests that script
//! the exact payloads) or from trigger pulses of a
//! [`MockDigitalOutput`](crate::MockDigitalOutput) after
//! [`MockCamera::attach_trigger`].

use crate::common::{ErrorConfig, MockRng, TimingConfig};
use crate::mock_digital_output::TriggerPulse;
use crate::pattern::tissue_pattern;
use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::FrameSource;
use daq_core::data::Frame;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

const DRIVER_TYPE: &str = "mock_camera";

// =============================================================================
// FrameStatistics - Frame Loss Tracking
// =============================================================================

/// Counters describing what happened to every exposure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStatistics {
    /// Trigger pulses received from the attached output
    pub triggers_received: u64,
    /// Frames placed in the newest-frame slot
    pub frames_produced: u64,
    /// Frames handed to a reader
    pub frames_delivered: u64,
    /// Exposures the sensor dropped (simulated loss)
    pub lost_frames: u64,
    /// Frames replaced before anyone read them
    pub overwritten_frames: u64,
    /// Trigger pulses missed because the producer fell behind
    pub missed_triggers: u64,
}

struct CameraShared {
    newest: Mutex<Option<Frame>>,
    notify: Notify,
    statistics: Mutex<FrameStatistics>,
    next_frame_nr: AtomicU64,
}

impl CameraShared {
    fn publish(&self, frame: Frame) {
        {
            let mut slot = self.newest.lock();
            let mut stats = self.statistics.lock();
            if slot.is_some() {
                stats.overwritten_frames += 1;
            }
            stats.frames_produced += 1;
            *slot = Some(frame);
        }
        self.notify.notify_waiters();
    }

    /// Expose one frame lit by `illumination_mask`.
    fn expose(&self, geometry: (u32, u32), illumination_mask: u32, loss: &FrameLoss) -> Option<Frame> {
        let frame_nr = self.next_frame_nr.fetch_add(1, Ordering::SeqCst);
        if loss.rng.should_fail(loss.rate) {
            self.statistics.lock().lost_frames += 1;
            tracing::debug!(frame_nr, "Simulated frame loss");
            return None;
        }
        let (width, height) = geometry;
        let pixels = tissue_pattern(width, height, frame_nr, illumination_mask);
        Some(Frame::from_u16(width, height, &pixels).with_frame_number(frame_nr))
    }
}

#[derive(Clone)]
struct FrameLoss {
    rate: f64,
    rng: Arc<MockRng>,
}

// =============================================================================
// MockCameraBuilder
// =============================================================================

/// Builder for [`MockCamera`].
pub struct MockCameraBuilder {
    width: u32,
    height: u32,
    frame_loss_rate: f64,
    seed: Option<u64>,
    error_config: ErrorConfig,
    timing_config: TimingConfig,
}

impl MockCameraBuilder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_loss_rate: 0.0,
            seed: None,
            error_config: ErrorConfig::none(),
            timing_config: TimingConfig::camera(),
        }
    }

    /// Probability that a triggered exposure is dropped by the sensor.
    pub fn frame_loss_rate(mut self, rate: f64) -> Self {
        self.frame_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Seed for the frame-loss RNG.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn timing_config(mut self, config: TimingConfig) -> Self {
        self.timing_config = config;
        self
    }

    pub fn build(self) -> MockCamera {
        MockCamera {
            resolution: (self.width, self.height),
            shared: Arc::new(CameraShared {
                newest: Mutex::new(None),
                notify: Notify::new(),
                statistics: Mutex::new(FrameStatistics::default()),
                next_frame_nr: AtomicU64::new(1),
            }),
            trigger_task: Mutex::new(None),
            loss: FrameLoss {
                rate: self.frame_loss_rate,
                rng: Arc::new(MockRng::new(self.seed)),
            },
            error_config: self.error_config,
            timing_config: self.timing_config,
        }
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Simulated camera.
///
/// # Example
///
/// ```rust,ignore
/// let output = MockDigitalOutput::new();
/// let camera = MockCamera::new(64, 64);
/// camera.attach_trigger(output.subscribe_pulses());
/// ```
pub struct MockCamera {
    resolution: (u32, u32),
    shared: Arc<CameraShared>,
    trigger_task: Mutex<Option<JoinHandle<()>>>,
    loss: FrameLoss,
    error_config: ErrorConfig,
    timing_config: TimingConfig,
}

impl MockCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self::builder(width, height).build()
    }

    pub fn builder(width: u32, height: u32) -> MockCameraBuilder {
        MockCameraBuilder::new(width, height)
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    /// Snapshot of the frame counters.
    pub fn statistics(&self) -> FrameStatistics {
        self.shared.statistics.lock().clone()
    }

    /// Error injection handle shared with this camera.
    pub fn error_config(&self) -> &ErrorConfig {
        &self.error_config
    }

    /// Place a frame in the newest-frame slot.
    pub fn push_frame(&self, frame: Frame) {
        self.shared.publish(frame);
    }

    /// Software trigger: expose one frame immediately.
    ///
    /// Returns the frame number consumed, even if the exposure was lost.
    pub fn trigger(&self, illumination_mask: u32) -> u64 {
        let frame_nr = self.shared.next_frame_nr.load(Ordering::SeqCst);
        if let Some(frame) = self.shared.expose(self.resolution, illumination_mask, &self.loss) {
            self.shared.publish(frame);
        }
        frame_nr
    }

    /// Expose a frame for every pulse received on `pulses`.
    ///
    /// Replaces any previously attached trigger source.
    pub fn attach_trigger(&self, mut pulses: broadcast::Receiver<TriggerPulse>) {
        let shared = self.shared.clone();
        let loss = self.loss.clone();
        let geometry = self.resolution;
        let readout = self.timing_config.readout();

        let task = tokio::spawn(async move {
            loop {
                match pulses.recv().await {
                    Ok(pulse) => {
                        shared.statistics.lock().triggers_received += 1;
                        let Some(frame) = shared.expose(geometry, pulse.illumination_mask, &loss) else {
                            continue;
                        };
                        if readout > Duration::ZERO {
                            tokio::time::sleep(readout).await;
                        }
                        shared.publish(frame);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        shared.statistics.lock().missed_triggers += skipped;
                        tracing::warn!(skipped, "Camera missed trigger pulses");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Trigger source closed");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.trigger_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop reacting to trigger pulses.
    pub fn detach_trigger(&self) {
        if let Some(task) = self.trigger_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        self.detach_trigger();
    }
}

#[async_trait]
impl FrameSource for MockCamera {
    async fn wait_for_frame(&self, timeout: Duration) -> Result<bool> {
        self.error_config.check_operation(DRIVER_TYPE, "wait")?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a publish in between is not missed
            let notified = self.shared.notify.notified();
            if self.shared.newest.lock().is_some() {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn read_newest_frame(&self) -> Result<Option<Frame>> {
        self.error_config.check_operation(DRIVER_TYPE, "read")?;
        let frame = self.shared.newest.lock().take();
        if frame.is_some() {
            self.shared.statistics.lock().frames_delivered += 1;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;

    #[tokio::test]
    async fn test_push_and_read() {
        let camera = MockCamera::new(4, 4);
        assert!(camera.read_newest_frame().await.unwrap().is_none());

        camera.push_frame(Frame::from_u16(4, 4, &[7; 16]).with_frame_number(9));
        assert!(camera.wait_for_frame(Duration::from_millis(1)).await.unwrap());
        let frame = camera.read_newest_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_number, Some(9));
        assert!(camera.read_newest_frame().await.unwrap().is_none());
        assert_eq!(camera.statistics().frames_delivered, 1);
    }

    #[tokio::test]
    async fn test_unread_frame_is_overwritten() {
        let camera = MockCamera::new(2, 2);
        camera.push_frame(Frame::from_u16(2, 2, &[1; 4]).with_frame_number(1));
        camera.push_frame(Frame::from_u16(2, 2, &[2; 4]).with_frame_number(2));

        let frame = camera.read_newest_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_number, Some(2));
        let stats = camera.statistics();
        assert_eq!(stats.frames_produced, 2);
        assert_eq!(stats.overwritten_frames, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let camera = MockCamera::new(2, 2);
        let start = tokio::time::Instant::now();
        assert!(!camera.wait_for_frame(Duration::from_millis(150)).await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_publish() {
        let camera = Arc::new(MockCamera::new(2, 2));
        let producer = camera.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.trigger(0);
        });
        assert!(camera.wait_for_frame(Duration::from_secs(1)).await.unwrap());
        let frame = camera.read_newest_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_number, Some(1));
    }

    #[tokio::test]
    async fn test_software_trigger_numbers_frames() {
        let camera = MockCamera::new(8, 8);
        assert_eq!(camera.trigger(0), 1);
        assert_eq!(camera.trigger(1 << 1), 2);
        let frame = camera.read_newest_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_number, Some(2));
        assert_eq!((frame.width, frame.height), (8, 8));
    }

    #[tokio::test]
    async fn test_frame_loss_skips_numbers() {
        let camera = MockCamera::builder(4, 4).frame_loss_rate(1.0).build();
        camera.trigger(0);
        assert!(camera.read_newest_frame().await.unwrap().is_none());
        assert_eq!(camera.statistics().lost_frames, 1);
        assert_eq!(camera.trigger(0), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_pulses_produce_frames() {
        let (tx, rx) = broadcast::channel(8);
        let camera = MockCamera::new(16, 16);
        camera.attach_trigger(rx);

        tx.send(TriggerPulse {
            cycle: 0,
            start_sample: 0,
            width: Duration::from_millis(10),
            illumination_mask: 1 << 2,
        })
        .unwrap();
        assert!(camera.wait_for_frame(Duration::from_secs(1)).await.unwrap());
        let frame = camera.read_newest_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_number, Some(1));
        assert!(frame.mean() > 1_000.0);
        assert_eq!(camera.statistics().triggers_received, 1);
        camera.detach_trigger();
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let camera = MockCamera::builder(2, 2)
            .error_config(ErrorConfig::scenario(ErrorScenario::FailTimes {
                operation: "read",
                count: 1,
            }))
            .build();
        camera.push_frame(Frame::from_u16(2, 2, &[0; 4]));
        assert!(camera.read_newest_frame().await.is_err());
        assert!(camera.read_newest_frame().await.unwrap().is_some());
    }
}
