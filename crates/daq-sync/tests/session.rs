//! End-to-end runs of an acquisition session against the mock rig:
//! the digital-output card triggers the camera, the loop demultiplexes.

use daq_core::{Mode, ModeSet};
use daq_driver_mock::{ErrorConfig, ErrorScenario, MockCamera, MockDigitalOutput, TimingConfig};
use daq_storage::TiffStackWriter;
use daq_sync::{
    AcquisitionSession, AcquisitionState, CycleConfig, LoopEvent, PersistenceOutcome, SyncError,
};
use std::sync::Arc;
use std::time::Duration;

/// Lit frames from the mock camera sit far above this, unlit ones far below.
const LIT_THRESHOLD: f64 = 5_000.0;

fn rig_with(output: MockDigitalOutput, camera: MockCamera) -> (Arc<MockDigitalOutput>, Arc<MockCamera>) {
    let output = Arc::new(output);
    let camera = Arc::new(camera);
    camera.attach_trigger(output.subscribe_pulses());
    (output, camera)
}

fn rig() -> (Arc<MockDigitalOutput>, Arc<MockCamera>) {
    rig_with(
        MockDigitalOutput::new(),
        MockCamera::builder(16, 16)
            .timing_config(TimingConfig::instant())
            .build(),
    )
}

fn two_mode_config() -> CycleConfig {
    CycleConfig::new("unlit,blue".parse().unwrap(), 2.0, 200, 10)
}

#[tokio::test(start_paused = true)]
async fn test_frames_are_assigned_to_the_mode_that_lit_them() {
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output.clone(), camera.clone());
    let mut frames = session.subscribe_frames();

    let waveform = session.start(two_mode_config(), false).await.unwrap();
    assert_eq!(waveform.len(), 1000);
    assert_eq!(session.state(), AcquisitionState::Running);
    assert!(output.is_armed());
    assert_eq!(output.timing_config(), Some((1000, 1000)));

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    let summary = session.stop().await.unwrap();

    assert_eq!(session.state(), AcquisitionState::Idle);
    assert!(summary.stats.total_frames >= 6);
    assert_eq!(summary.stats.timeouts, 0);
    assert_eq!(summary.stats.discontinuities, 0);
    assert_eq!(summary.persistence, PersistenceOutcome::Disabled);

    let mut seen = 0u64;
    while let Ok(record) = frames.try_recv() {
        let lit = record.payload.mean() > LIT_THRESHOLD;
        assert_eq!(
            lit,
            record.mode == Mode::ExcitationA,
            "frame {} assigned to {}",
            record.sequence_number,
            record.mode
        );
        seen += 1;
    }
    assert_eq!(seen, summary.stats.total_frames);

    // Lines left low after stop
    assert!(!output.is_armed());
    assert_eq!(output.line_state(), 0);
    assert_eq!(output.static_writes().last(), Some(&0));
}

#[tokio::test(start_paused = true)]
async fn test_per_mode_rate_matches_cycle() {
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output, camera);
    session.start(two_mode_config(), false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5_300)).await;
    let unlit = session.mode_rate(Mode::Unlit);
    let lit = session.mode_rate(Mode::ExcitationA);
    assert!((unlit - 1.0).abs() < 0.01, "unlit rate {unlit}");
    assert!((lit - 1.0).abs() < 0.01, "excitation_a rate {lit}");
    assert!(session.stalled_modes().await.is_empty());

    session.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_saving_run_writes_one_stack_per_mode() {
    let dir = tempfile::TempDir::new().unwrap();
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output, camera)
        .with_sink(Arc::new(TiffStackWriter::new(dir.path())));

    let config = CycleConfig::new("unlit,blue,green".parse().unwrap(), 3.0, 200, 10);
    session.start(config, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_050)).await;
    let summary = session.stop().await.unwrap();

    let PersistenceOutcome::Saved { report, metadata } = summary.persistence else {
        panic!("expected a saved run, got {:?}", summary.persistence);
    };
    assert!(report.is_complete());
    assert_eq!(report.written.len() as u64, summary.stats.total_frames);
    let metadata = metadata.unwrap();
    let text = std::fs::read_to_string(metadata).unwrap();
    assert!(text.contains("modes: [unlit, excitation_a, excitation_b]"));
    assert!(text.contains("samples_per_period: 1000"));

    for prefix in ["unlit_", "excitation_a_", "excitation_b_"] {
        let found = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with(prefix));
        assert!(found, "no stack for {prefix}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_saving_without_sink_is_disabled() {
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output, camera);
    session.start(two_mode_config(), true).await.unwrap();
    assert!(!session.snapshot().save_enabled);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let summary = session.stop().await.unwrap();
    assert_eq!(summary.persistence, PersistenceOutcome::Disabled);
}

#[tokio::test(start_paused = true)]
async fn test_arm_failure_moves_to_error_and_reset_recovers() {
    let (output, camera) = rig_with(
        MockDigitalOutput::builder()
            .error_config(ErrorConfig::scenario(ErrorScenario::FailTimes {
                operation: "arm",
                count: 1,
            }))
            .build(),
        MockCamera::builder(8, 8)
            .timing_config(TimingConfig::instant())
            .build(),
    );
    let session = AcquisitionSession::new(output.clone(), camera);

    let err = session.start(two_mode_config(), false).await.unwrap_err();
    assert!(matches!(err, SyncError::DeviceError { .. }), "got {err:?}");
    assert_eq!(session.state(), AcquisitionState::Error);
    assert!(session.snapshot().last_error.is_some());
    assert!(!output.is_armed());
    assert_eq!(output.line_state(), 0);

    // Start is not legal from Error
    let err = session.start(two_mode_config(), false).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidTransition { .. }));

    session.reset(two_mode_config(), false).await.unwrap();
    assert_eq!(session.state(), AcquisitionState::Running);
    assert!(output.is_armed());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let summary = session.stop().await.unwrap();
    assert!(summary.stats.total_frames >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_stop_saves_frames_and_reset_recovers() {
    let dir = tempfile::TempDir::new().unwrap();
    let (output, camera) = rig_with(
        MockDigitalOutput::builder()
            .error_config(ErrorConfig::scenario(ErrorScenario::FailTimes {
                operation: "stop",
                count: 1,
            }))
            .build(),
        MockCamera::builder(8, 8)
            .timing_config(TimingConfig::instant())
            .build(),
    );
    let session = AcquisitionSession::new(output.clone(), camera)
        .with_sink(Arc::new(TiffStackWriter::new(dir.path())));

    session.start(two_mode_config(), true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_600)).await;

    let err = session.stop().await.unwrap_err();
    assert!(matches!(err, SyncError::DeviceError { .. }), "got {err:?}");
    assert_eq!(session.state(), AcquisitionState::Error);
    assert!(session.snapshot().last_error.is_some());
    // The card never stopped, so the waveform is still owned here
    assert!(output.is_armed());
    assert!(session.live_waveform().await.is_some());

    // Frames retained during the run reached the disk anyway
    let saved: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    for prefix in ["unlit_", "excitation_a_", "metadata_"] {
        assert!(
            saved.iter().any(|name| name.starts_with(prefix)),
            "no {prefix} file in {saved:?}"
        );
    }

    session.reset(two_mode_config(), false).await.unwrap();
    assert_eq!(session.state(), AcquisitionState::Running);
    assert!(output.is_armed());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let summary = session.stop().await.unwrap();
    assert!(summary.stats.total_frames >= 1);
    assert_eq!(session.state(), AcquisitionState::Idle);
    assert!(!output.is_armed());
    assert_eq!(output.line_state(), 0);
    assert!(session.live_waveform().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_busy_output_reports_device_busy() {
    let (output, camera) = rig_with(
        MockDigitalOutput::builder()
            .error_config(ErrorConfig::scenario(ErrorScenario::Busy {
                operation: "configure",
            }))
            .build(),
        MockCamera::new(8, 8),
    );
    let session = AcquisitionSession::new(output.clone(), camera);

    let err = session.start(two_mode_config(), false).await.unwrap_err();
    assert!(matches!(err, SyncError::DeviceBusy { .. }), "got {err:?}");
    assert!(!output.is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_empty_mode_set_stays_idle() {
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output.clone(), camera);

    let config = CycleConfig::new(ModeSet::default(), 1.0, 700, 10);
    let err = session.start(config, false).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidConfig { .. }));
    assert_eq!(session.state(), AcquisitionState::Idle);
    assert_eq!(output.timing_config(), None);
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_idle_is_rejected() {
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output, camera);
    let err = session.stop().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidTransition { .. }));
    assert_eq!(err.to_string(), "Cannot stop acquisition while idle");
}

#[tokio::test(start_paused = true)]
async fn test_camera_faults_are_reported_and_survived() {
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output, camera.clone());
    let mut events = session.subscribe_events();
    session.start(two_mode_config(), false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    camera.error_config().set_communication_lost(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    camera.error_config().reset();
    tokio::time::sleep(Duration::from_millis(1_600)).await;

    assert_eq!(session.state(), AcquisitionState::Running);
    let summary = session.stop().await.unwrap();
    assert!(summary.stats.faults > 0);
    assert!(summary.stats.total_frames >= 3);

    let mut faults = 0;
    while let Ok(event) = events.try_recv() {
        if let LoopEvent::Fault { message, .. } = event {
            assert!(message.contains("Communication lost"), "{message}");
            faults += 1;
        }
    }
    assert!(faults > 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_exposures_show_up_as_discontinuities() {
    let (output, camera) = rig_with(
        MockDigitalOutput::new(),
        MockCamera::builder(8, 8)
            .frame_loss_rate(0.3)
            .seed(11)
            .timing_config(TimingConfig::instant())
            .build(),
    );
    let session = AcquisitionSession::new(output.clone(), camera.clone());
    session
        .start(CycleConfig::new("unlit,blue".parse().unwrap(), 4.0, 100, 10), false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    let summary = session.stop().await.unwrap();

    let lost = camera.statistics().lost_frames;
    assert!(lost > 0);
    assert!(summary.stats.discontinuities > 0);
    assert!(summary.stats.lost_frames > 0);
    assert!(summary.stats.lost_frames <= lost);
}

#[tokio::test(start_paused = true)]
async fn test_state_changes_are_published() {
    let (output, camera) = rig();
    let session = AcquisitionSession::new(output, camera);
    let mut state_rx = session.subscribe_state();
    let initial = state_rx.borrow_and_update().revision;

    session.start(two_mode_config(), false).await.unwrap();
    assert!(state_rx.has_changed().unwrap());
    let running = state_rx.borrow_and_update().clone();
    assert_eq!(running.state, AcquisitionState::Running);
    assert_eq!(running.revision, initial + 1);
    assert_eq!(running.config.unwrap().modes.len(), 2);

    session.stop().await.unwrap();
    assert_eq!(state_rx.borrow_and_update().state, AcquisitionState::Idle);
}
