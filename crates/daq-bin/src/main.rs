//! `o2-daq`: command-line front end for the multiplexed imaging sync core.
//!
//! - `run` compiles the cycle, drives a simulated output card and camera
//!   for a fixed duration, prints statistics and saves stacks if asked
//! - `compile` prints the compiled waveform without touching hardware
//!
//! # Usage
//!
//! ```bash
//! o2-daq run --modes unlit,blue --frequency 2 --duration-s 30 --save-dir /data/o2
//! o2-daq compile --modes unlit,blue,green --frequency 3 --samples
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use daq_core::{DaqError, ModeSet};
use daq_driver_mock::{MockCamera, MockDigitalOutput, TimingConfig};
use daq_storage::TiffStackWriter;
use daq_sync::{AcquisitionSession, AcquisitionStats, PersistenceOutcome, Waveform, WaveformCompiler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "o2-daq")]
#[command(about = "Multiplexed imaging acquisition with synchronized illumination", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "O2DAQ_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire on simulated hardware for a fixed duration
    Run {
        #[command(flatten)]
        cycle: CycleArgs,

        /// Acquisition length in seconds
        #[arg(long, default_value_t = 10.0)]
        duration_s: f64,

        /// Save stacks into this directory (enables saving)
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },

    /// Print the compiled waveform
    Compile {
        #[command(flatten)]
        cycle: CycleArgs,

        /// Also print every sample
        #[arg(long)]
        samples: bool,
    },
}

/// Overrides for `[acquisition]`.
#[derive(Args, Debug, Default)]
struct CycleArgs {
    /// Comma-separated mode list, e.g. `unlit,blue`
    #[arg(long)]
    modes: Option<ModeSet>,

    /// Cycle frequency in Hz
    #[arg(long)]
    frequency: Option<f64>,

    /// Unlit exposure in ms
    #[arg(long)]
    unlit_exposure_ms: Option<i64>,

    /// Exposure of the excitation modes in ms
    #[arg(long)]
    excited_exposure_ms: Option<i64>,
}

impl CycleArgs {
    fn apply(self, config: &mut AppConfig) {
        let cycle = &mut config.acquisition.cycle;
        if let Some(modes) = self.modes {
            cycle.modes = modes;
        }
        if let Some(frequency) = self.frequency {
            cycle.cycle_frequency_hz = frequency;
        }
        if let Some(ms) = self.unlit_exposure_ms {
            cycle.unlit_exposure_ms = ms;
        }
        if let Some(ms) = self.excited_exposure_ms {
            cycle.excited_exposure_ms = ms;
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            cycle,
            duration_s,
            save_dir,
        } => {
            cycle.apply(&mut config);
            if let Some(dir) = save_dir {
                config.storage.save_dir = Some(dir);
                config.acquisition.save = true;
            }
            config.validate()?;
            init_tracing(&config.application.log_level, cli.json);

            if !(duration_s.is_finite() && duration_s > 0.0) {
                anyhow::bail!("--duration-s must be positive, got {duration_s}");
            }
            run_session(config, Duration::from_secs_f64(duration_s)).await
        }
        Commands::Compile { cycle, samples } => {
            cycle.apply(&mut config);
            config.validate()?;
            init_tracing(&config.application.log_level, cli.json);

            let waveform = WaveformCompiler::compile(&config.acquisition.cycle)
                .map_err(DaqError::from)
                .context("Failed to compile waveform")?;
            print_waveform(&waveform, samples);
            Ok(())
        }
    }
}

async fn run_session(mut config: AppConfig, duration: Duration) -> Result<()> {
    let save_dir = config.resolve_saving();

    let output = Arc::new(
        MockDigitalOutput::builder()
            .timing(TimingConfig::digital_output())
            .build(),
    );
    let mut camera = MockCamera::builder(config.mock.camera_width, config.mock.camera_height)
        .frame_loss_rate(config.mock.frame_loss_rate);
    if let Some(seed) = config.mock.seed {
        camera = camera.seed(seed);
    }
    let camera = Arc::new(camera.build());
    camera.attach_trigger(output.subscribe_pulses());

    let mut session = AcquisitionSession::new(output.clone(), camera.clone())
        .with_display_capacity(config.display.queue_capacity);
    if let Some(dir) = &save_dir {
        session = session.with_sink(Arc::new(TiffStackWriter::new(dir)));
    }

    let display = spawn_display(&session);

    let waveform = session
        .start(config.acquisition.cycle.clone(), config.acquisition.save)
        .await
        .map_err(DaqError::from)
        .context("Failed to start acquisition")?;
    info!(
        samples = waveform.len(),
        triggers = waveform.trigger_count(),
        duration_s = duration.as_secs_f64(),
        "Running"
    );

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
    }

    let summary = session
        .stop()
        .await
        .map_err(DaqError::from)
        .context("Failed to stop acquisition")?;
    let camera_stats = camera.statistics();
    drop(session);
    let (shown, lagged) = display.await.unwrap_or_default();

    print_stats(&summary.stats);
    println!("Display: {shown} frames shown, {lagged} dropped");
    println!(
        "Camera: {} triggers, {} lost, {} overwritten",
        camera_stats.triggers_received, camera_stats.lost_frames, camera_stats.overwritten_frames
    );
    match &summary.persistence {
        PersistenceOutcome::Disabled => {}
        PersistenceOutcome::NothingToSave => println!("Saving: nothing retained"),
        PersistenceOutcome::Saved { report, metadata } => {
            println!("Saving: {} files written", report.written.len());
            for mode in &report.skipped {
                println!("  {mode}: no frames");
            }
            for (mode, reason) in &report.failed {
                println!("  {mode}: FAILED ({reason})");
            }
            if let Some(path) = metadata {
                println!("  metadata: {}", path.display());
            }
        }
        PersistenceOutcome::Failed { message } => println!("Saving FAILED: {message}"),
    }
    Ok(())
}

/// Stand-in for a live view: drains the display channel and counts drops.
fn spawn_display(session: &AcquisitionSession) -> tokio::task::JoinHandle<(u64, u64)> {
    let mut frames = session.subscribe_frames();
    tokio::spawn(async move {
        let (mut shown, mut lagged) = (0u64, 0u64);
        loop {
            match frames.recv().await {
                Ok(record) => {
                    shown += 1;
                    debug!(
                        mode = %record.mode,
                        sequence = record.sequence_number,
                        mean = format!("{:.1}", record.payload.mean()),
                        "Display frame"
                    );
                }
                Err(RecvError::Lagged(n)) => {
                    lagged += n;
                    warn!(dropped = n, "Display fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        (shown, lagged)
    })
}

fn print_stats(stats: &AcquisitionStats) {
    println!("Frames: {}", stats.total_frames);
    for (mode, frames) in &stats.frames_per_mode {
        let rate = stats.per_mode_rate_hz.get(mode).copied().unwrap_or(0.0);
        println!("  {mode:<13} {frames:>6} frames  {rate:>7.3} Hz");
    }
    println!(
        "Rate: {:.3} Hz current, {:.3} Hz average",
        stats.current_rate_hz, stats.average_rate_hz
    );
    println!(
        "Timeouts: {}  Faults: {}  Discontinuities: {} ({} frames lost)",
        stats.timeouts, stats.faults, stats.discontinuities, stats.lost_frames
    );
}

fn print_waveform(waveform: &Waveform, samples: bool) {
    let config = waveform.config();
    println!(
        "{} samples @ {} Hz ({:.4} Hz pattern), slot width {}",
        waveform.len(),
        waveform.sample_rate_hz(),
        config.effective_period_hz(),
        waveform.slot_width()
    );
    println!("{:<13} {:>4} {:>8} {:>8} {:>6}", "mode", "slot", "start", "length", "mask");
    for window in waveform.windows() {
        println!(
            "{:<13} {:>4} {:>8} {:>8} {:#06b}",
            window.mode.to_string(),
            window.slot,
            window.start,
            window.len,
            window.mask()
        );
    }
    if samples {
        for (i, value) in waveform.samples().iter().enumerate() {
            println!("{i:>8} 0x{value:02x}");
        }
    }
}
