//! Application configuration for `o2-daq`.
//!
//! Layering, later layers win:
//!
//! 1. Built-in defaults (the instrument's start-up state: `[unlit]`, 1 Hz,
//!    700 ms unlit exposure, 10 ms excited exposure, saving off)
//! 2. TOML file passed with `--config` (optional)
//! 3. Environment variables prefixed with `O2DAQ_`, nested fields split on
//!    `__`, e.g. `O2DAQ_ACQUISITION__CYCLE_FREQUENCY_HZ=2`
//! 4. Command-line flags
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [acquisition]
//! modes = ["unlit", "blue"]
//! cycle_frequency_hz = 2.0
//! unlit_exposure_ms = 200
//! excited_exposure_ms = 10
//! save = true
//!
//! [storage]
//! save_dir = "/data/o2"
//!
//! [display]
//! queue_capacity = 16
//! ```

use anyhow::{bail, Context, Result};
use daq_sync::CycleConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub application: ApplicationSettings,
    pub acquisition: AcquisitionSettings,
    pub storage: StorageSettings,
    pub display: DisplaySettings,
    pub mock: MockSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Cycle timing plus the save switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    #[serde(flatten)]
    pub cycle: CycleConfig,
    pub save: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory receiving TIFF stacks and metadata.
    pub save_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Frames buffered for a slow display before the oldest are dropped.
    pub queue_capacity: usize,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

/// Simulated camera used by `run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSettings {
    pub camera_width: u32,
    pub camera_height: u32,
    pub frame_loss_rate: f64,
    pub seed: Option<u64>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            camera_width: 128,
            camera_height: 128,
            frame_loss_rate: 0.0,
            seed: None,
        }
    }
}

impl Provider for AppConfig {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("o2-daq defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

impl AppConfig {
    /// Defaults, then `path` (if given), then `O2DAQ_` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(AppConfig::default());
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("O2DAQ_").split("__"))
    }

    /// Extract and validate.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .extract()
            .context("Failed to extract configuration")?;
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    /// Load from the standard layers.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
        }
        Self::from_figment(Self::figment(path))
    }

    pub fn validate(&self) -> Result<()> {
        let level = self.application.log_level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            bail!(
                "Invalid log_level '{}', expected one of {:?}",
                self.application.log_level,
                LOG_LEVELS
            );
        }
        if self.display.queue_capacity == 0 {
            bail!("display.queue_capacity must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.mock.frame_loss_rate) {
            bail!("mock.frame_loss_rate must be within 0..=1");
        }
        if let Some(dir) = &self.storage.save_dir {
            if dir.exists() && !dir.is_dir() {
                bail!("storage.save_dir {} is not a directory", dir.display());
            }
        }
        self.acquisition
            .cycle
            .validate()
            .context("Invalid [acquisition] settings")?;
        Ok(())
    }

    /// Saving needs a directory; without one it is switched off.
    ///
    /// Returns the directory to save into, if saving stays enabled.
    pub fn resolve_saving(&mut self) -> Option<PathBuf> {
        if !self.acquisition.save {
            return None;
        }
        match &self.storage.save_dir {
            Some(dir) => Some(dir.clone()),
            None => {
                tracing::warn!("No save directory selected, saving disabled");
                self.acquisition.save = false;
                None
            }
        }
    }
}
