//! Error taxonomy of the synchronisation core.

use daq_core::error::{DaqError, DriverError, DriverErrorKind};
use thiserror::Error;

/// Result type alias for sync-core operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by waveform compilation, trigger sequencing and the
/// acquisition loop.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Compiler inputs cannot be represented on the hardware timeline.
    /// Caller error, never retried automatically.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A waveform is already live on the output device.
    #[error("Device '{device}' is busy: stop the live waveform first")]
    DeviceBusy { device: String },

    /// The output device or camera rejected an operation.
    #[error("Device '{device}' error: {message}")]
    DeviceError { device: String, message: String },

    /// No frame arrived within the wait window. Transient.
    #[error("No frame within {timeout_ms} ms")]
    FrameTimeout { timeout_ms: u64 },

    /// Unexpected failure inside one loop iteration. The loop keeps running.
    #[error("Acquisition loop fault: {message}")]
    LoopFault { message: String },

    /// The requested operation is not legal in the current acquisition state.
    #[error("Cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: String,
    },

    /// Handing the save buffer to persistence failed.
    #[error("Persistence failed: {message}")]
    Persistence { message: String },
}

impl SyncError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Wrap a collaborator error raised by `device`.
    ///
    /// A structured [`DriverErrorKind::Busy`] error anywhere in the chain is
    /// reported as [`SyncError::DeviceBusy`].
    pub fn from_device(device: &str, err: &anyhow::Error) -> Self {
        if let Some(driver) = DriverError::find_in(err) {
            if driver.kind == DriverErrorKind::Busy {
                return Self::DeviceBusy {
                    device: device.to_string(),
                };
            }
        }
        Self::DeviceError {
            device: device.to_string(),
            message: format!("{:#}", err),
        }
    }

    /// Whether the loop or caller may simply try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FrameTimeout { .. } | Self::LoopFault { .. })
    }
}

impl From<SyncError> for DaqError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidConfig { message } => DaqError::Configuration(message),
            SyncError::DeviceBusy { device } => DaqError::Driver(DriverError::new(
                device,
                DriverErrorKind::Busy,
                "a waveform is already live",
            )),
            SyncError::DeviceError { device, message } => {
                DaqError::Driver(DriverError::new(device, DriverErrorKind::Hardware, message))
            }
            SyncError::FrameTimeout { timeout_ms } => DaqError::Driver(DriverError::new(
                "camera",
                DriverErrorKind::Timeout,
                format!("no frame within {} ms", timeout_ms),
            )),
            SyncError::Persistence { message } => DaqError::Persistence(message),
            other => DaqError::Acquisition(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_driver_error_maps_to_device_busy() {
        let err = anyhow::Error::new(DriverError::new(
            "mock_digital_output",
            DriverErrorKind::Busy,
            "already playing",
        ))
        .context("configure failed");
        assert!(matches!(
            SyncError::from_device("do0", &err),
            SyncError::DeviceBusy { .. }
        ));
    }

    #[test]
    fn test_other_errors_map_to_device_error() {
        let err = anyhow::anyhow!("sample clock rejected");
        match SyncError::from_device("do0", &err) {
            SyncError::DeviceError { device, message } => {
                assert_eq!(device, "do0");
                assert!(message.contains("sample clock"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_into_daq_error() {
        let err: DaqError = SyncError::invalid_config("empty mode set").into();
        assert!(matches!(err, DaqError::Configuration(_)));

        let err: DaqError = SyncError::Persistence {
            message: "disk full".into(),
        }
        .into();
        assert!(matches!(err, DaqError::Persistence(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::FrameTimeout { timeout_ms: 10 }.is_transient());
        assert!(!SyncError::invalid_config("x").is_transient());
    }
}
