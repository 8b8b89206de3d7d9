//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by every crate
//! in the workspace, together with the structured [`DriverError`] that hardware
//! collaborators (digital-output cards, cameras) raise.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: semantically invalid settings (empty mode set,
//!   non-positive cycle frequency, negative exposure).
//! - **`Driver`**: a categorised hardware failure, see [`DriverErrorKind`].
//! - **`Acquisition`**: a failure of the running acquisition (start rollback,
//!   illegal state transition, loop shutdown).
//! - **`Persistence`**: the save hand-off at the end of a run failed.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types
//! with the `?` operator.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a hardware collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be opened or initialised.
    Initialization,
    /// Device rejected a configuration (sample rate, buffer size).
    Configuration,
    /// Transport to the device failed.
    Communication,
    /// Device failed to stop or release cleanly.
    Shutdown,
    /// Device reported a fault.
    Hardware,
    /// Operation did not complete in time.
    Timeout,
    /// Device is owned by another task or session.
    Busy,
    /// Argument outside the range the device accepts.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured error raised by a hardware collaborator.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Short identifier of the driver, e.g. `mock_digital_output`.
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Find a [`DriverError`] anywhere in an `anyhow` error chain.
    ///
    /// Collaborator traits return `anyhow::Result`, so the sync core uses this
    /// to recover the structured kind (for example [`DriverErrorKind::Busy`]).
    pub fn find_in(err: &anyhow::Error) -> Option<&DriverError> {
        err.chain().find_map(|cause| cause.downcast_ref::<DriverError>())
    }
}

/// Primary error type for the DAQ application.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Configuration`
///    - Raised before any hardware is touched
///    - Recovery: fix the requested timing and retry
///
/// 2. **Hardware Errors** - `Driver`
///    - Raised by the digital-output device or the camera
///    - Recovery: stop, check the hardware, reset the session
///
/// 3. **Runtime Errors** - `Acquisition`, `Persistence`
///    - Raised while a run is in progress or being flushed to disk
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Occurs when values parse correctly but cannot be represented by the
    /// hardware timeline (e.g. negative exposure, zero cycle frequency).
    ///
    /// # Example
    ///
    /// ```rust
    /// use daq_core::error::DaqError;
    ///
    /// fn validate_exposure(exposure_ms: i64) -> Result<(), DaqError> {
    ///     if exposure_ms < 0 {
    ///         return Err(DaqError::Configuration(
    ///             "exposure must not be negative".into()
    ///         ));
    ///     }
    ///     Ok(())
    /// }
    /// assert!(validate_exposure(-1).is_err());
    /// ```
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(#[from] DriverError),

    /// The acquisition could not be started, stopped or continued.
    #[error("Acquisition error: {0}")]
    Acquisition(String),

    /// Saving the acquired frames failed.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display_includes_kind() {
        let err = DriverError::new("mock_digital_output", DriverErrorKind::Busy, "playing");
        assert_eq!(
            err.to_string(),
            "Driver 'mock_digital_output' busy error: playing"
        );
    }

    #[test]
    fn find_in_walks_context_chain() {
        let err = anyhow::Error::new(DriverError::new(
            "mock_camera",
            DriverErrorKind::Timeout,
            "no frame",
        ))
        .context("waiting for frame");

        let found = DriverError::find_in(&err).unwrap();
        assert_eq!(found.kind, DriverErrorKind::Timeout);

        let plain = anyhow::anyhow!("not a driver error");
        assert!(DriverError::find_in(&plain).is_none());
    }

    #[test]
    fn driver_error_converts_to_daq_error() {
        let err: DaqError =
            DriverError::new("x", DriverErrorKind::Hardware, "fault").into();
        assert!(matches!(err, DaqError::Driver(_)));
    }
}
