//! Error injection framework for mock devices.
//!
//! Enables configurable failures for resilience testing. Injected errors are
//! [`DriverError`]s so callers see the same kinds real drivers report.

use super::rng::MockRng;
use daq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock devices.
///
/// Clones share scenario state, so a test can keep a handle and flip
/// communication loss or hardware faults while the device is in use.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches all operations
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Succeed `count` times, then fail every call
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
    /// Fail the first `count` calls, then succeed
    FailTimes {
        operation: &'static str,
        count: u32,
    },
    /// Report a timeout on every call
    Timeout { operation: &'static str },
    /// Report the device as busy on every call
    Busy { operation: &'static str },
    /// Every operation fails with a communication error
    CommunicationLoss,
    /// Every operation fails with the given hardware fault code
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// No injected errors.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures on every operation.
    pub fn random_failures(rate: f64) -> Self {
        Self::random_failures_seeded(rate, None)
    }

    /// Uniform random failures with a fixed seed.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// A single scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, evaluated in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Custom per-operation failure rates.
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        let state = ErrorState {
            communication_lost: scenarios
                .iter()
                .any(|s| matches!(s, ErrorScenario::CommunicationLoss)),
            hardware_fault_code: scenarios
                .iter()
                .find_map(|s| match s {
                    ErrorScenario::HardwareFault { code } => Some(*code),
                    _ => None,
                })
                .unwrap_or(0),
            ..ErrorState::default()
        };
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Check whether `operation` should fail.
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }
        if state.hardware_fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { operation: op, count } if *op == operation => {
                    let calls = state.operation_counts.entry(operation).or_insert(0);
                    *calls += 1;
                    if *calls > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure after {count} operations"),
                        ));
                    }
                }
                ErrorScenario::FailTimes { operation: op, count } if *op == operation => {
                    let calls = state.operation_counts.entry(operation).or_insert(0);
                    *calls += 1;
                    if *calls <= *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure {calls} of {count}"),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{operation}' timed out"),
                    ));
                }
                ErrorScenario::Busy { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Busy,
                        format!("Device busy during '{operation}'"),
                    ));
                }
                _ => {}
            }
        }
        drop(state);

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Unknown,
                format!("Random failure in '{operation}'"),
            ));
        }

        Ok(())
    }

    /// Simulate losing the link to the device.
    pub fn set_communication_lost(&self, lost: bool) {
        self.state.lock().communication_lost = lost;
    }

    /// Latch a hardware fault; `0` clears it.
    pub fn set_hardware_fault(&self, code: u32) {
        self.state.lock().hardware_fault_code = code;
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
