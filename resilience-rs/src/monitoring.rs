//! Metrics emitted by the executor and the breaker registry.
//!
//! Everything goes through the `metrics` facade, so nothing is recorded
//! until the host installs a recorder, for example with
//! [`install_prometheus_recorder`].

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::circuit_breaker::CircuitState;
use crate::types::{Error, Result};

/// Final outcome of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    Cancelled,
    Rejected,
}

impl CallOutcome {
    fn as_str(self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Cancelled => "cancelled",
            CallOutcome::Rejected => "rejected",
        }
    }
}

/// Counts a single attempt against a destination
pub fn record_attempt(operation_id: &str, policy: &str) {
    counter!(
        "resilience_attempts_total",
        1,
        "operation_id" => operation_id.to_string(),
        "policy" => policy.to_string()
    );
}

/// Records how an `execute` call ended
pub fn record_outcome(operation_id: &str, outcome: CallOutcome, attempts: u32, duration: Duration) {
    counter!(
        "resilience_calls_total",
        1,
        "operation_id" => operation_id.to_string(),
        "outcome" => outcome.as_str()
    );
    histogram!(
        "resilience_call_duration_seconds",
        duration.as_secs_f64(),
        "operation_id" => operation_id.to_string()
    );
    histogram!(
        "resilience_call_attempts",
        attempts as f64,
        "operation_id" => operation_id.to_string()
    );
}

/// Counts a call rejected by an open circuit
pub fn record_rejection(operation_id: &str) {
    counter!(
        "resilience_circuit_rejections_total",
        1,
        "operation_id" => operation_id.to_string()
    );
}

/// Publishes the circuit state (0=closed, 1=open, 2=half-open)
pub fn record_circuit_state(operation_id: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!(
        "resilience_circuit_state",
        value,
        "operation_id" => operation_id.to_string()
    );
}

/// Publishes the number of calls currently retrying
pub fn record_active_sessions(count: usize) {
    gauge!("resilience_active_retries", count as f64);
}

/// Installs a Prometheus recorder as the global metrics recorder.
///
/// The returned handle renders the exposition format on demand.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::config(format!("failed to install Prometheus recorder: {}", e)))
}
