//! # Circuit Breaker Registry
//!
//! One breaker per operation identifier, created on first use.
//!
//! - Closed: calls are admitted; consecutive failures are counted and the
//!   circuit opens once the threshold is reached.
//! - Open: calls are rejected until the reset timeout has elapsed since the
//!   last failure, then a single probe is admitted in half-open state.
//! - Half-Open: the probe's outcome decides. Success closes the circuit,
//!   a single failure reopens it. Outcomes of calls admitted earlier are
//!   ignored while a probe is pending.
//!
//! Admission hands out an [`Admission`] permit. Settling it with
//! [`CircuitBreakerRegistry::settle`] reports the outcome; dropping it
//! unsettled releases a held probe slot, so a cancelled, dropped or
//! panicked call never wedges a half-open circuit.
//!
//! The registry never returns errors; callers turn a denied admission into
//! whatever failure suits them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::entries::{lock, EntryMap, Evictable};
use crate::monitoring;
use crate::policy::RetryPolicy;

/// Default number of consecutive failures that opens a circuit
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cool-down before a half-open probe is allowed
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery with a single probe
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Thresholds for a single breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is admitted
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

impl BreakerSettings {
    /// Applies the policy-level overrides on top of these settings
    pub fn for_policy(&self, policy: &RetryPolicy) -> Self {
        Self {
            failure_threshold: policy.failure_threshold.unwrap_or(self.failure_threshold).max(1),
            reset_timeout: policy.reset_timeout.unwrap_or(self.reset_timeout),
        }
    }
}

/// Point-in-time view of a single breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    /// Monotonic time of the last failure, drives the reset timeout
    last_failure: Option<Instant>,
    /// Wall-clock time of the last failure, for reporting
    last_failure_at: Option<DateTime<Utc>>,
    settings: BreakerSettings,
    probe_in_flight: bool,
    /// Bumped whenever a probe is handed out, so stale permits can be told apart
    probe_generation: u64,
}

impl CircuitEntry {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            settings,
            probe_in_flight: false,
            probe_generation: 0,
        }
    }

    fn start_probe(&mut self) -> u64 {
        self.probe_in_flight = true;
        self.probe_generation = self.probe_generation.wrapping_add(1);
        self.probe_generation
    }

    fn holds_probe(&self, generation: u64) -> bool {
        self.state == CircuitState::HalfOpen
            && self.probe_in_flight
            && self.probe_generation == generation
    }

    fn mark_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.settings.failure_threshold,
            last_failure_at: self.last_failure_at,
        }
    }
}

impl Evictable for CircuitEntry {
    fn is_evictable(&self) -> bool {
        self.state == CircuitState::Closed
    }
}

/// Permission to run one call against a circuit.
///
/// Dropping the permit without settling it releases the half-open probe
/// slot it may hold, leaving the circuit state untouched.
#[must_use = "an unsettled admission reports nothing to the breaker"]
pub struct Admission {
    operation_id: String,
    entry: Arc<Mutex<CircuitEntry>>,
    /// Generation of the half-open probe this permit holds, if any
    probe: Option<u64>,
    settled: bool,
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("operation_id", &self.operation_id)
            .field("probe", &self.is_probe())
            .finish()
    }
}

impl Admission {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(generation) = self.probe {
            let mut circuit = lock(&self.entry);
            if circuit.holds_probe(generation) {
                circuit.probe_in_flight = false;
                debug!(circuit = %self.operation_id, "Half-open probe abandoned");
            }
        }
    }
}

/// Callback invoked on every state change with (operation, from, to)
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Owns one breaker per operation identifier
pub struct CircuitBreakerRegistry {
    defaults: BreakerSettings,
    circuits: EntryMap<CircuitEntry>,
    listener: RwLock<Option<StateChangeCallback>>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("defaults", &self.defaults)
            .field("circuits", &self.circuits.len())
            .finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default(), crate::config::DEFAULT_MAX_TRACKED_OPERATIONS)
    }
}

impl CircuitBreakerRegistry {
    /// Creates a registry tracking at most `max_entries` operations
    pub fn new(defaults: BreakerSettings, max_entries: usize) -> Self {
        Self {
            defaults,
            circuits: EntryMap::new(max_entries),
            listener: RwLock::new(None),
        }
    }

    /// Settings applied to breakers created without an explicit override
    pub fn defaults(&self) -> BreakerSettings {
        self.defaults
    }

    /// Sets a callback to be called on state changes
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Checks whether a call to `operation_id` may proceed
    pub fn admit(&self, operation_id: &str) -> Option<Admission> {
        self.admit_inner(operation_id, None)
    }

    /// Like [`admit`](Self::admit), first applying `settings` to the breaker
    pub fn admit_with(&self, operation_id: &str, settings: BreakerSettings) -> Option<Admission> {
        self.admit_inner(operation_id, Some(settings))
    }

    fn admit_inner(
        &self,
        operation_id: &str,
        settings: Option<BreakerSettings>,
    ) -> Option<Admission> {
        let entry = self.circuits.get_or_insert_with(operation_id, || {
            CircuitEntry::new(settings.unwrap_or(self.defaults))
        });

        let (admitted, probe, transition) = {
            let mut circuit = lock(&entry);
            if let Some(settings) = settings {
                circuit.settings = settings;
            }

            match circuit.state {
                CircuitState::Closed => (true, None, None),
                CircuitState::Open => {
                    let cooled_down = circuit
                        .last_failure
                        .map(|at| Instant::now().duration_since(at) > circuit.settings.reset_timeout)
                        .unwrap_or(true);

                    if cooled_down {
                        circuit.state = CircuitState::HalfOpen;
                        circuit.consecutive_failures = 0;
                        let generation = circuit.start_probe();
                        (
                            true,
                            Some(generation),
                            Some((CircuitState::Open, CircuitState::HalfOpen)),
                        )
                    } else {
                        (false, None, None)
                    }
                }
                CircuitState::HalfOpen => {
                    if circuit.probe_in_flight {
                        (false, None, None)
                    } else {
                        (true, Some(circuit.start_probe()), None)
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.transitioned(operation_id, from, to);
        }
        if !admitted {
            debug!(circuit = %operation_id, "Circuit open, request rejected");
            monitoring::record_rejection(operation_id);
            return None;
        }

        Some(Admission {
            operation_id: operation_id.to_string(),
            entry,
            probe,
            settled: false,
        })
    }

    /// Reports the outcome of an admitted call. In half-open state only the
    /// probe's outcome changes the circuit.
    pub fn settle(&self, mut admission: Admission, success: bool) {
        admission.settled = true;
        let transition = {
            let mut circuit = lock(&admission.entry);
            match admission.probe {
                Some(generation) if circuit.holds_probe(generation) => {
                    Self::probe_outcome(&mut circuit, success)
                }
                Some(_) => {
                    debug!(circuit = %admission.operation_id, "Outcome of a superseded probe ignored");
                    None
                }
                None => Self::outcome(&mut circuit, success),
            }
        };

        if let Some((from, to)) = transition {
            self.transitioned(&admission.operation_id, from, to);
        }
    }

    /// Records an outcome for `operation_id` without a permit. It counts
    /// while the circuit is closed and is ignored otherwise.
    pub fn report_outcome(&self, operation_id: &str, success: bool) {
        let entry = self
            .circuits
            .get_or_insert_with(operation_id, || CircuitEntry::new(self.defaults));

        let transition = Self::outcome(&mut lock(&entry), success);
        if let Some((from, to)) = transition {
            self.transitioned(operation_id, from, to);
        }
    }

    fn outcome(circuit: &mut CircuitEntry, success: bool) -> Option<(CircuitState, CircuitState)> {
        match (circuit.state, success) {
            (CircuitState::Closed, true) => {
                circuit.consecutive_failures = 0;
                None
            }
            (CircuitState::Closed, false) => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
                circuit.mark_failure();
                if circuit.consecutive_failures >= circuit.settings.failure_threshold {
                    circuit.state = CircuitState::Open;
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            // late outcome of a call admitted before the circuit opened
            (CircuitState::Open, _) | (CircuitState::HalfOpen, _) => None,
        }
    }

    fn probe_outcome(
        circuit: &mut CircuitEntry,
        success: bool,
    ) -> Option<(CircuitState, CircuitState)> {
        circuit.probe_in_flight = false;
        if success {
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
            Some((CircuitState::HalfOpen, CircuitState::Closed))
        } else {
            circuit.state = CircuitState::Open;
            circuit.consecutive_failures = 1;
            circuit.mark_failure();
            Some((CircuitState::HalfOpen, CircuitState::Open))
        }
    }

    /// Manually closes a circuit
    pub fn force_reset(&self, operation_id: &str) {
        let Some(entry) = self.circuits.get(operation_id) else {
            return;
        };

        let previous = {
            let mut circuit = lock(&entry);
            let previous = circuit.state;
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
            circuit.probe_in_flight = false;
            circuit.last_failure = None;
            circuit.last_failure_at = None;
            previous
        };

        info!(
            circuit = %operation_id,
            previous_state = %previous,
            "Circuit manually reset to CLOSED state"
        );
        if previous != CircuitState::Closed {
            self.transitioned(operation_id, previous, CircuitState::Closed);
        }
    }

    /// Current state of a circuit; unknown circuits are closed
    pub fn state(&self, operation_id: &str) -> CircuitState {
        self.circuits
            .get(operation_id)
            .map(|entry| lock(&entry).state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of every tracked circuit
    pub fn snapshot(&self) -> HashMap<String, CircuitSnapshot> {
        self.circuits.collect(CircuitEntry::snapshot)
    }

    /// Operation identifiers whose circuit is currently open, sorted
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuits
            .collect(|circuit| circuit.state)
            .into_iter()
            .filter(|(_, state)| *state == CircuitState::Open)
            .map(|(operation_id, _)| operation_id)
            .collect();
        open.sort();
        open
    }

    fn transitioned(&self, operation_id: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open if from == CircuitState::HalfOpen => {
                warn!(circuit = %operation_id, "Circuit REOPENED: Failed in half-open state")
            }
            CircuitState::Open => {
                warn!(circuit = %operation_id, "Circuit OPEN: Failure threshold exceeded")
            }
            CircuitState::HalfOpen => {
                info!(circuit = %operation_id, "Circuit HALF-OPEN: Testing service recovery")
            }
            CircuitState::Closed => {
                info!(circuit = %operation_id, "Circuit CLOSED: Service recovered")
            }
        }

        monitoring::record_circuit_state(operation_id, to);

        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = listener {
            callback(operation_id, from, to);
        }
    }
}
