//! Health query surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::session::SessionTracker;
use crate::stats::{RetryStatistics, StatisticsCollector};

/// On-demand view of breakers, in-flight calls and statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// False iff at least one circuit is open
    pub healthy: bool,
    pub open_circuits: Vec<String>,
    pub active_retries: usize,
    pub stats: HashMap<String, RetryStatistics>,
    pub circuits: HashMap<String, CircuitSnapshot>,
}

impl HealthReport {
    pub fn collect(
        breakers: &CircuitBreakerRegistry,
        stats: &StatisticsCollector,
        sessions: &SessionTracker,
    ) -> Self {
        let open_circuits = breakers.open_circuits();
        Self {
            healthy: open_circuits.is_empty(),
            open_circuits,
            active_retries: sessions.active_count(),
            stats: stats.report(),
            circuits: breakers.snapshot(),
        }
    }
}
