//! # Retry Statistics
//!
//! Per-operation counters for health reporting. Only ever accumulates and
//! is never consulted by the executor's control flow.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entries::{lock, EntryMap, Evictable};

/// Outcome of a finished `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
}

/// Running totals for one operation identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStatistics {
    /// Attempts made by successful and failed calls
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Calls cancelled by their caller, excluded from the averages
    pub cancelled_count: u64,
    pub last_updated_at: DateTime<Utc>,
}

impl RetryStatistics {
    fn new() -> Self {
        Self {
            total_attempts: 0,
            success_count: 0,
            failure_count: 0,
            cancelled_count: 0,
            last_updated_at: Utc::now(),
        }
    }

    /// Average attempts per completed call
    pub fn average_attempts(&self) -> f64 {
        let completed = self.success_count + self.failure_count;
        if completed == 0 {
            0.0
        } else {
            self.total_attempts as f64 / completed as f64
        }
    }
}

impl Evictable for RetryStatistics {}

/// Collects [`RetryStatistics`] per operation identifier
#[derive(Debug)]
pub struct StatisticsCollector {
    entries: EntryMap<RetryStatistics>,
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_TRACKED_OPERATIONS)
    }
}

impl StatisticsCollector {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: EntryMap::new(max_entries),
        }
    }

    /// Adds one finished call to the totals of `operation_id`
    pub fn record(&self, operation_id: &str, outcome: Outcome, attempts: u32) {
        let entry = self
            .entries
            .get_or_insert_with(operation_id, RetryStatistics::new);
        let mut stats = lock(&entry);

        match outcome {
            Outcome::Success => {
                stats.success_count += 1;
                stats.total_attempts += u64::from(attempts);
            }
            Outcome::Failure => {
                stats.failure_count += 1;
                stats.total_attempts += u64::from(attempts);
            }
            Outcome::Cancelled => stats.cancelled_count += 1,
        }
        stats.last_updated_at = Utc::now();
    }

    /// Totals for a single operation
    pub fn get(&self, operation_id: &str) -> Option<RetryStatistics> {
        self.entries.get(operation_id).map(|entry| lock(&entry).clone())
    }

    /// Totals for every tracked operation
    pub fn report(&self) -> HashMap<String, RetryStatistics> {
        self.entries.collect(RetryStatistics::clone)
    }
}
