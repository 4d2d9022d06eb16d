//! # Retry Executor
//!
//! Runs a caller-supplied operation under a named policy: breaker admission
//! first, then attempts under a per-attempt timeout with classified,
//! backed-off retries, and finally a single outcome report to the breaker.
//! The breaker admission lives as long as the call future, so dropping the
//! future or unwinding out of the operation releases a half-open probe.
//!
//! The operation must be safe to invoke more than once; the executor does
//! not deduplicate side effects.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backoff;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier;
use crate::monitoring::{self, CallOutcome};
use crate::notify::{Notification, NotificationSink, RetryProgress, Severity, TracingSink};
use crate::policy::PolicyRegistry;
use crate::session::SessionTracker;
use crate::stats::{Outcome, StatisticsCollector};
use crate::types::{CallError, Error, Result};

/// Identity of one call, created fresh for every `execute`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    /// Stable destination identity, e.g. "POST /api/analyze-series"
    pub operation_id: String,
    /// Policy to run the call under
    pub policy_name: String,
    /// Optional human readable name for notifications
    pub label: Option<String>,
    /// Unique id of this call, for logs and session tracking
    pub call_id: Uuid,
}

impl OperationContext {
    pub fn new(operation_id: impl Into<String>, policy_name: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            policy_name: policy_name.into(),
            label: None,
            call_id: Uuid::new_v4(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label if set, otherwise the operation id
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.operation_id)
    }
}

/// Orchestrates retries for any number of concurrent calls
#[derive(Clone)]
pub struct RetryExecutor {
    policies: Arc<PolicyRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    stats: Arc<StatisticsCollector>,
    sessions: Arc<SessionTracker>,
    sink: Arc<dyn NotificationSink>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policies", &self.policies.names())
            .field("breakers", &self.breakers)
            .field("active", &self.sessions.active_count())
            .finish()
    }
}

impl RetryExecutor {
    /// Creates an executor over the given shared registries
    pub fn new(
        policies: Arc<PolicyRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        stats: Arc<StatisticsCollector>,
        sessions: Arc<SessionTracker>,
    ) -> Self {
        Self {
            policies,
            breakers,
            stats,
            sessions,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replaces the notification sink
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn stats(&self) -> &Arc<StatisticsCollector> {
        &self.stats
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Executes `operation` with retries under `context.policy_name`
    pub async fn execute<F, Fut, T>(&self, context: &OperationContext, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        self.execute_with_cancel(context, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`execute`](Self::execute), aborting the in-flight attempt or
    /// the pending backoff sleep once `cancel` fires
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        context: &OperationContext,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let span = info_span!(
            "resilient_call",
            operation_id = %context.operation_id,
            policy = %context.policy_name,
            call_id = %context.call_id,
        );
        self.run(context, cancel, operation).instrument(span).await
    }

    async fn run<F, Fut, T>(
        &self,
        context: &OperationContext,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let started = Instant::now();
        let operation_id = context.operation_id.as_str();
        let policy = self.policies.get(&context.policy_name);

        if cancel.is_cancelled() {
            return Err(self.cancelled(context, 0, started));
        }

        let settings = self.breakers.defaults().for_policy(&policy);
        let Some(admission) = self.breakers.admit_with(operation_id, settings) else {
            monitoring::record_outcome(operation_id, CallOutcome::Rejected, 0, started.elapsed());
            self.sink.notify(Notification::new(
                "Service unavailable",
                format!(
                    "{} is paused after repeated failures, try again later",
                    context.display_name()
                ),
                Severity::Error,
            ));
            return Err(Error::CircuitOpen {
                operation_id: operation_id.to_string(),
            });
        };

        let session = self.sessions.start(context.call_id, operation_id);
        let max_attempts = policy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            session.set_attempt(attempt);
            monitoring::record_attempt(operation_id, &context.policy_name);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(policy.timeout, operation()) => {
                    Some(result.unwrap_or(Err(CallError::Timeout(policy.timeout))))
                }
            };
            let Some(result) = result else {
                return Err(self.cancelled(context, attempt, started));
            };

            let error = match result {
                Ok(value) => {
                    self.breakers.settle(admission, true);
                    self.stats.record(operation_id, Outcome::Success, attempt);
                    monitoring::record_outcome(
                        operation_id,
                        CallOutcome::Success,
                        attempt,
                        started.elapsed(),
                    );

                    if attempt > 1 {
                        info!(
                            attempt = %attempt,
                            duration_ms = %started.elapsed().as_millis(),
                            "Operation succeeded after retries"
                        );
                        self.sink.notify(Notification::new(
                            "Recovered",
                            format!("{} succeeded on attempt {}", context.display_name(), attempt),
                            Severity::Success,
                        ));
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let class = classifier::classify(&error, &policy);
            if !class.is_retryable() || attempt >= max_attempts {
                self.breakers.settle(admission, false);
                self.stats.record(operation_id, Outcome::Failure, attempt);
                monitoring::record_outcome(
                    operation_id,
                    CallOutcome::Failure,
                    attempt,
                    started.elapsed(),
                );

                warn!(
                    attempt = %attempt,
                    max_attempts = %max_attempts,
                    class = %class,
                    duration_ms = %started.elapsed().as_millis(),
                    error = %error,
                    "Giving up"
                );
                self.sink.notify(
                    Notification::new(
                        "Request failed",
                        format!(
                            "{} failed after {} attempt(s): {}",
                            context.display_name(),
                            attempt,
                            error
                        ),
                        Severity::Error,
                    ),
                );

                let operation_id = operation_id.to_string();
                return Err(if class.is_retryable() {
                    Error::RetryExhausted {
                        operation_id,
                        attempts: attempt,
                        source: error,
                    }
                } else {
                    Error::Client {
                        operation_id,
                        attempts: attempt,
                        source: error,
                    }
                });
            }

            let delay = backoff::next_delay(attempt, &policy);
            let remaining_retries = max_attempts - attempt;
            debug!(
                attempt = %attempt,
                remaining = %remaining_retries,
                backoff_ms = %delay.as_millis(),
                class = %class,
                error = %error,
                "Retrying after error"
            );
            self.sink.notify(
                Notification::new(
                    "Retrying",
                    format!(
                        "{} failed (attempt {}), retrying in {} ms, {} retries left",
                        context.display_name(),
                        attempt,
                        delay.as_millis(),
                        remaining_retries
                    ),
                    Severity::Warning,
                )
                .with_progress(RetryProgress {
                    operation_id: operation_id.to_string(),
                    attempt,
                    remaining_retries,
                    delay,
                }),
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.cancelled(context, attempt, started));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// The admission, if any, is released when the caller's future unwinds
    fn cancelled(&self, context: &OperationContext, attempts: u32, started: Instant) -> Error {
        let operation_id = context.operation_id.as_str();
        self.stats.record(operation_id, Outcome::Cancelled, attempts);
        monitoring::record_outcome(operation_id, CallOutcome::Cancelled, attempts, started.elapsed());
        debug!(attempts = %attempts, "Operation cancelled by caller");

        Error::Cancelled {
            operation_id: operation_id.to_string(),
            attempts,
        }
    }
}
