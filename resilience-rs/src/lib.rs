//! # Resilience
//!
//! Policy-driven retries and per-destination circuit breaking for outbound
//! calls of the media library dashboard.
//!
//! ## Features
//!
//! - Named retry policies with persisted overrides
//! - Failure classification and exponential backoff with jitter
//! - One circuit breaker per operation, bounded in number
//! - Cancellable retry executor with progress notifications
//! - Per-operation statistics and a health report
//! - An explicit HTTP decorator that routes calls to policies
//!
//! ```no_run
//! # async fn run() -> resilience::Result<()> {
//! use resilience::{CallRequest, ReqwestTransport, Resilience, ResilienceConfig};
//!
//! let resilience = Resilience::new(ResilienceConfig::default())?;
//! let client = resilience.client(ReqwestTransport::new()?);
//! let response = client
//!     .send(CallRequest::get("https://api.tvmaze.com/shows/1"))
//!     .await?;
//! println!("{} {}", response.status, resilience.health().healthy);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
mod entries;
pub mod executor;
pub mod health;
pub mod interceptor;
pub mod library;
pub mod logging;
pub mod monitoring;
pub mod notify;
pub mod policy;
pub mod session;
pub mod stats;
pub mod types;

#[cfg(test)]
mod tests;

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

// Re-export commonly used types
pub use circuit_breaker::{
    Admission, BreakerSettings, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use crate::config::ResilienceConfig;
pub use executor::{OperationContext, RetryExecutor};
pub use health::HealthReport;
pub use interceptor::{
    CallRequest, CallResponse, InterceptingClient, ReqwestTransport, RouteRule, RouteRules,
    Transport, TransportRequest,
};
pub use logging::{init_logging, LoggingConfig};
pub use notify::{
    ChannelSink, Notification, NotificationSink, NullSink, RetryProgress, Severity, TracingSink,
};
pub use policy::{PolicyOverride, PolicyRegistry, RetryPolicy};
pub use stats::{RetryStatistics, StatisticsCollector};
pub use types::{CallError, Error, FailureClass, Result};

use policy::JsonFilePolicyStore;
use session::SessionTracker;

/// Shared registries, the executor and the routing table
#[derive(Clone)]
pub struct Resilience {
    executor: RetryExecutor,
    routes: RouteRules,
}

impl fmt::Debug for Resilience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resilience")
            .field("executor", &self.executor)
            .field("routes", &self.routes.rules().len())
            .finish()
    }
}

impl Resilience {
    /// Builds everything from `config`, notifying through the log
    pub fn new(config: ResilienceConfig) -> Result<Self> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Builds everything from `config`, sending notifications to `sink`
    pub fn with_sink(config: ResilienceConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        config.validate()?;

        let policies = match &config.policy_overrides_path {
            Some(path) => PolicyRegistry::with_store(Arc::new(JsonFilePolicyStore::new(path))),
            None => PolicyRegistry::new(),
        };

        let breakers = CircuitBreakerRegistry::new(
            BreakerSettings::from(&config.breaker),
            config.max_tracked_operations,
        );
        let listener = Arc::clone(&sink);
        breakers.on_state_change(move |operation_id, from, to| {
            listener.notify(circuit_notification(operation_id, from, to));
        });

        let executor = RetryExecutor::new(
            Arc::new(policies),
            Arc::new(breakers),
            Arc::new(StatisticsCollector::new(config.max_tracked_operations)),
            Arc::new(SessionTracker::new()),
        )
        .with_sink(sink);

        Ok(Self {
            executor,
            routes: config.routes,
        })
    }

    /// Loads the configuration (see [`crate::config::load`]) and builds from it
    pub fn from_config_file(path: Option<&Path>) -> Result<Self> {
        Self::new(crate::config::load(path)?)
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub fn policies(&self) -> &PolicyRegistry {
        self.executor.policies()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        self.executor.breakers()
    }

    pub fn stats(&self) -> &StatisticsCollector {
        self.executor.stats()
    }

    pub fn routes(&self) -> &RouteRules {
        &self.routes
    }

    /// Runs `operation` under `context`, see [`RetryExecutor::execute`]
    pub async fn execute<F, Fut, T>(&self, context: &OperationContext, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        self.executor.execute(context, operation).await
    }

    /// Runs `operation` under `context` until `cancel` fires
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
        self.executor
            .execute_with_cancel(context, cancel, operation)
            .await
    }

    /// Wraps `transport` so its calls go through the executor
    pub fn client<T: Transport>(&self, transport: T) -> InterceptingClient<T> {
        InterceptingClient::new(transport, self.executor.clone()).with_routes(self.routes.clone())
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::collect(
            self.executor.breakers(),
            self.executor.stats(),
            self.executor.sessions(),
        )
    }

    /// In-flight calls with their current attempt
    pub fn active_retries(&self) -> Vec<session::ActiveRetrySession> {
        self.executor.sessions().active()
    }
}

fn circuit_notification(operation_id: &str, from: CircuitState, to: CircuitState) -> Notification {
    match to {
        CircuitState::Open => Notification::new(
            "Service paused",
            format!("{} keeps failing, calls are paused", operation_id),
            Severity::Warning,
        ),
        CircuitState::HalfOpen => Notification::new(
            "Testing service",
            format!("Probing {} after a pause", operation_id),
            Severity::Info,
        ),
        CircuitState::Closed => Notification::new(
            "Service recovered",
            format!("{} is available again ({} -> {})", operation_id, from, to),
            Severity::Success,
        ),
    }
}

/// Loads the configuration, initializes logging and builds a [`Resilience`]
pub fn init(config_path: Option<&Path>) -> Result<Resilience> {
    let config = crate::config::load(config_path)?;
    init_logging(Some(config.logging.clone()))?;
    Resilience::new(config)
}
