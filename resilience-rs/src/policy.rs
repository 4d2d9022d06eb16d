//! # Retry Policies
//!
//! Named retry policies, the builder that validates them, and the registry
//! that serves them to the executor. Overrides are merged on top of the
//! built-in defaults and persisted through a [`PolicyStore`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Error, Result};

/// Name of the policy used when an unknown name is requested
pub const DEFAULT_POLICY: &str = "api";

/// Policy for external metadata providers
pub const API_POLICY: &str = "api";

/// Policy for generic outbound calls
pub const NETWORK_POLICY: &str = "network";

/// Policy for local load and scan endpoints
pub const DATABASE_POLICY: &str = "database";

/// Durations are persisted as whole milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// An immutable bundle of retry parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays, at least 1
    pub backoff_multiplier: f64,

    /// Scale each delay by a random factor in [0.5, 1.0]
    pub jitter: bool,

    /// Timeout applied to every single attempt
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Status codes that are always retried
    pub retryable_status_codes: BTreeSet<u16>,

    /// Breaker threshold override for destinations using this policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    /// Breaker cool-down override for destinations using this policy
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_ms::option"
    )]
    pub reset_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Built-in policy for external metadata providers
    pub fn api() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: true,
            timeout: Duration::from_millis(30_000),
            retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            failure_threshold: None,
            reset_timeout: None,
        }
    }

    /// Built-in policy for generic calls
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 1.5,
            jitter: true,
            timeout: Duration::from_millis(15_000),
            retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            failure_threshold: None,
            reset_timeout: None,
        }
    }

    /// Built-in policy for the local load and scan endpoints
    pub fn database() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(8000),
            backoff_multiplier: 2.0,
            jitter: false,
            timeout: Duration::from_millis(60_000),
            retryable_status_codes: [500, 503].into_iter().collect(),
            failure_threshold: None,
            reset_timeout: None,
        }
    }

    /// Starts a builder seeded with this policy
    pub fn builder(&self) -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: self.clone(),
        }
    }

    /// Total number of attempts this policy permits
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Checks the policy invariants
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config(format!(
                "backoffMultiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::config(format!(
                "initialDelay ({:?}) exceeds maxDelay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("timeout must be greater than zero"));
        }
        if let Some(code) = self
            .retryable_status_codes
            .iter()
            .find(|code| !(100..=599).contains(*code))
        {
            return Err(Error::config(format!("invalid status code {}", code)));
        }
        if self.failure_threshold == Some(0) {
            return Err(Error::config("failureThreshold must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::api()
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy(max_retries={}, delay={:?}..{:?}, x{}, jitter={}, timeout={:?})",
            self.max_retries,
            self.initial_delay,
            self.max_delay,
            self.backoff_multiplier,
            self.jitter,
            self.timeout
        )
    }
}

/// Builder that validates a policy before handing it out
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = timeout;
        self
    }

    pub fn retryable_status_codes<I: IntoIterator<Item = u16>>(mut self, codes: I) -> Self {
        self.policy.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.policy.failure_threshold = Some(threshold);
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.policy.reset_timeout = Some(timeout);
        self
    }

    /// Validates and returns the policy
    pub fn build(self) -> Result<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// A partial policy; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_ms::option"
    )]
    pub initial_delay: Option<Duration>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_ms::option"
    )]
    pub max_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_ms::option"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_status_codes: Option<BTreeSet<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_ms::option"
    )]
    pub reset_timeout: Option<Duration>,
}

impl PolicyOverride {
    /// Returns true if the override sets no field
    pub fn is_empty(&self) -> bool {
        self == &PolicyOverride::default()
    }

    /// Applies the set fields on top of `base` and validates the result
    pub fn apply(&self, base: &RetryPolicy) -> Result<RetryPolicy> {
        let mut builder = base.builder();
        if let Some(value) = self.max_retries {
            builder = builder.max_retries(value);
        }
        if let Some(value) = self.initial_delay {
            builder = builder.initial_delay(value);
        }
        if let Some(value) = self.max_delay {
            builder = builder.max_delay(value);
        }
        if let Some(value) = self.backoff_multiplier {
            builder = builder.backoff_multiplier(value);
        }
        if let Some(value) = self.jitter {
            builder = builder.jitter(value);
        }
        if let Some(value) = self.timeout {
            builder = builder.timeout(value);
        }
        if let Some(value) = &self.retryable_status_codes {
            builder = builder.retryable_status_codes(value.iter().copied());
        }
        if let Some(value) = self.failure_threshold {
            builder = builder.failure_threshold(value);
        }
        if let Some(value) = self.reset_timeout {
            builder = builder.reset_timeout(value);
        }
        builder.build()
    }

    /// Layers `newer` on top of this override; fields set in `newer` win
    pub fn merge(&self, newer: &PolicyOverride) -> PolicyOverride {
        PolicyOverride {
            max_retries: newer.max_retries.or(self.max_retries),
            initial_delay: newer.initial_delay.or(self.initial_delay),
            max_delay: newer.max_delay.or(self.max_delay),
            backoff_multiplier: newer.backoff_multiplier.or(self.backoff_multiplier),
            jitter: newer.jitter.or(self.jitter),
            timeout: newer.timeout.or(self.timeout),
            retryable_status_codes: newer
                .retryable_status_codes
                .clone()
                .or_else(|| self.retryable_status_codes.clone()),
            failure_threshold: newer.failure_threshold.or(self.failure_threshold),
            reset_timeout: newer.reset_timeout.or(self.reset_timeout),
        }
    }
}

/// Persistence for policy overrides, keyed by policy name
pub trait PolicyStore: Send + Sync + fmt::Debug {
    /// Reads every stored override
    fn load(&self) -> Result<HashMap<String, PolicyOverride>>;

    /// Replaces the stored overrides
    fn save(&self, overrides: &HashMap<String, PolicyOverride>) -> Result<()>;
}

/// Stores overrides as a JSON object in a file
#[derive(Debug, Clone)]
pub struct JsonFilePolicyStore {
    path: PathBuf,
}

impl JsonFilePolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PolicyStore for JsonFilePolicyStore {
    fn load(&self) -> Result<HashMap<String, PolicyOverride>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let document: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;

        let mut overrides = HashMap::with_capacity(document.len());
        for (name, value) in document {
            match serde_json::from_value::<PolicyOverride>(value) {
                Ok(parsed) => {
                    overrides.insert(name, parsed);
                }
                Err(e) => {
                    warn!(
                        policy = %name,
                        path = %self.path.display(),
                        error = %e,
                        "Ignoring malformed policy override"
                    );
                }
            }
        }
        Ok(overrides)
    }

    fn save(&self, overrides: &HashMap<String, PolicyOverride>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(overrides)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Keeps overrides in memory
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    overrides: Mutex<HashMap<String, PolicyOverride>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store, as if the overrides had been persisted earlier
    pub fn with_overrides(overrides: HashMap<String, PolicyOverride>) -> Self {
        Self {
            overrides: Mutex::new(overrides),
        }
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn load(&self) -> Result<HashMap<String, PolicyOverride>> {
        Ok(self
            .overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, overrides: &HashMap<String, PolicyOverride>) -> Result<()> {
        *self.overrides.lock().unwrap_or_else(PoisonError::into_inner) = overrides.clone();
        Ok(())
    }
}

fn builtin_policies() -> HashMap<String, Arc<RetryPolicy>> {
    HashMap::from([
        (API_POLICY.to_string(), Arc::new(RetryPolicy::api())),
        (NETWORK_POLICY.to_string(), Arc::new(RetryPolicy::network())),
        (DATABASE_POLICY.to_string(), Arc::new(RetryPolicy::database())),
    ])
}

/// Registry of named policies
#[derive(Debug)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<RetryPolicy>>>,
    overrides: Mutex<HashMap<String, PolicyOverride>>,
    store: Option<Arc<dyn PolicyStore>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    /// Creates a registry holding only the built-in policies
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(builtin_policies()),
            overrides: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Creates a registry and merges the overrides persisted in `store`
    pub fn with_store(store: Arc<dyn PolicyStore>) -> Self {
        let registry = Self {
            policies: RwLock::new(builtin_policies()),
            overrides: Mutex::new(HashMap::new()),
            store: Some(Arc::clone(&store)),
        };

        match store.load() {
            Ok(persisted) => {
                let mut policies = registry.write_policies();
                let mut overrides = registry.lock_overrides();

                for (name, partial) in persisted {
                    let Some(base) = policies.get(&name).cloned() else {
                        warn!(policy = %name, "Ignoring override for unknown policy");
                        continue;
                    };
                    match partial.apply(&base) {
                        Ok(policy) => {
                            debug!(policy = %name, "Loaded persisted policy override");
                            policies.insert(name.clone(), Arc::new(policy));
                            overrides.insert(name, partial);
                        }
                        Err(e) => {
                            warn!(policy = %name, error = %e, "Ignoring invalid persisted override");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to load policy overrides, using defaults");
            }
        }

        registry
    }

    fn read_policies(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<RetryPolicy>>> {
        self.policies.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_policies(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<RetryPolicy>>> {
        self.policies.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_overrides(&self) -> std::sync::MutexGuard<'_, HashMap<String, PolicyOverride>> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the named policy, or the default policy if the name is unknown
    pub fn get(&self, name: &str) -> Arc<RetryPolicy> {
        let policies = self.read_policies();
        if let Some(policy) = policies.get(name) {
            return Arc::clone(policy);
        }

        debug!(policy = %name, fallback = DEFAULT_POLICY, "Unknown policy, using default");
        policies
            .get(DEFAULT_POLICY)
            .cloned()
            .unwrap_or_else(|| Arc::new(RetryPolicy::api()))
    }

    /// Returns true if a policy with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.read_policies().contains_key(name)
    }

    /// Names of all known policies, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_policies().keys().cloned().collect();
        names.sort();
        names
    }

    /// Merges `partial` into an existing policy.
    ///
    /// Returns false, keeping the previous policy, if the policy is unknown
    /// or the merged result is invalid. The overrides lock is held while
    /// persisting, so the store always ends with the latest snapshot.
    pub fn update(&self, name: &str, partial: PolicyOverride) -> bool {
        let overrides = {
            let mut policies = self.write_policies();
            let Some(current) = policies.get(name).cloned() else {
                warn!(policy = %name, "Cannot update unknown policy");
                return false;
            };

            let merged = match partial.apply(&current) {
                Ok(policy) => policy,
                Err(e) => {
                    warn!(policy = %name, error = %e, "Rejected policy override, keeping previous policy");
                    return false;
                }
            };
            policies.insert(name.to_string(), Arc::new(merged));

            let mut overrides = self.lock_overrides();
            let accumulated = overrides
                .get(name)
                .map(|existing| existing.merge(&partial))
                .unwrap_or(partial);
            overrides.insert(name.to_string(), accumulated);
            overrides
        };

        info!(policy = %name, "Policy updated");
        self.persist(&overrides);
        true
    }

    /// Restores the built-in policies and drops every override
    pub fn reset(&self) {
        let overrides = {
            let mut policies = self.write_policies();
            *policies = builtin_policies();
            let mut overrides = self.lock_overrides();
            overrides.clear();
            overrides
        };

        info!("Policies reset to defaults");
        self.persist(&overrides);
    }

    /// Currently active overrides, keyed by policy name
    pub fn overrides(&self) -> HashMap<String, PolicyOverride> {
        self.lock_overrides().clone()
    }

    fn persist(&self, overrides: &HashMap<String, PolicyOverride>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(overrides) {
                warn!(error = %e, "Failed to persist policy overrides");
            }
        }
    }
}
