//! # Configuration
//!
//! Layered configuration: built-in defaults, an optional file (any format
//! the `config` crate understands), then `RESILIENCE_*` environment
//! variables. Nested keys use `__`, e.g. `RESILIENCE_BREAKER__FAILURE_THRESHOLD`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit_breaker::{BreakerSettings, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT};
use crate::interceptor::{RouteRule, RouteRules};
use crate::logging::LoggingConfig;
use crate::policy::duration_ms;
use crate::types::{Error, Result};

/// Upper bound on per-operation breaker and statistics entries
pub const DEFAULT_MAX_TRACKED_OPERATIONS: usize = 1024;

/// Prefix of the environment variables read by [`load`]
pub const ENV_PREFIX: &str = "RESILIENCE";

/// Base name of the optional config file looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "resilience";

/// Global circuit breaker defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_ms", rename = "reset_timeout_ms")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        BreakerSettings {
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout,
        }
    }
}

/// Everything needed to assemble a [`Resilience`](crate::Resilience)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    /// Bound for per-operation breaker and statistics state
    pub max_tracked_operations: usize,
    /// JSON file holding persisted policy overrides
    pub policy_overrides_path: Option<PathBuf>,
    pub routes: RouteRules,
    pub logging: LoggingConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            max_tracked_operations: DEFAULT_MAX_TRACKED_OPERATIONS,
            policy_overrides_path: None,
            routes: RouteRules::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Rejects values the registries cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(Error::config("breaker.failure_threshold must be at least 1"));
        }
        if self.max_tracked_operations == 0 {
            return Err(Error::config("max_tracked_operations must be at least 1"));
        }
        Ok(())
    }
}

/// Reads an optional key. A missing key is `None`; a key that cannot be
/// read as `T` is an error.
pub(crate) fn get_optional<T: DeserializeOwned>(
    cfg: &Config,
    key: &str,
) -> std::result::Result<Option<T>, ConfigError> {
    match cfg.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl TryFrom<Config> for ResilienceConfig {
    type Error = ConfigError;

    fn try_from(cfg: Config) -> std::result::Result<Self, Self::Error> {
        let mut base = ResilienceConfig::default();

        if let Some(threshold) = get_optional::<u32>(&cfg, "breaker.failure_threshold")? {
            base.breaker.failure_threshold = threshold;
        }
        if let Some(reset_ms) = get_optional::<u64>(&cfg, "breaker.reset_timeout_ms")? {
            base.breaker.reset_timeout = Duration::from_millis(reset_ms);
        }
        if let Some(max) = get_optional::<usize>(&cfg, "max_tracked_operations")? {
            base.max_tracked_operations = max;
        }
        if let Some(path) = get_optional::<String>(&cfg, "policy_overrides_path")? {
            base.policy_overrides_path = Some(PathBuf::from(path));
        }
        if let Some(rules) = get_optional::<Vec<RouteRule>>(&cfg, "routes")? {
            base.routes = RouteRules::new(rules);
        }
        base.logging = LoggingConfig::try_from(cfg)?;

        Ok(base)
    }
}

/// Loads the configuration from `path` (required if given), or from an
/// optional `resilience.*` file in the working directory, then applies
/// environment overrides. A `.env` file is honoured if present.
pub fn load(path: Option<&Path>) -> Result<ResilienceConfig> {
    dotenv::dotenv().ok();

    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let cfg = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = ResilienceConfig::try_from(cfg)?;
    config.validate()?;

    debug!(
        failure_threshold = %config.breaker.failure_threshold,
        reset_timeout_ms = %config.breaker.reset_timeout.as_millis(),
        routes = %config.routes.rules().len(),
        "Loaded resilience configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ResilienceConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(60));
        assert_eq!(config.max_tracked_operations, 1024);
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
max_tracked_operations = 16
policy_overrides_path = "/tmp/policies.json"

[breaker]
failure_threshold = 3
reset_timeout_ms = 500

[[routes]]
pattern = "example.org"
policy = "database"

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.reset_timeout, Duration::from_millis(500));
        assert_eq!(config.max_tracked_operations, 16);
        assert_eq!(
            config.policy_overrides_path,
            Some(PathBuf::from("/tmp/policies.json"))
        );
        assert_eq!(config.routes.policy_for("https://example.org/x"), "database");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let cfg = Config::builder()
            .set_override("breaker.failure_threshold", 0)
            .unwrap()
            .build()
            .unwrap();

        let config = ResilienceConfig::try_from(cfg).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_wrong_typed_keys_rejected() {
        for (key, value) in [
            ("breaker.failure_threshold", "abc"),
            ("breaker.reset_timeout_ms", "soon"),
            ("max_tracked_operations", "lots"),
            ("logging.json_format", "maybe"),
        ] {
            let cfg = Config::builder()
                .set_override(key, value)
                .unwrap()
                .build()
                .unwrap();

            let result = ResilienceConfig::try_from(cfg);
            assert!(result.is_err(), "{} = {:?} should be rejected", key, value);
        }
    }

    #[test]
    fn test_wrong_typed_file_value_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[breaker]\nfailure_threshold = \"abc\"").unwrap();

        let result = load(Some(file.path()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_required_file() {
        let result = load(Some(Path::new("/nonexistent/resilience.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
