//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. Every executor call already
//! runs inside a `resilient_call` span carrying `operation_id`, `policy`
//! and `call_id`, so the JSON layer includes them on each event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::config::get_optional;
use crate::types::{Error, Result};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// flushes the file writer on shutdown, must outlive the subscriber
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// Name used for the log file
    pub service_name: String,
    /// Whether to also write logs to a daily rotated file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to include file and line of the call site
    pub include_source_code: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "resilience".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
            include_source_code: false,
        }
    }
}

/// Initializes the structured logging system.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let subscriber = Registry::default().with(filter);

    let (json_layer, text_layer) = if config.json_format {
        let layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code);
        (Some(layer), None)
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code);
        (None, Some(layer))
    };
    let subscriber = subscriber.with(json_layer).with(text_layer);

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let file_appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = NonBlocking::new(file_appender);
            let _ = FILE_GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        _ => None,
    };
    let subscriber = subscriber.with(file_layer);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(Error::config(format!("Failed to set global subscriber: {}", e)));
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = LoggingConfig::default();

        if let Some(level) = get_optional::<String>(&cfg, "logging.level")? {
            base.level = level;
        }
        if let Some(service_name) = get_optional::<String>(&cfg, "logging.service_name")? {
            base.service_name = service_name;
        }
        if let Some(file_output) = get_optional::<bool>(&cfg, "logging.file_output")? {
            base.file_output = file_output;
        }
        if let Some(log_dir) = get_optional::<String>(&cfg, "logging.log_dir")? {
            base.log_dir = Some(log_dir);
        }
        if let Some(json_format) = get_optional::<bool>(&cfg, "logging.json_format")? {
            base.json_format = json_format;
        }
        if let Some(include_source_code) =
            get_optional::<bool>(&cfg, "logging.include_source_code")?
        {
            base.include_source_code = include_source_code;
        }

        Ok(base)
    }
}
