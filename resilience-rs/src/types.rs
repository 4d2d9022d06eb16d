//! # Error Types
//!
//! Fatal error taxonomy returned by the retry executor, plus the
//! underlying call failures that operations report back to it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure reported by a single attempt of an operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Connectivity loss: offline network, connection reset or refused
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The executor's own per-attempt timeout fired
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The destination answered with a non-success status code
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// The request itself was malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Anything else, including programmer errors
    #[error("{0}")]
    Other(String),
}

impl CallError {
    /// Creates a connectivity error
    pub fn connectivity(message: impl Into<String>) -> Self {
        CallError::Connectivity(message.into())
    }

    /// Creates a status error with the given code
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        CallError::Status {
            code,
            message: message.into(),
        }
    }

    /// Creates an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        CallError::InvalidRequest(message.into())
    }

    /// Creates an uncategorised error
    pub fn other(message: impl Into<String>) -> Self {
        CallError::Other(message.into())
    }

    /// Returns the status code carried by the failure, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            CallError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => CallError::Connectivity(err.to_string()),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                CallError::InvalidRequest(err.to_string())
            }
            _ => CallError::Other(err.to_string()),
        }
    }
}

/// How a failed attempt is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Network loss or timeout, always retryable
    Transient,
    /// Server side fault or a whitelisted status code, retryable
    Server,
    /// Anything else, never retried
    Client,
}

impl FailureClass {
    /// Returns true if failures of this class may be retried
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureClass::Client)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Server => write!(f, "server"),
            FailureClass::Client => write!(f, "client"),
        }
    }
}

/// Fatal errors surfaced to callers of the executor
#[derive(Debug, Error)]
pub enum Error {
    /// The circuit for this destination is open; no attempt was made
    #[error("circuit open for '{operation_id}', call rejected")]
    CircuitOpen { operation_id: String },

    /// Every permitted attempt failed with a retryable error
    #[error("'{operation_id}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation_id: String,
        attempts: u32,
        #[source]
        source: CallError,
    },

    /// The failure is not retryable under the active policy
    #[error("'{operation_id}' failed with a non-retryable error on attempt {attempts}: {source}")]
    Client {
        operation_id: String,
        attempts: u32,
        #[source]
        source: CallError,
    },

    /// A call that opted out of retries failed on its only attempt
    #[error("'{operation_id}' failed without retry: {source}")]
    Unretried {
        operation_id: String,
        #[source]
        source: CallError,
    },

    /// The caller cancelled the operation
    #[error("'{operation_id}' cancelled after {attempts} attempts")]
    Cancelled { operation_id: String, attempts: u32 },

    /// Invalid configuration or policy override
    #[error("configuration error: {0}")]
    Config(String),

    /// Policy store I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Policy store (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Creates a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// The operation the error belongs to, if it came from the executor
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Error::CircuitOpen { operation_id }
            | Error::RetryExhausted { operation_id, .. }
            | Error::Client { operation_id, .. }
            | Error::Unretried { operation_id, .. }
            | Error::Cancelled { operation_id, .. } => Some(operation_id),
            _ => None,
        }
    }

    /// Number of attempts actually made before the error surfaced
    pub fn attempts(&self) -> u32 {
        match self {
            Error::RetryExhausted { attempts, .. }
            | Error::Client { attempts, .. }
            | Error::Cancelled { attempts, .. } => *attempts,
            Error::Unretried { .. } => 1,
            _ => 0,
        }
    }

    /// The last underlying call failure, if one was observed
    pub fn call_error(&self) -> Option<&CallError> {
        match self {
            Error::RetryExhausted { source, .. }
            | Error::Client { source, .. }
            | Error::Unretried { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Status code of the last underlying failure
    pub fn status_code(&self) -> Option<u16> {
        self.call_error().and_then(CallError::status_code)
    }

    /// Returns true if the caller cancelled the operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Returns true if the breaker rejected the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
