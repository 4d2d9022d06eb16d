//! # Error Classification
//!
//! Decides whether a failed attempt may be retried under a policy.
//! Connectivity and timeout checks come first because those failures
//! carry no status code.

use crate::policy::RetryPolicy;
use crate::types::{CallError, FailureClass};

/// Classifies a failed attempt. First match wins.
pub fn classify(error: &CallError, policy: &RetryPolicy) -> FailureClass {
    match error {
        CallError::Connectivity(_) | CallError::Timeout(_) => FailureClass::Transient,
        CallError::Status { code, .. } if policy.retryable_status_codes.contains(code) => {
            FailureClass::Server
        }
        CallError::Status { code, .. } if *code >= 500 => FailureClass::Server,
        _ => FailureClass::Client,
    }
}

/// Returns true if the failure may be retried under `policy`
pub fn is_retryable(error: &CallError, policy: &RetryPolicy) -> bool {
    classify(error, policy).is_retryable()
}
