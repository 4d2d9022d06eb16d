//! # Backoff Calculation
//!
//! Exponential backoff capped at the policy's maximum delay, optionally
//! scaled by a random factor in [0.5, 1.0] to spread concurrent retriers.

use std::time::Duration;

use rand::Rng;

use crate::policy::RetryPolicy;

/// Lower bound of the jitter factor
pub const JITTER_MIN: f64 = 0.5;

/// Delay before retry number `attempt` (1-based), without jitter
pub fn base_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let initial_ms = policy.initial_delay.as_millis() as f64;
    let max_ms = policy.max_delay.as_millis() as f64;

    let raw_ms = initial_ms * policy.backoff_multiplier.powi(exponent);
    let capped_ms = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };

    Duration::from_millis(capped_ms.round() as u64)
}

/// Delay before retry number `attempt` (1-based)
pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    next_delay_with(attempt, policy, &mut rand::thread_rng())
}

/// Same as [`next_delay`] with a caller-supplied random source
pub fn next_delay_with<R: Rng + ?Sized>(attempt: u32, policy: &RetryPolicy, rng: &mut R) -> Duration {
    let base = base_delay(attempt, policy);
    if !policy.jitter {
        return base;
    }

    let factor = rng.gen_range(JITTER_MIN..=1.0);
    let jittered_ms = (base.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(jittered_ms)
}
