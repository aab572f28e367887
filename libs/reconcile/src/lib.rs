//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge stored state to the state of external providers. Key concepts:
//!
//! - **Retry**: transient persistence failures are retried with bounded
//!   exponential backoff; everything else propagates at once.
//! - **Dirty checking**: a field is only written, and an event only emitted,
//!   when the computed value differs from the stored one.
//! - **Determinism**: derived numeric values are rounded to a fixed scale so
//!   repeated passes over unchanged input produce identical output.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

// =============================================================================
// Retry Policy
// =============================================================================

/// Errors that know whether re-running the failed unit of work can succeed.
pub trait Retryable {
    /// Returns true if the operation may succeed when retried.
    fn is_retryable(&self) -> bool;
}

/// Bounded exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Calculate the delay before retry number `attempt` (0-based).
    ///
    /// Jitter is applied below the cap, so the result never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let final_delay = (delay - rand_jitter(jitter_range)).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

fn rand_jitter(range: f64) -> f64 {
    if range <= 0.0 {
        return 0.0;
    }
    rand::rng().random_range(0.0..range)
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
///
/// Each attempt must be a complete unit of work: `op` is called afresh, so
/// anything it opened (a transaction, a snapshot) is re-opened on retry.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = policy.delay(attempt);
                debug!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(operation, attempts = attempt + 1, error = %e, "retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

// =============================================================================
// Dirty Checking
// =============================================================================

/// Assigns `value` to `slot` only if it differs.
///
/// Returns true if the slot changed.
pub fn set_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

// =============================================================================
// Deterministic Rounding
// =============================================================================

/// Scale used for derived coordinates.
pub const POSITION_SCALE: u32 = 6;

/// Rounds to `scale` decimal places, halves away from zero.
pub fn round_half_up(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    let rounded = (value * factor).round() / factor;
    // normalise -0.0 so equality and serialization stay stable
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Arithmetic mean rounded half-up to `scale`; `None` for an empty input.
pub fn mean_half_up<I>(values: I, scale: u32) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return None;
    }
    Some(round_half_up(sum / f64::from(count), scale))
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Default attempts for a retried unit of work.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
