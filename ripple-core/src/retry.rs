//! Retry Policies
//!
//! Three places in the crate retry transient failures:
//!
//! - the computed engine reprocesses a compute function that failed with a
//!   transient error,
//! - the RPC peer reconnects after a lost connection,
//! - the flow service re-reads a flow after a concurrent write.
//!
//! All of them go through the [`RetryPolicy`] trait, so tests can swap in a
//! deterministic policy. [`Backoff`] is the stock implementation: a bounded
//! number of attempts spaced by a [`RetryDelaySeq`].

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};
use crate::outcome::Outcome;

/// Decides whether and when to retry after a failure.
pub trait RetryPolicy: Send + Sync + Debug {
    /// Delay before the next attempt, or `None` to give up.
    ///
    /// `failed_attempts` counts the attempts that already failed, starting at 1.
    fn next_delay(&self, failed_attempts: u32, error: &Error) -> Option<Duration>;
}

/// A sequence of delays indexed by retry number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryDelaySeq {
    Fixed(Duration),
    Exponential {
        min: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl RetryDelaySeq {
    pub fn fixed(delay: Duration) -> Self {
        RetryDelaySeq::Fixed(delay)
    }

    /// Doubling delays clamped to `[min, max]`.
    pub fn exp(min: Duration, max: Duration) -> Self {
        RetryDelaySeq::Exponential {
            min,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            RetryDelaySeq::Fixed(delay) => *delay,
            RetryDelaySeq::Exponential {
                min,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(retry.min(63) as i32);
                let secs = min.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs).max(*min)
                }
            }
        }
    }
}

/// Bounded retries with a delay sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delays: RetryDelaySeq,
    /// Only retry errors classified as transient.
    pub transient_only: bool,
}

impl Backoff {
    pub fn new(max_attempts: u32, delays: RetryDelaySeq) -> Self {
        Self {
            max_attempts,
            delays,
            transient_only: true,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, RetryDelaySeq::fixed(Duration::ZERO))
    }

    /// Retries forever (used by reconnect loops).
    pub fn unbounded(delays: RetryDelaySeq) -> Self {
        Self::new(u32::MAX, delays)
    }
}

impl RetryPolicy for Backoff {
    fn next_delay(&self, failed_attempts: u32, error: &Error) -> Option<Duration> {
        if self.transient_only && !error.is_transient() {
            return None;
        }
        if failed_attempts >= self.max_attempts {
            return None;
        }
        Some(self.delays.delay(failed_attempts.saturating_sub(1)))
    }
}

/// Run `attempt` until it succeeds, the policy gives up, or `cancel` fires.
///
/// `attempt` receives the 0-based attempt number.
pub async fn retry<T, F, Fut>(
    policy: &dyn RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt: F,
) -> Outcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failed = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            result = attempt(failed) => result,
        };
        let error = match result {
            Ok(value) => return Outcome::Ok(value),
            Err(error) => error,
        };
        failed += 1;
        let Some(delay) = policy.next_delay(failed, &error) else {
            return Outcome::Err(error);
        };
        warn!(operation, attempt = failed, ?delay, error = %error, "retrying after failure");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
