//! Retry policy for the network-bound pipeline stages.
//!
//! Exponential backoff with jitter, bounded attempts, and cooperative
//! cancellation: the token is checked before every attempt and selected
//! against while sleeping between attempts, so a cancelled workflow never
//! issues another request.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, WorkflowError};

/// Shared, immutable retry configuration. Not a per-session entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 1 initial + 3 retries).
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per retry.
    pub multiplier: f64,
    /// Jitter fraction applied to each delay, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Whether a failure of this kind is worth reattempting.
    ///
    /// Environment and data problems are not: retrying cannot fix a missing
    /// permission, a rejected credential, or an oversized prompt.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::RateLimitExceeded
                | ErrorKind::ServerError
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
        )
    }

    /// Delay to sleep after `failed_attempt` (1-based) before the next try.
    ///
    /// A server-provided `Retry-After` hint acts as a floor on the computed
    /// backoff, never a ceiling.
    pub fn delay_after(&self, failed_attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let backoff_ms =
            self.base_delay_ms as f64 * self.multiplier.powi(exponent.min(16) as i32);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered_ms = if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            backoff_ms * factor
        } else {
            backoff_ms
        };

        let delay = Duration::from_millis(jittered_ms.round().max(0.0) as u64);
        match hint {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

/// A value plus the number of attempts it took to obtain it.
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` under the policy. `op` receives the 1-based attempt number.
///
/// Returns the first success tagged with its attempt count, or the last
/// error tagged with the total attempts made. Cancellation wins over any
/// pending retry.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<Attempted<T>, WorkflowError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, WorkflowError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(WorkflowError::cancelled().with_attempts(attempt));
        }
        attempt += 1;

        match op(attempt).await {
            Ok(value) => return Ok(Attempted { value, attempts: attempt }),
            Err(err) if err.is_cancelled() => return Err(err.with_attempts(attempt)),
            Err(err) => {
                if attempt >= max_attempts || !policy.is_retryable(err.kind) {
                    return Err(err.with_attempts(attempt));
                }

                let delay = policy.delay_after(attempt, err.retry_after);
                log::debug!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    max_attempts,
                    err.kind.as_str(),
                    delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(WorkflowError::cancelled().with_attempts(attempt));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
