//! Bounded retry for optimistic-concurrency losses.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::debug;

use crate::ApplyError;

/// Attempt budget and backoff for conflict retries. `steps` counts attempts, not retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub steps: u32,
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { steps: 5, base: Duration::from_millis(10), factor: 1.0, cap: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Read `TETHER_RETRY_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
        }
        let d = Self::default();
        Self {
            steps: var::<u32>("TETHER_RETRY_STEPS").filter(|n| *n > 0).unwrap_or(d.steps),
            base: var::<u64>("TETHER_RETRY_BASE_MS").map(Duration::from_millis).unwrap_or(d.base),
            factor: var::<f64>("TETHER_RETRY_FACTOR").filter(|f| f.is_finite() && *f >= 1.0).unwrap_or(d.factor),
            cap: var::<u64>("TETHER_RETRY_CAP_MS").map(Duration::from_millis).unwrap_or(d.cap),
        }
    }

    /// A policy that never waits; for tests and dry runs.
    pub fn immediate(steps: u32) -> Self {
        Self { steps, base: Duration::ZERO, factor: 1.0, cap: Duration::ZERO }
    }

    /// Sleep before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let scale = self.factor.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let nanos = (self.base.as_nanos() as f64 * scale).round();
        if !nanos.is_finite() || nanos >= self.cap.as_nanos() as f64 {
            return self.cap;
        }
        Duration::from_nanos(nanos as u64)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the attempt budget runs out.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ApplyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplyError>>,
{
    let steps = policy.steps.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Err(ApplyError::Store(e)) if e.is_retryable() => {
                if attempt >= steps {
                    return Err(ApplyError::RetriesExhausted { attempts: attempt, last: e });
                }
                counter!("apply_conflict_retries_total", 1u64);
                debug!(attempt, error = %e, "lost write race; retrying");
                tokio::time::sleep(policy.delay(attempt - 1)).await;
            }
            other => return other,
        }
    }
}
