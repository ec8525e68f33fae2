// =============================================================================
// Retry Policy — bounded retry with a fixed delay around exchange calls
// =============================================================================
//
// Transient failures are logged and retried after `delay`. Non-transient
// failures return immediately. When every attempt fails the caller receives
// `ExchangeError::RetriesExhausted` carrying the last underlying error.
// =============================================================================

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::exchange::{ExchangeError, ExchangeResult};

/// Default number of attempts per call.
pub const DEFAULT_RETRIES: u32 = 10;

/// Default pause between attempts (milliseconds).
pub const DEFAULT_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub retries: u32,
    /// Pause after each failed attempt, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Invoke `op` until it succeeds, fails non-transiently, or the attempt
    /// budget runs out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let attempts = self.retries.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(op = label, attempt, max = attempts, error = %e, "transient exchange error");
                    last = Some(e);
                    if attempt < attempts {
                        sleep(self.delay()).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let last = last.unwrap_or_else(|| ExchangeError::Network("no attempt made".into()));
        error!(op = label, attempts, "{label} failed to execute after {attempts} retries");
        Err(ExchangeError::RetriesExhausted {
            op: label.to_string(),
            attempts,
            last: Box::new(last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures() {
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy()
            .run("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(ExchangeError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_uses_whole_budget() {
        let calls = &AtomicU32::new(0);

        let result: ExchangeResult<()> = policy()
            .run("doomed", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Exchange("busy".into()))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(ExchangeError::RetriesExhausted { op, attempts, last }) => {
                assert_eq!(op, "doomed");
                assert_eq!(attempts, 5);
                assert!(matches!(*last, ExchangeError::Exchange(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_is_not_retried() {
        let calls = &AtomicU32::new(0);

        let result: ExchangeResult<()> = policy()
            .run("bad symbol", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::BadSymbol("FOO/ETH".into()))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ExchangeError::BadSymbol(_))));
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.retries, 10);
        assert_eq!(p.delay(), Duration::from_secs(2));
    }
}
