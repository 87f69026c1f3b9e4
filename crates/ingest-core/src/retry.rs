//! Bounded retry with backoff

use crate::config::RetryPolicy;
use crate::error::Retryable;
use std::future::Future;

/// Result of a retried operation plus the number of attempts it took
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, or `policy` is exhausted
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Attempted<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retryable() && attempt < max => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    op = what,
                    attempt,
                    max_attempts = max,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(retryable={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry(&RetryPolicy::immediate(5), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Flaky(true))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(out.result.unwrap(), 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let out: Attempted<(), Flaky> =
            retry(&RetryPolicy::immediate(5), "test", |_| async { Err(Flaky(false)) }).await;
        assert_eq!(out.attempts, 1);
        assert!(out.result.is_err());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let out: Attempted<(), Flaky> =
            retry(&RetryPolicy::immediate(4), "test", |_| async { Err(Flaky(true)) }).await;
        assert_eq!(out.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2,
            jitter: false,
        };
        let start = tokio::time::Instant::now();
        let out: Attempted<(), Flaky> = retry(&policy, "test", |_| async { Err(Flaky(true)) }).await;
        assert_eq!(out.attempts, 3);
        assert!(start.elapsed() >= std::time::Duration::from_millis(300));
    }
}
