//! Retry with jittered exponential backoff.
//!
//! Delays come from [`backoff::ExponentialBackoff`]; the retry loop itself
//! stays here so it can honour deadlines, cancellation and the per-resource
//! transient error list.

use crate::error::ProviderError;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry settings for one remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Spread delays by up to ±25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Spread applied to each delay when jitter is on.
    pub const RANDOMIZATION_FACTOR: f64 = 0.25;

    /// A fresh backoff schedule for one operation.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: if self.jitter {
                Self::RANDOMIZATION_FACTOR
            } else {
                0.0
            },
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// An error is retried when [`ProviderError::is_transient`] holds for it
/// with the given `transient_messages`. No retry is started if it would end
/// past `deadline`. Cancellation is observed between attempts; an attempt
/// already in flight is allowed to finish.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    transient_messages: &[String],
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    operation: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient(transient_messages) || attempt + 1 >= policy.max_attempts {
            return Err(err);
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_delay);
        if deadline.is_some_and(|d| Instant::now() + delay > d) {
            return Err(err);
        }

        warn!(
            operation,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn transient() -> ProviderError {
        ProviderError::RemoteTransient {
            status: 503,
            message: "unavailable".into(),
        }
    }

    fn delays(policy: &RetryPolicy, n: usize) -> Vec<Duration> {
        let mut backoff = policy.backoff();
        (0..n).map(|_| backoff.next_backoff().unwrap()).collect()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        let max = policy.max_delay.mul_f64(1.0 + RetryPolicy::RANDOMIZATION_FACTOR);
        for (attempt, delay) in delays(&policy, 20).into_iter().enumerate() {
            let nominal = policy
                .base_delay
                .mul_f64(2.0_f64.powi(attempt as i32))
                .min(policy.max_delay);
            let low = nominal.mul_f64(1.0 - RetryPolicy::RANDOMIZATION_FACTOR);
            let high = nominal.mul_f64(1.0 + RetryPolicy::RANDOMIZATION_FACTOR) + Duration::from_millis(1);
            assert!(
                delay >= low && delay <= high,
                "attempt {attempt}: {delay:?} outside {low:?}..{high:?}"
            );
            assert!(delay <= max + Duration::from_millis(1));
        }
    }

    #[test]
    fn test_backoff_is_randomized() {
        // Two schedules agreeing on ten jittered delays in a row would be
        // lockstep retries.
        let policy = RetryPolicy::default();
        assert_ne!(delays(&policy, 10), delays(&policy, 10));
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let expected = [250, 500, 1000, 2000];
        for (delay, ms) in delays(&policy, 4).into_iter().zip(expected) {
            let nominal = Duration::from_millis(ms);
            assert!(delay >= nominal && delay - nominal < Duration::from_micros(1), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(
            &RetryPolicy::default(),
            &[],
            &CancellationToken::new(),
            None,
            "test",
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(assert_ok!(result), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(
            &RetryPolicy::default(),
            &[],
            &CancellationToken::new(),
            None,
            "test",
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            },
        )
        .await;

        assert!(matches!(result, Err(ProviderError::RemoteTransient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(
            &RetryPolicy::default(),
            &[],
            &CancellationToken::new(),
            None,
            "test",
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::RemotePermanent {
                        status: 403,
                        message: "forbidden".into(),
                    })
                }
            },
        )
        .await;

        assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declared_transient_message_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(
            &RetryPolicy::default(),
            &["Unable to delete instance".to_string()],
            &CancellationToken::new(),
            None,
            "delete",
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ProviderError::RemotePermanent {
                            status: 400,
                            message: "Unable to delete instance at this time".into(),
                        })
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        assert_ok!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let result: Result<(), _> = with_retry(
            &RetryPolicy::default(),
            &[],
            &CancellationToken::new(),
            Some(Instant::now() + Duration::from_millis(100)),
            "test",
            || async { Err(transient()) },
        )
        .await;
        assert!(matches!(result, Err(ProviderError::RemoteTransient { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = with_retry(
            &RetryPolicy::default(),
            &[],
            &cancel,
            None,
            "test",
            || async { Ok(()) },
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }
}
