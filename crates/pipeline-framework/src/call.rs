//! # Resilient Peer Calls
//!
//! [`call_with_retry`] runs one logical call to a peer as a sequence of attempts.
//! What happens after a failed attempt depends on how the error classifies:
//!
//! | Class                 | Behaviour                                             |
//! |-----------------------|-------------------------------------------------------|
//! | `CapacityExhausted`   | returned at once; the caller yields its work item     |
//! | `Transient`           | retried with exponential, jittered backoff, if the    |
//! |                       | request is idempotent and attempts remain             |
//! | `Permanent`           | returned at once                                      |
//!
//! Retries stop early when the cancellation token fires; the last error is returned.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The peer is at capacity or resting; retrying now would not help.
    CapacityExhausted,
    /// Network trouble, timeouts, a peer restarting.
    Transient,
    Permanent,
}

/// Maps a call error onto the retry decision.
pub trait Classify {
    fn class(&self) -> FailureClass;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let mut backoff = self.initial_backoff;
        for _ in 1..attempt {
            backoff = next_backoff(backoff, self.max_backoff);
        }
        backoff.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Runs `operation` until it succeeds or its error says to stop.
///
/// `operation` receives the attempt number, starting at 1. Non-idempotent calls are
/// never retried.
pub async fn call_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    idempotent: bool,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.class() {
            FailureClass::CapacityExhausted => {
                debug!(attempt, error = %err, "Peer at capacity");
                return Err(err);
            }
            FailureClass::Permanent => {
                warn!(attempt, error = %err, "Call failed");
                return Err(err);
            }
            FailureClass::Transient if !idempotent => {
                warn!(attempt, error = %err, "Call failed, not idempotent so not retrying");
                return Err(err);
            }
            FailureClass::Transient if attempt >= max_attempts => {
                error!(attempt, error = %err, "Call failed, retries exhausted");
                return Err(err);
            }
            FailureClass::Transient => {
                let backoff = jitter(policy.backoff_after(attempt));
                warn!(attempt, ?backoff, error = %err, "Call failed, retrying");
                if !sleep_with_cancellation(backoff, cancel).await {
                    debug!(attempt, "Retry cancelled");
                    return Err(err);
                }
            }
        }
    }
}

/// Sleeps for `delay`; false if cancelled first.
async fn sleep_with_cancellation(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        yield_now().await;
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}

/// Uniform in `[delay / 2, delay]`.
fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Busy,
        Flaky,
        Broken,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Classify for TestError {
        fn class(&self) -> FailureClass {
            match self {
                TestError::Busy => FailureClass::CapacityExhausted,
                TestError::Flaky => FailureClass::Transient,
                TestError::Broken => FailureClass::Permanent,
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_after(1), Duration::from_millis(10));
        assert_eq!(p.backoff_after(2), Duration::from_millis(20));
        assert_eq!(p.backoff_after(3), Duration::from_millis(40));
        assert_eq!(p.backoff_after(9), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = call_with_retry(&policy(), true, &CancellationToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TestError::Flaky)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&policy(), true, &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Flaky) }
        })
        .await;
        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn capacity_and_permanent_errors_return_immediately() {
        for error in [TestError::Busy, TestError::Broken] {
            let calls = AtomicU32::new(0);
            let expected = format!("{error}");
            let mut error = Some(error);
            let result: Result<(), TestError> =
                call_with_retry(&policy(), true, &CancellationToken::new(), |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let e = error.take();
                    async move { Err(e.unwrap_or(TestError::Broken)) }
                })
                .await;
            assert_eq!(result.unwrap_err().to_string(), expected);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn non_idempotent_calls_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&policy(), false, &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Flaky) }
        })
        .await;
        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
