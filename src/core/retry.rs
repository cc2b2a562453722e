//! Retry policy and the shared retry executor.
//!
//! All four stages retry through the same code path. A stage supplies its
//! policy and an attempt closure; the executor owns attempt counting,
//! per-attempt timeouts, exponential backoff with jitter, and the race
//! between backoff sleeps and shutdown.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{StageError, StageKind, StageResult};

/// Per-stage retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter fraction in [0, 1): each delay is scaled by a random factor
    /// in [1 - jitter, 1 + jitter] so retries from parallel workers spread
    /// out instead of synchronizing
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Per-attempt timeout in milliseconds; 0 disables the timeout
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}
fn default_attempt_timeout() -> u64 {
    60000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            attempt_timeout_ms: default_attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Base delay after a failed attempt (1-indexed), before jitter.
    ///
    /// Grows geometrically from `initial_delay_ms` and is capped at
    /// `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// `delay_for_attempt` with the jitter factor applied.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor.max(0.0))
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        if self.attempt_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.attempt_timeout_ms))
        }
    }
}

/// Final result of driving one operation through the executor.
#[derive(Debug)]
pub enum ExecOutcome<T> {
    /// The operation succeeded on attempt `attempts`.
    Ok { value: T, attempts: u32 },

    /// Permanent failure, or transient failure with the budget exhausted.
    Failed { error: StageError, attempts: u32 },

    /// Shutdown arrived before the next attempt could start.
    Cancelled { attempts: u32 },
}

impl<T> ExecOutcome<T> {
    /// Attempts actually made (0 when cancelled before the first one).
    pub fn attempts(&self) -> u32 {
        match self {
            ExecOutcome::Ok { attempts, .. }
            | ExecOutcome::Failed { attempts, .. }
            | ExecOutcome::Cancelled { attempts } => *attempts,
        }
    }

    /// Retries are every attempt after the first.
    pub fn retries(&self) -> u32 {
        self.attempts().saturating_sub(1)
    }
}

/// Drives fallible async operations to completion under a [`RetryPolicy`].
///
/// One executor is shared by every stage and worker; it is stateless apart
/// from the shutdown token, so concurrent `run` calls do not interfere.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    shutdown: CancellationToken,
}

impl RetryExecutor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    /// Runs `attempt_fn` until it succeeds, fails permanently, exhausts the
    /// attempt budget, or shutdown wins a backoff race.
    ///
    /// The closure receives the 1-indexed attempt number. An in-flight
    /// attempt is never aborted by shutdown; it runs to its own timeout,
    /// and cancellation is observed before the next attempt would start.
    pub async fn run<T, F, Fut>(
        &self,
        stage: StageKind,
        policy: &RetryPolicy,
        mut attempt_fn: F,
    ) -> ExecOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StageResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self.shutdown.is_cancelled() {
                return ExecOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            let result = match policy.attempt_timeout() {
                Some(limit) => match tokio::time::timeout(limit, attempt_fn(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::transient(anyhow!(
                        "attempt timed out after {}ms",
                        policy.attempt_timeout_ms
                    ))),
                },
                None => attempt_fn(attempt).await,
            };

            match result {
                Ok(value) => {
                    return ExecOutcome::Ok { value, attempts: attempt };
                }
                Err(error @ StageError::Permanent(_)) => {
                    return ExecOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
                Err(error @ StageError::Transient(_)) => {
                    if !policy.should_retry(attempt) {
                        return ExecOutcome::Failed {
                            error,
                            attempts: attempt,
                        };
                    }

                    let delay = policy.jittered_delay_for_attempt(attempt);
                    warn!(
                        stage = %stage,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed; retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            return ExecOutcome::Cancelled { attempts: attempt };
                        }
                    }
                }
            }
        }

        // max_attempts >= 1, so the loop always returns before this.
        ExecOutcome::Cancelled { attempts: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
            attempt_timeout_ms: 0,
        }
    }

    #[test]
    fn delays_grow_geometrically_then_cap() {
        let policy = no_jitter(10);
        let delays: Vec<u64> = (1..=6)
            .map(|a| policy.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 800, 1000, 1000]);

        // Monotone non-decreasing across the whole range.
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn first_delay_respects_the_cap() {
        let policy = RetryPolicy {
            initial_delay_ms: 5000,
            max_delay_ms: 1000,
            ..no_jitter(3)
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
    }

    #[test]
    fn jittered_delay_stays_within_band() {
        let policy = RetryPolicy {
            jitter: 0.2,
            ..no_jitter(5)
        };
        for _ in 0..100 {
            let d = policy.jittered_delay_for_attempt(3).as_millis() as f64;
            let base = policy.delay_for_attempt(3).as_millis() as f64;
            assert!(d >= base * 0.8 - 1.0 && d <= base * 1.2 + 1.0);
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt_reports_one_attempt() {
        let executor = RetryExecutor::new(CancellationToken::new());
        let outcome = executor
            .run(StageKind::Enrich, &no_jitter(3), |_| async { Ok(42u32) })
            .await;
        match outcome {
            ExecOutcome::Ok { value, attempts } => {
                assert_eq!(value, 42);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let executor = RetryExecutor::new(CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let outcome = executor
            .run(StageKind::Summarize, &no_jitter(5), move |attempt| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(StageError::transient(anyhow!("flaky")))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        match outcome {
            ExecOutcome::Ok { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Ok, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let executor = RetryExecutor::new(CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let outcome = executor
            .run(StageKind::Document, &no_jitter(5), move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(StageError::permanent(anyhow!("bad input")))
                }
            })
            .await;

        match outcome {
            ExecOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 1);
                assert!(!error.is_transient());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_reports_the_last_transient_error() {
        let executor = RetryExecutor::new(CancellationToken::new());
        let outcome = executor
            .run(StageKind::Notify, &no_jitter(3), |_| async {
                Err::<(), _>(StageError::transient(anyhow!("still down")))
            })
            .await;

        match outcome {
            ExecOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 3);
                assert!(error.is_transient());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_wins_the_race() {
        let token = CancellationToken::new();
        let executor = RetryExecutor::new(token.clone());

        let policy = RetryPolicy {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..no_jitter(5)
        };

        let canceller = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                token.cancel();
            }
        });

        let outcome = executor
            .run(StageKind::Enrich, &policy, |_| async {
                Err::<(), _>(StageError::transient(anyhow!("flaky")))
            })
            .await;

        match outcome {
            ExecOutcome::Cancelled { attempts } => assert_eq!(attempts, 1),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let executor = RetryExecutor::new(token);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let outcome = executor
            .run(StageKind::Enrich, &no_jitter(3), move |_| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StageError::transient(anyhow!("unreachable"))) }
            })
            .await;

        match outcome {
            ExecOutcome::Cancelled { attempts } => assert_eq!(attempts, 0),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out_as_transient() {
        let executor = RetryExecutor::new(CancellationToken::new());
        let policy = RetryPolicy {
            attempt_timeout_ms: 100,
            ..no_jitter(1)
        };

        let outcome = executor
            .run(StageKind::Summarize, &policy, |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        match outcome {
            ExecOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 1);
                assert!(error.is_transient());
                assert!(error.to_string().contains("timed out"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
