//! Retry supervision - exponential backoff for transient failures
//!
//! The supervisor drives the attempt loop around node execution: it
//! classifies failures (via [`SpiceError::is_retryable`]), computes
//! exponential backoff with uniform jitter, honors upstream `Retry-After`
//! hints, enforces the attempt ceiling, and surfaces exhaustion as a
//! terminal [`SpiceError::Execution`] carrying diagnostics.
//!
//! `max_attempts` counts total attempts: a policy of 1 never retries.
//! Delay for attempt `n` (1-based) is
//! `min(max_delay, initial_delay * multiplier^(n-1))`, jittered by
//! `± jitter_factor * delay`. A `retry_after` hint replaces the computed
//! delay, capped at `max_delay`. Waits are cancellable through the run
//! context.

use crate::context::RunContext;
use crate::error::{Result, SpiceError};
use crate::middleware::ErrorAction;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for retrying failed node executions
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRetryPolicy {
    /// Total attempts including the first (1 = no retry)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Upper bound on any single delay, computed or hinted
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Uniform jitter as a fraction of the base delay (0.1 = ±10%)
    pub jitter_factor: f64,
}

impl Default for ExecutionRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ExecutionRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Policy that always makes exactly one attempt
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter;
        self
    }

    /// Base (un-jittered) delay before the retry following attempt `n`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Base delay with uniform jitter applied
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
    }

    /// Delay before the next attempt, honoring the error's hint
    pub fn delay_after(&self, attempt: u32, error: &SpiceError) -> Duration {
        match error.retry_after_hint() {
            Some(hint) => hint.min(self.max_delay),
            None => self.jittered_delay(attempt),
        }
    }
}

/// One failed attempt in a retry sequence
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub status_code: Option<u16>,
    /// Delay scheduled before the next attempt (absent on the final one)
    pub delay_before_next: Option<Duration>,
}

/// Accumulated state of one supervised execution
#[derive(Debug, Default)]
pub struct RetryContext {
    pub attempts: Vec<AttemptRecord>,
    pub total_delay: Duration,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, attempt: u32, error: &SpiceError, delay: Option<Duration>) {
        self.attempts.push(AttemptRecord {
            attempt,
            error: error.to_string(),
            status_code: error.status_code(),
            delay_before_next: delay,
        });
        if let Some(delay) = delay {
            self.total_delay += delay;
        }
    }
}

/// Result of a supervised execution
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// Middleware decided the failure is a no-op
    Skipped { attempts: u32 },
}

/// Drives the attempt loop for one node execution
#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    policy: ExecutionRetryPolicy,
}

impl RetrySupervisor {
    pub fn new(policy: ExecutionRetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in force for a graph: graph-level overrides runner-level,
    /// and disabled retry forces a single attempt
    pub fn effective_policy(
        graph_policy: Option<&ExecutionRetryPolicy>,
        runner_policy: &ExecutionRetryPolicy,
        retry_enabled: bool,
    ) -> ExecutionRetryPolicy {
        if !retry_enabled {
            return ExecutionRetryPolicy::no_retry();
        }
        graph_policy.cloned().unwrap_or_else(|| runner_policy.clone())
    }

    pub fn policy(&self) -> &ExecutionRetryPolicy {
        &self.policy
    }

    /// Execute `op` with retries
    ///
    /// `on_error` is consulted first on every failure (the middleware
    /// verdict): `Propagate` wins over the policy, `Skip` turns the failure
    /// into a no-op, `Retry` forces a retry within the same attempt budget,
    /// and `None` defers to the error classifier. Exhausted budgets surface
    /// as [`SpiceError::Execution`] with `retries_exhausted = true`.
    pub async fn execute<T, F, Fut, E>(
        &self,
        ctx: &RunContext,
        mut op: F,
        mut on_error: E,
    ) -> Result<RetryOutcome<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        E: FnMut(&SpiceError, u32) -> Option<ErrorAction>,
    {
        let started = std::time::Instant::now();
        let mut retry_ctx = RetryContext::new();
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            ctx.ensure_active()?;

            let error = match op(attempt).await {
                Ok(value) => return Ok(RetryOutcome::Success { value, attempts: attempt }),
                Err(error) => error,
            };

            let forced = match on_error(&error, attempt) {
                Some(ErrorAction::Propagate) => {
                    retry_ctx.record(attempt, &error, None);
                    return Err(error);
                }
                Some(ErrorAction::Skip) => {
                    tracing::debug!(attempt, error = %error, "Middleware skipped node failure");
                    return Ok(RetryOutcome::Skipped { attempts: attempt });
                }
                Some(ErrorAction::Retry) => true,
                None => false,
            };

            if !forced && !error.is_retryable() {
                retry_ctx.record(attempt, &error, None);
                return Err(error);
            }

            if attempt >= max_attempts {
                retry_ctx.record(attempt, &error, None);
                return Err(self.exhausted(error, &retry_ctx, started));
            }

            let delay = self.policy.delay_after(attempt, &error);
            retry_ctx.record(attempt, &error, Some(delay));
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient failure"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => return Err(SpiceError::Cancelled),
            }
        }

        unreachable!("attempt loop always returns")
    }

    fn exhausted(
        &self,
        last: SpiceError,
        retry_ctx: &RetryContext,
        started: std::time::Instant,
    ) -> SpiceError {
        SpiceError::Execution {
            message: last.to_string(),
            retries_exhausted: true,
            total_attempts: retry_ctx.attempts.len() as u32,
            last_status_code: last.status_code(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_verdict(_: &SpiceError, _: u32) -> Option<ErrorAction> {
        None
    }

    fn transient() -> SpiceError {
        SpiceError::Network {
            status_code: None,
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = ExecutionRetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert_eq!(policy.jitter_factor, 0.1);
    }

    #[test]
    fn test_base_delay_is_monotonic_and_capped() {
        let policy = ExecutionRetryPolicy::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0);

        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
        // Capped at max_delay from here on.
        assert_eq!(policy.base_delay(5), Duration::from_secs(1));
        assert_eq!(policy.base_delay(9), Duration::from_secs(1));

        for attempt in 1..9 {
            assert!(policy.base_delay(attempt) <= policy.base_delay(attempt + 1));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ExecutionRetryPolicy::new(5)
            .with_initial_delay(Duration::from_millis(1000))
            .with_jitter_factor(0.1);

        let base = policy.base_delay(1).as_secs_f64();
        for _ in 0..50 {
            let jittered = policy.jittered_delay(1).as_secs_f64();
            assert!(jittered >= base * 0.9 - f64::EPSILON);
            assert!(jittered <= base * 1.1 + f64::EPSILON);
        }
    }

    #[test]
    fn test_retry_after_hint_overrides_and_is_capped() {
        let policy = ExecutionRetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2));

        let hinted = SpiceError::RateLimit {
            retry_after_ms: Some(500),
            message: "slow down".into(),
        };
        assert_eq!(policy.delay_after(1, &hinted), Duration::from_millis(500));

        let excessive = SpiceError::RateLimit {
            retry_after_ms: Some(60_000),
            message: "slow down".into(),
        };
        assert_eq!(policy.delay_after(1, &excessive), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_exactly_max_attempts_invocations() {
        let policy = ExecutionRetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter_factor(0.0);
        let supervisor = RetrySupervisor::new(policy);
        let ctx = RunContext::new("g");
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let err = supervisor
            .execute(
                &ctx,
                move |_| {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(transient())
                    }
                },
                no_verdict,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            SpiceError::Execution {
                retries_exhausted,
                total_attempts,
                ..
            } => {
                assert!(retries_exhausted);
                assert_eq!(total_attempts, 3);
            }
            other => panic!("expected Execution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_retries() {
        let supervisor = RetrySupervisor::new(ExecutionRetryPolicy::no_retry());
        let ctx = RunContext::new("g");
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result: Result<RetryOutcome<()>> = supervisor
            .execute(
                &ctx,
                move |_| {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Err(transient())
                    }
                },
                no_verdict,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let supervisor = RetrySupervisor::new(ExecutionRetryPolicy::new(5));
        let ctx = RunContext::new("g");
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let err = supervisor
            .execute(
                &ctx,
                move |_| {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(SpiceError::Validation("bad input".into()))
                    }
                },
                no_verdict,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, SpiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let policy = ExecutionRetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter_factor(0.0);
        let supervisor = RetrySupervisor::new(policy);
        let ctx = RunContext::new("g");
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let outcome = supervisor
            .execute(
                &ctx,
                move |_| {
                    let counted = counted.clone();
                    async move {
                        if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(transient())
                        } else {
                            Ok("done")
                        }
                    }
                },
                no_verdict,
            )
            .await
            .unwrap();

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, "done");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_propagate_verdict_wins_over_policy() {
        let supervisor = RetrySupervisor::new(ExecutionRetryPolicy::new(5));
        let ctx = RunContext::new("g");
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let err = supervisor
            .execute(
                &ctx,
                move |_| {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(transient())
                    }
                },
                |_, _| Some(ErrorAction::Propagate),
            )
            .await
            .unwrap_err();

        // The transient error would retry under the policy, but middleware
        // propagation wins and the original error surfaces unwrapped.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, SpiceError::Network { .. }));
    }

    #[tokio::test]
    async fn test_skip_verdict_is_noop_success() {
        let supervisor = RetrySupervisor::new(ExecutionRetryPolicy::new(3));
        let ctx = RunContext::new("g");

        let outcome: RetryOutcome<()> = supervisor
            .execute(
                &ctx,
                |_| async { Err(SpiceError::Validation("ignorable".into())) },
                |_, _| Some(ErrorAction::Skip),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::Skipped { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_retry_verdict_forces_retry_of_non_retryable() {
        let policy = ExecutionRetryPolicy::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter_factor(0.0);
        let supervisor = RetrySupervisor::new(policy);
        let ctx = RunContext::new("g");
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result: Result<RetryOutcome<()>> = supervisor
            .execute(
                &ctx,
                move |_| {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Err(SpiceError::Validation("forced".into()))
                    }
                },
                |_, _| Some(ErrorAction::Retry),
            )
            .await;

        // Forced retries still consume the shared attempt budget.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(SpiceError::Execution { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_retry_wait() {
        let policy = ExecutionRetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(30))
            .with_jitter_factor(0.0);
        let supervisor = RetrySupervisor::new(policy);
        let ctx = RunContext::new("g");

        let cancel = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = supervisor
            .execute(&ctx, |_| async { Err::<(), _>(transient()) }, no_verdict)
            .await
            .unwrap_err();

        assert!(matches!(err, SpiceError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_effective_policy_precedence() {
        let runner = ExecutionRetryPolicy::new(3);
        let graph = ExecutionRetryPolicy::new(7);

        let effective = RetrySupervisor::effective_policy(Some(&graph), &runner, true);
        assert_eq!(effective.max_attempts, 7);

        let effective = RetrySupervisor::effective_policy(None, &runner, true);
        assert_eq!(effective.max_attempts, 3);

        let effective = RetrySupervisor::effective_policy(Some(&graph), &runner, false);
        assert_eq!(effective.max_attempts, 1);
    }
}
