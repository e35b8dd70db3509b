//! Retry with exponential backoff for retryable call outcomes.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CourierError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Base of the backoff; retry `n` waits `base_delay * 2^n`
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay
    pub max_delay: Duration,
    /// Random spread applied to each delay, as a fraction (0.0 disables it)
    pub jitter: f64,
    /// Wait at least as long as a rejection's retry-after hint
    pub honor_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
            honor_retry_after: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and backoff base.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter fraction.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Respect retry-after hints from rejections.
    pub fn honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    /// Backoff before retry `retry` (1 for the first retry), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, retry: u32, cause: &CourierError) -> Duration {
        let mut delay = self.backoff(retry);
        if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            delay = Duration::try_from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
                .unwrap_or(self.max_delay);
        }
        // A remote hint is a floor, jitter never undercuts it
        if self.honor_retry_after {
            if let Some(hint) = cause.retry_after() {
                delay = delay.max(hint);
            }
        }
        delay
    }
}

/// Executes operations with retry logic and exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates a new retry executor with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `operation` until it succeeds, fails for good or the attempt budget
    /// is spent.
    ///
    /// `operation` receives the 1-based attempt number. Retryable errors are
    /// absorbed; once `max_attempts` is reached the last one comes back wrapped
    /// in [`CourierError::RetriesExhausted`]. Everything else is returned as is.
    /// The cancellation token is observed while the attempt runs and during
    /// each backoff.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CourierError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CourierError::Cancelled),
                outcome = operation(attempt) => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Call succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    if attempt >= self.policy.max_attempts {
                        warn!(attempts = attempt, error = %err, "Retries exhausted");
                        return Err(CourierError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    let delay = self.policy.delay_for(attempt, &err);
                    warn!(
                        attempt = attempt,
                        max_attempts = self.policy.max_attempts,
                        delay = ?delay,
                        error = %err,
                        "Retryable failure, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CourierError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
