//! Public entry point for admission-gated, retried calls.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};
use uuid::Uuid;

use super::retry::{RetryExecutor, RetryPolicy};
use crate::error::{CourierError, Result};
use crate::ratelimit::{AdmissionController, AdmissionRules, AdmissionStats};

/// Cumulative call counters.
#[derive(Debug, Default)]
struct DispatchCounters {
    calls: AtomicU64,
    attempts: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of dispatcher state for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Remaining permits per scope and in-flight calls
    pub admission: AdmissionStats,
    /// Calls dispatched
    pub calls: u64,
    /// Attempts made across all calls, retries included
    pub attempts: u64,
    /// Calls that returned a value
    pub succeeded: u64,
    /// Calls that returned an error
    pub failed: u64,
}

/// Runs units of work through admission control and retry.
///
/// Every attempt acquires its own admission, so a call waiting out a backoff
/// holds no concurrency slot.
#[derive(Debug)]
pub struct CallDispatcher {
    admission: Arc<AdmissionController>,
    retry: RetryExecutor,
    counters: DispatchCounters,
}

impl CallDispatcher {
    /// Create a dispatcher over an existing admission controller.
    pub fn new(admission: Arc<AdmissionController>, policy: RetryPolicy) -> Self {
        Self {
            admission,
            retry: RetryExecutor::new(policy),
            counters: DispatchCounters::default(),
        }
    }

    /// Build the admission controller from `rules` and wrap it.
    pub fn from_rules(rules: &AdmissionRules, policy: RetryPolicy) -> Result<Self> {
        Ok(Self::new(Arc::new(AdmissionController::new(rules)?), policy))
    }

    /// Run `operation` under `category`'s quota.
    ///
    /// Each attempt waits for admission, then awaits the future returned by
    /// `operation`; the future is not polled before admission is granted. The
    /// concurrency slot is released when the attempt ends, whichever way it
    /// ends. A [`CourierError::Throttled`] outcome with a retry-after hint
    /// also blocks the matching limiter for that long.
    pub async fn dispatch<F, Fut, T>(
        &self,
        category: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let call_id = Uuid::new_v4();
        let span = debug_span!("dispatch", category = %category, call_id = %call_id);
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let operation = &operation;
        let result = self
            .retry
            .execute(cancel, move |attempt| async move {
                self.counters.attempts.fetch_add(1, Ordering::Relaxed);
                let permit = self.admission.admit(category, cancel).await?;
                debug!(attempt = attempt, "Dispatching call");

                let outcome = operation().await;
                if let Err(CourierError::Throttled {
                    retry_after: Some(retry_after),
                }) = &outcome
                {
                    self.admission.record_throttle(category, *retry_after);
                }

                self.admission.release(permit);
                outcome
            })
            .instrument(span)
            .await;

        let counter = if result.is_ok() {
            &self.counters.succeeded
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Snapshot remaining permits and call counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            admission: self.admission.stats(),
            calls: self.counters.calls.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Get the admission controller.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Get the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{POLL_JOB, START_JOB};
    use crate::ratelimit::{Scope, TimeUnit, WindowRule};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn dispatcher(rules: AdmissionRules, policy: RetryPolicy) -> CallDispatcher {
        CallDispatcher::from_rules(&rules, policy).unwrap()
    }

    fn rules() -> AdmissionRules {
        AdmissionRules::global_only(4, WindowRule::new(100, TimeUnit::Second).per(10))
            .with_category(POLL_JOB, WindowRule::new(2, TimeUnit::Second).per(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_releases_slot() {
        let dispatcher = dispatcher(rules(), RetryPolicy::default());
        let cancel = CancellationToken::new();

        let value = dispatcher
            .dispatch(START_JOB, &cancel, || async { Ok::<_, CourierError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let stats = dispatcher.stats();
        assert_eq!(stats.admission.in_flight, 0);
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.admission.global.available, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_concurrent_polls_two_per_window() {
        // Third call is rejected, backs off base * 2 = 10s, then fits the new window
        let dispatcher = dispatcher(rules(), RetryPolicy::new(3, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let (dispatcher, cancel) = (&dispatcher, &cancel);
        let call = move || async move {
            dispatcher
                .dispatch(POLL_JOB, cancel, move || async move {
                    Ok::<_, CourierError>(started.elapsed())
                })
                .await
        };
        let (a, b, c) = tokio::join!(call(), call(), call());

        let mut finished = vec![a.unwrap(), b.unwrap(), c.unwrap()];
        finished.sort();
        assert_eq!(
            finished,
            vec![Duration::ZERO, Duration::ZERO, Duration::from_secs(10)]
        );

        let stats = dispatcher.stats();
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.admission.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_propagates_immediately() {
        let dispatcher = dispatcher(rules(), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = dispatcher
            .dispatch(START_JOB, &cancel, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CourierError::Application {
                        status: Some(422),
                        message: "unsupported format".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(CourierError::Application { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().failed, 1);
        assert_eq!(dispatcher.stats().admission.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_admission_rejections() {
        let rules = AdmissionRules::global_only(4, WindowRule::new(1, TimeUnit::Hour));
        let dispatcher = dispatcher(rules, RetryPolicy::new(3, Duration::from_millis(100)));
        let cancel = CancellationToken::new();

        dispatcher
            .dispatch("reports", &cancel, || async { Ok::<_, CourierError>(()) })
            .await
            .unwrap();

        let result = dispatcher
            .dispatch("reports", &cancel, || async { Ok::<_, CourierError>(()) })
            .await;
        match result {
            Err(CourierError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(
                    *last,
                    CourierError::AdmissionRejected { scope: Scope::Global, .. }
                ));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(dispatcher.stats().admission.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_call_frees_slot() {
        let dispatcher = dispatcher(rules(), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let before = dispatcher.admission().in_flight();

        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let result: Result<()> = dispatcher
            .dispatch(START_JOB, &cancel, || async {
                sleep(Duration::from_secs(120)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CourierError::Cancelled)));
        assert_eq!(dispatcher.admission().in_flight(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_throttle_hint_does_not_panic() {
        let dispatcher = dispatcher(rules(), RetryPolicy::no_retry());
        let cancel = CancellationToken::new();

        let result: Result<()> = dispatcher
            .dispatch(POLL_JOB, &cancel, || async {
                Err(CourierError::Throttled {
                    retry_after: Some(Duration::MAX),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(CourierError::RetriesExhausted { attempts: 1, .. })
        ));
        assert_eq!(
            dispatcher.stats().admission.available(&Scope::category(POLL_JOB)),
            Some(0)
        );
        assert_eq!(dispatcher.stats().admission.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_throttle_blocks_category() {
        let dispatcher = dispatcher(rules(), RetryPolicy::new(2, Duration::from_millis(500)));
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = dispatcher
            .dispatch(POLL_JOB, &cancel, || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(CourierError::Throttled {
                            retry_after: Some(Duration::from_secs(4)),
                        })
                    } else {
                        Ok(started.elapsed())
                    }
                }
            })
            .await;

        // The retry after 1s is refused locally until the 4s block lifts
        assert!(matches!(
            result,
            Err(CourierError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            dispatcher.stats().admission.available(&Scope::category(POLL_JOB)),
            Some(0)
        );
    }
}
