//! Admission control across the global scope, category scopes and the
//! concurrency bound.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::gate::{ConcurrencyGate, GateToken};
use super::rules::AdmissionRules;
use super::scope::Scope;
use super::window::{Decision, SlidingWindowLimiter};
use crate::error::{CourierError, Result};

/// Decides whether a call may proceed now.
///
/// Owns every limiter and the concurrency gate for the lifetime of the
/// process. The category registry is fixed at construction.
#[derive(Debug)]
pub struct AdmissionController {
    /// The outer quota every call passes
    global: SlidingWindowLimiter,
    /// Per-category quotas indexed by category name
    categories: HashMap<String, SlidingWindowLimiter>,
    gate: ConcurrencyGate,
}

/// A granted admission. Holds one concurrency slot until released or dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    category: String,
    _token: GateToken,
}

impl AdmissionPermit {
    /// The category this permit was granted for.
    pub fn category(&self) -> &str {
        &self.category
    }
}

/// Snapshot of one limiter scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeStats {
    /// Permits that could be granted right now
    pub available: u64,
    /// Permits per window
    pub capacity: u64,
    /// Callers waiting in the limiter queue
    pub queued: usize,
}

impl ScopeStats {
    fn of(limiter: &SlidingWindowLimiter) -> Self {
        Self {
            available: limiter.available_permits(),
            capacity: limiter.capacity(),
            queued: limiter.queued(),
        }
    }
}

/// Read-only, non-authoritative view of admission state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub global: ScopeStats,
    pub categories: BTreeMap<String, ScopeStats>,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

impl AdmissionStats {
    /// Remaining permits for a scope, if the scope exists.
    pub fn available(&self, scope: &Scope) -> Option<u64> {
        match scope {
            Scope::Global => Some(self.global.available),
            Scope::Category(name) => self.categories.get(name).map(|s| s.available),
        }
    }
}

impl AdmissionController {
    /// Build the limiters and gate described by `rules`.
    pub fn new(rules: &AdmissionRules) -> Result<Self> {
        rules.validate()?;

        let global = SlidingWindowLimiter::from_rule(&rules.global)?;
        let categories = rules
            .categories
            .iter()
            .map(|(name, rule)| {
                debug!(
                    category = %name,
                    capacity = rule.requests_per_unit,
                    window = ?rule.window(),
                    "Registering category limiter"
                );
                SlidingWindowLimiter::from_rule(rule).map(|limiter| (name.clone(), limiter))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            global,
            categories,
            gate: ConcurrencyGate::new(rules.max_concurrent),
        })
    }

    /// Admit one call in `category`.
    ///
    /// Waits for a concurrency slot first, then checks the global limiter and
    /// finally the category limiter if the category is registered. A limiter
    /// rejection gives the slot back before returning
    /// [`CourierError::AdmissionRejected`].
    ///
    /// A grant from the global limiter is not refunded when the category
    /// limiter rejects afterwards.
    pub async fn admit(&self, category: &str, cancel: &CancellationToken) -> Result<AdmissionPermit> {
        let token = self.gate.acquire(cancel).await?;

        if let Decision::Rejected { retry_after } = self.global.acquire(1, cancel).await? {
            return Err(self.reject(Scope::Global, retry_after, token));
        }

        if let Some(limiter) = self.categories.get(category) {
            if let Decision::Rejected { retry_after } = limiter.acquire(1, cancel).await? {
                return Err(self.reject(Scope::category(category), retry_after, token));
            }
        }

        trace!(category = %category, in_flight = self.gate.outstanding(), "Call admitted");
        Ok(AdmissionPermit {
            category: category.to_string(),
            _token: token,
        })
    }

    /// Release the slot held by `permit`. Dropping the permit does the same.
    pub fn release(&self, permit: AdmissionPermit) {
        drop(permit);
    }

    /// Feed a remote throttling hint back into the matching limiter.
    ///
    /// Registered categories are blocked individually; anything else blocks
    /// the global scope.
    pub fn record_throttle(&self, category: &str, retry_after: Duration) {
        let (scope, limiter) = match self.categories.get(category) {
            Some(limiter) => (Scope::category(category), limiter),
            None => (Scope::Global, &self.global),
        };
        warn!(scope = %scope, retry_after = ?retry_after, "Remote throttling, blocking limiter");
        limiter.block_for(retry_after);
    }

    /// Whether `category` has its own limiter.
    pub fn is_registered(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    /// Current number of admitted, unreleased calls.
    pub fn in_flight(&self) -> usize {
        self.gate.outstanding()
    }

    /// Get the concurrency gate.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Snapshot every scope.
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            global: ScopeStats::of(&self.global),
            categories: self
                .categories
                .iter()
                .map(|(name, limiter)| (name.clone(), ScopeStats::of(limiter)))
                .collect(),
            in_flight: self.gate.outstanding(),
            max_concurrent: self.gate.max_concurrent(),
        }
    }

    fn reject(&self, scope: Scope, retry_after: Duration, token: GateToken) -> CourierError {
        self.gate.release(token);
        debug!(scope = %scope, retry_after = ?retry_after, "Admission rejected");
        CourierError::AdmissionRejected { scope, retry_after }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{TimeUnit, WindowRule, POLL_JOB};
    use tokio::time::{advance, timeout};

    fn controller(rules: AdmissionRules) -> AdmissionController {
        AdmissionController::new(&rules).unwrap()
    }

    fn poll_rules() -> AdmissionRules {
        AdmissionRules::global_only(10, WindowRule::new(100, TimeUnit::Second).per(10))
            .with_category(POLL_JOB, WindowRule::new(2, TimeUnit::Second).per(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_category_still_passes_global() {
        let admission = controller(AdmissionRules::global_only(
            10,
            WindowRule::new(2, TimeUnit::Minute),
        ));
        let cancel = CancellationToken::new();

        assert!(!admission.is_registered("reports"));
        admission.admit("reports", &cancel).await.unwrap();
        admission.admit("reports", &cancel).await.unwrap();

        match admission.admit("reports", &cancel).await {
            Err(CourierError::AdmissionRejected { scope, retry_after }) => {
                assert_eq!(scope, Scope::Global);
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected global rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_quota_with_concurrent_callers() {
        let admission = controller(poll_rules());
        let cancel = CancellationToken::new();

        let (a, b, c) = tokio::join!(
            admission.admit(POLL_JOB, &cancel),
            admission.admit(POLL_JOB, &cancel),
            admission.admit(POLL_JOB, &cancel),
        );
        let results = [a, b, c];
        let granted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 2);

        let rejection = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        match rejection {
            CourierError::AdmissionRejected { scope, retry_after } => {
                assert_eq!(*scope, Scope::category(POLL_JOB));
                assert_eq!(*retry_after, Duration::from_secs(10));
            }
            other => panic!("unexpected error {:?}", other),
        }
        drop(results);
        assert_eq!(admission.in_flight(), 0);

        advance(Duration::from_secs(10)).await;
        assert!(admission.admit(POLL_JOB, &cancel).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_releases_slot() {
        let admission = controller(AdmissionRules::global_only(
            1,
            WindowRule::new(1, TimeUnit::Minute),
        ));
        let cancel = CancellationToken::new();

        let permit = admission.admit("any", &cancel).await.unwrap();
        assert_eq!(admission.in_flight(), 1);
        admission.release(permit);

        assert!(admission.admit("any", &cancel).await.is_err());
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_backpressure_not_failure() {
        let admission = controller(AdmissionRules::global_only(
            1,
            WindowRule::new(100, TimeUnit::Second),
        ));
        let cancel = CancellationToken::new();

        let first = admission.admit("a", &cancel).await.unwrap();
        let blocked = timeout(Duration::from_secs(5), admission.admit("b", &cancel)).await;
        assert!(blocked.is_err(), "second caller should still be waiting");

        drop(first);
        let second = admission.admit("b", &cancel).await.unwrap();
        assert_eq!(second.category(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_slot() {
        let admission = controller(AdmissionRules::global_only(
            1,
            WindowRule::new(100, TimeUnit::Second),
        ));
        let held = admission.admit("a", &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = admission.admit("b", &cancel).await;
        assert!(matches!(result, Err(CourierError::Cancelled)));
        assert_eq!(admission.in_flight(), 1);
        drop(held);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_grant_consumed_when_category_rejects() {
        let admission = controller(poll_rules());
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let _ = admission.admit(POLL_JOB, &cancel).await;
        }
        let stats = admission.stats();
        assert_eq!(stats.global.available, 97);
        assert_eq!(stats.available(&Scope::category(POLL_JOB)), Some(0));
        assert_eq!(stats.available(&Scope::category("missing")), None);
        assert_eq!(stats.max_concurrent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_throttle_blocks_category() {
        let admission = controller(poll_rules());
        let cancel = CancellationToken::new();

        admission.record_throttle(POLL_JOB, Duration::from_secs(3));
        match admission.admit(POLL_JOB, &cancel).await {
            Err(CourierError::AdmissionRejected { scope, retry_after }) => {
                assert_eq!(scope, Scope::category(POLL_JOB));
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        // Other categories only see the global limiter
        assert!(admission.admit("start-job", &cancel).await.is_ok());

        advance(Duration::from_secs(3)).await;
        assert!(admission.admit(POLL_JOB, &cancel).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_throttle_unknown_category_blocks_global() {
        let admission = controller(poll_rules());
        let cancel = CancellationToken::new();

        admission.record_throttle("reports", Duration::from_secs(2));
        assert_eq!(admission.stats().global.available, 0);
        assert!(admission.admit(POLL_JOB, &cancel).await.is_err());
    }
}
