//! Segmented sliding-window limiter.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::rules::WindowRule;
use crate::error::{CourierError, Result};

/// Lower bound on how long a queued caller sleeps before re-checking.
const MIN_QUEUE_WAIT: Duration = Duration::from_millis(1);

/// Stand-in deadline for blocks too long to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Outcome of a single admission check against one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The permits were consumed
    Granted,
    /// Not enough capacity; `retry_after` is when the oldest retained segment expires
    Rejected { retry_after: Duration },
}

impl Decision {
    /// Whether the permits were granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }
}

/// One slice of the trailing window.
///
/// A segment is opened by the first grant after the previous segment's span
/// has elapsed, and stays retained until `window` has passed since its most
/// recent grant.
#[derive(Debug)]
struct Segment {
    start: Instant,
    last_grant: Instant,
    consumed: u64,
}

#[derive(Debug, Default)]
struct WindowState {
    segments: VecDeque<Segment>,
    /// Set when the remote side told us to back off
    blocked_until: Option<Instant>,
}

impl WindowState {
    fn consumed(&self) -> u64 {
        self.segments.iter().map(|s| s.consumed).sum()
    }
}

/// A sliding-window limiter that tracks consumption in `segments` buckets.
///
/// Memory is bounded by the segment count. All check-and-commit work happens
/// under a single mutex so two callers can never both observe the last free
/// permit.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    /// Maximum permits within any trailing window
    capacity: u64,
    /// Length of the trailing window
    window: Duration,
    /// Number of segments the window is divided into
    segments: u32,
    /// Span of a single segment
    segment_len: Duration,
    /// Maximum callers allowed to wait for capacity
    queue_limit: usize,
    /// Callers currently waiting
    queued: AtomicUsize,
    state: Mutex<WindowState>,
}

impl SlidingWindowLimiter {
    /// Create a new limiter.
    pub fn new(capacity: u64, window: Duration, segments: u32, queue_limit: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CourierError::Config("limiter capacity must be positive".into()));
        }
        if segments == 0 {
            return Err(CourierError::Config("limiter needs at least one segment".into()));
        }
        if window.is_zero() {
            return Err(CourierError::Config("limiter window must be non-zero".into()));
        }

        Ok(Self {
            capacity,
            window,
            segments,
            segment_len: window / segments,
            queue_limit,
            queued: AtomicUsize::new(0),
            state: Mutex::new(WindowState::default()),
        })
    }

    /// Create a limiter from a configured rule.
    pub fn from_rule(rule: &WindowRule) -> Result<Self> {
        Self::new(rule.requests_per_unit, rule.window(), rule.segments, rule.queue_limit)
    }

    /// Try to consume `permits` without waiting.
    pub fn try_acquire(&self, permits: u64) -> Decision {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(until) = state.blocked_until {
            if until > now {
                return Decision::Rejected {
                    retry_after: until - now,
                };
            }
            state.blocked_until = None;
        }

        self.evict(&mut state, now);

        if permits == 0 {
            return Decision::Granted;
        }
        if permits > self.capacity {
            // Can never fit, however long the caller waits.
            return Decision::Rejected {
                retry_after: self.window,
            };
        }

        let consumed = state.consumed();
        if consumed + permits <= self.capacity {
            match state.segments.back_mut() {
                Some(segment) if now < segment.start + self.segment_len => {
                    segment.consumed += permits;
                    segment.last_grant = now;
                }
                _ => state.segments.push_back(Segment {
                    start: now,
                    last_grant: now,
                    consumed: permits,
                }),
            }
            trace!(consumed = consumed + permits, capacity = self.capacity, "Permits granted");
            Decision::Granted
        } else {
            let retry_after = state
                .segments
                .front()
                .map(|oldest| (oldest.last_grant + self.window).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            Decision::Rejected { retry_after }
        }
    }

    /// Consume `permits`, waiting in the queue if capacity is exhausted.
    ///
    /// Callers beyond the queue limit are rejected immediately. Queued
    /// callers re-check each time the oldest segment expires; there is no
    /// ordering among them.
    pub async fn acquire(&self, permits: u64, cancel: &CancellationToken) -> Result<Decision> {
        let mut wait = match self.try_acquire(permits) {
            Decision::Granted => return Ok(Decision::Granted),
            Decision::Rejected { retry_after } => retry_after,
        };

        if permits > self.capacity {
            return Ok(Decision::Rejected { retry_after: wait });
        }
        let Some(_ticket) = QueueTicket::enter(&self.queued, self.queue_limit) else {
            return Ok(Decision::Rejected { retry_after: wait });
        };

        debug!(wait = ?wait, queued = self.queued(), "Waiting in limiter queue");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CourierError::Cancelled),
                _ = sleep(wait.max(MIN_QUEUE_WAIT)) => {}
            }
            match self.try_acquire(permits) {
                Decision::Granted => return Ok(Decision::Granted),
                Decision::Rejected { retry_after } => wait = retry_after,
            }
        }
    }

    /// Refuse every request for `duration`, e.g. after a remote 429.
    pub fn block_for(&self, duration: Duration) {
        let now = Instant::now();
        let until = now.checked_add(duration).unwrap_or(now + FAR_FUTURE);
        let mut state = self.state.lock();
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// Permits that could be granted right now.
    ///
    /// A snapshot; another caller may consume them before you do.
    pub fn available_permits(&self) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.blocked_until.is_some_and(|until| until > now) {
            return 0;
        }
        self.evict(&mut state, now);
        self.capacity.saturating_sub(state.consumed())
    }

    /// Get the capacity of this limiter.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the trailing window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the configured segment count.
    pub fn segments(&self) -> u32 {
        self.segments
    }

    /// Callers currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn evict(&self, state: &mut WindowState, now: Instant) {
        while let Some(oldest) = state.segments.front() {
            if oldest.last_grant + self.window > now {
                break;
            }
            state.segments.pop_front();
        }
    }

    #[cfg(test)]
    fn retained_segments(&self) -> usize {
        self.state.lock().segments.len()
    }
}

/// A place in the limiter queue, released on drop.
struct QueueTicket<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueTicket<'a> {
    fn enter(queued: &'a AtomicUsize, limit: usize) -> Option<Self> {
        queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self { queued })
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use tokio::time::advance;

    fn limiter(capacity: u64, window_secs: u64, segments: u32) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(capacity, Duration::from_secs(window_secs), segments, 0).unwrap()
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(SlidingWindowLimiter::new(0, Duration::from_secs(1), 1, 0).is_err());
        assert!(SlidingWindowLimiter::new(1, Duration::from_secs(1), 0, 0).is_err());
        assert!(SlidingWindowLimiter::new(1, Duration::ZERO, 1, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_up_to_capacity() {
        let limiter = limiter(5, 60, 6);

        for _ in 0..5 {
            assert!(limiter.try_acquire(1).is_granted());
        }
        assert_eq!(limiter.available_permits(), 0);

        // The 6th request should be rejected until the whole window passes
        match limiter.try_acquire(1) {
            Decision::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(60)),
            Decision::Granted => panic!("expected rejection"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let limiter = limiter(3, 10, 5);
        assert!(limiter.try_acquire(3).is_granted());
        assert!(!limiter.try_acquire(1).is_granted());

        advance(Duration::from_secs(10) + Duration::from_millis(1)).await;
        assert!(limiter.try_acquire(1).is_granted());
        assert_eq!(limiter.available_permits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_expire_independently() {
        let limiter = limiter(6, 60, 6);
        assert!(limiter.try_acquire(3).is_granted());

        advance(Duration::from_secs(30)).await;
        assert!(limiter.try_acquire(3).is_granted());

        advance(Duration::from_secs(1)).await;
        match limiter.try_acquire(1) {
            Decision::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(29)),
            Decision::Granted => panic!("expected rejection"),
        }

        // First segment is gone, second one still counts
        advance(Duration::from_secs(29)).await;
        assert_eq!(limiter.available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_permit_request() {
        let limiter = limiter(10, 1, 1);
        assert!(limiter.try_acquire(8).is_granted());
        assert!(limiter.try_acquire(2).is_granted());
        assert!(!limiter.try_acquire(1).is_granted());
        assert!(!limiter.try_acquire(11).is_granted());
        assert!(limiter.try_acquire(0).is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_window_never_exceeds_capacity() {
        let capacity = 7;
        let window = Duration::from_secs(10);
        let limiter = SlidingWindowLimiter::new(capacity, window, 4, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let start = Instant::now();
        let mut grants: Vec<Duration> = Vec::new();

        for _ in 0..2000 {
            advance(Duration::from_millis(rng.gen_range(0..400))).await;
            let permits = rng.gen_range(1..=3);
            if limiter.try_acquire(permits).is_granted() {
                for _ in 0..permits {
                    grants.push(start.elapsed());
                }
            }
            assert!(limiter.retained_segments() <= limiter.segments() as usize + 1);
        }

        assert!(!grants.is_empty());
        for (i, at) in grants.iter().enumerate() {
            let in_window = grants[..=i]
                .iter()
                .filter(|earlier| **earlier + window > *at)
                .count();
            assert!(in_window as u64 <= capacity, "{} grants in window ending {:?}", in_window, at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_for_rejects_until_elapsed() {
        let limiter = limiter(100, 60, 6);
        limiter.block_for(Duration::from_secs(5));

        assert_eq!(limiter.available_permits(), 0);
        match limiter.try_acquire(1) {
            Decision::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(5)),
            Decision::Granted => panic!("expected rejection"),
        }

        advance(Duration::from_secs(5)).await;
        assert!(limiter.try_acquire(1).is_granted());
        assert_eq!(limiter.available_permits(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_waits_for_capacity() {
        let limiter = Arc::new(
            SlidingWindowLimiter::new(1, Duration::from_secs(10), 2, 1).unwrap(),
        );
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire(1).is_granted());

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let decision = limiter.acquire(1, &cancel).await.unwrap();
                (decision, started.elapsed())
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queued(), 1);

        // Queue is full: immediate rejection instead of a wait
        let overflow = limiter.acquire(1, &cancel).await.unwrap();
        assert!(!overflow.is_granted());

        let (decision, waited) = waiter.await.unwrap();
        assert!(decision.is_granted());
        assert_eq!(waited, Duration::from_secs(10));
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_for_saturates_huge_durations() {
        let limiter = limiter(5, 60, 6);

        limiter.block_for(Duration::from_secs(u64::MAX));
        limiter.block_for(Duration::from_secs_f64(1e19));

        assert_eq!(limiter.available_permits(), 0);
        match limiter.try_acquire(1) {
            Decision::Rejected { retry_after } => assert!(retry_after >= Duration::from_secs(86400 * 365)),
            Decision::Granted => panic!("blocked limiter granted a permit"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_observes_cancellation() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60), 1, 4).unwrap();
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire(1).is_granted());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = limiter.acquire(1, &cancel).await;
        assert!(matches!(result, Err(CourierError::Cancelled)));
        assert_eq!(limiter.queued(), 0);
    }
}
