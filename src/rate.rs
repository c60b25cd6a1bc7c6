//! Per-project admission control for assign and submit.
//!
//! One token bucket per (project, operation), created lazily with burst 1 and
//! the refill rate the project had at creation time. Later rate changes on the
//! project are not picked up by an existing bucket.
//!
//! Reservations never block: they return the delay after which the reservation
//! would be honored. A positive delay means "reject and tell the client to
//! retry later". Tokens are consumed either way.

use crate::types::{Project, ProjectId};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const BURST: f64 = 1.0;

/// Classic token bucket that is allowed to go into debt.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens per second. `None` disables limiting.
    rate: Option<f64>,
    burst: f64,
    tokens: f64,
    last: Option<Instant>,
}

impl TokenBucket {
    /// A bucket refilling at `rate` tokens per second. Non-positive rates are unlimited.
    pub fn new(rate: f64) -> Self {
        Self {
            rate: (rate.is_finite() && rate > 0.0).then_some(rate),
            burst: BURST,
            tokens: BURST,
            last: None,
        }
    }

    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    fn refill(&mut self, rate: f64, now: Instant) {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate).min(self.burst);
        }
        self.last = Some(self.last.map_or(now, |last| last.max(now)));
    }

    /// Take `n` tokens at `now` and return how long the caller would have to wait.
    ///
    /// Only the first token has to be available; the rest are borrowed from the
    /// future, which pushes back the next caller instead of rejecting a bulk
    /// reservation larger than the burst outright.
    pub fn reserve_at(&mut self, now: Instant, n: u32) -> Duration {
        let Some(rate) = self.rate else {
            return Duration::ZERO;
        };
        if n == 0 {
            return Duration::ZERO;
        }

        self.refill(rate, now);
        let available = self.tokens;
        self.tokens -= f64::from(n);

        if available >= 1.0 {
            Duration::ZERO
        } else {
            // Tiny rates or deep debt overflow Duration
            Duration::try_from_secs_f64((1.0 - available) / rate).unwrap_or(Duration::MAX)
        }
    }
}

/// Operation guarded by a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKind {
    Assign,
    Submit,
}

/// Lazily created limiters, independent across projects.
#[derive(Default)]
pub struct RateLimiters {
    buckets: Mutex<HashMap<(ProjectId, RateKind), TokenBucket>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve_assign(&self, project: &Project) -> Duration {
        self.reserve_assign_at(project, Instant::now())
    }

    pub fn reserve_submit(&self, project: &Project, n: u32) -> Duration {
        self.reserve_submit_at(project, n, Instant::now())
    }

    pub fn reserve_assign_at(&self, project: &Project, now: Instant) -> Duration {
        self.reserve(project, RateKind::Assign, 1, now)
    }

    pub fn reserve_submit_at(&self, project: &Project, n: u32, now: Instant) -> Duration {
        self.reserve(project, RateKind::Submit, n, now)
    }

    fn reserve(&self, project: &Project, kind: RateKind, n: u32, now: Instant) -> Duration {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry((project.id, kind)).or_insert_with(|| {
            TokenBucket::new(match kind {
                RateKind::Assign => project.assign_rate,
                RateKind::Submit => project.submit_rate,
            })
        });
        bucket.reserve_at(now, n)
    }

    /// Number of limiters created so far.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reservation_is_free() {
        let mut bucket = TokenBucket::new(2.0);
        assert_eq!(bucket.reserve_at(Instant::now(), 1), Duration::ZERO);
    }

    #[test]
    fn back_to_back_reservations_are_delayed() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2.0);

        assert_eq!(bucket.reserve_at(now, 1), Duration::ZERO);
        let delay = bucket.reserve_at(now, 1);
        assert_eq!(delay, Duration::from_millis(500));
    }

    #[test]
    fn refill_restores_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2.0);

        assert_eq!(bucket.reserve_at(now, 1), Duration::ZERO);
        assert_eq!(
            bucket.reserve_at(now + Duration::from_millis(500), 1),
            Duration::ZERO
        );
        assert_eq!(bucket.reserve_at(now + Duration::from_secs(2), 1), Duration::ZERO);
    }

    #[test]
    fn rejected_reservations_still_consume() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0);

        bucket.reserve_at(now, 1);
        assert_eq!(bucket.reserve_at(now, 1), Duration::from_secs(1));
        assert_eq!(bucket.reserve_at(now, 1), Duration::from_secs(2));
    }

    #[test]
    fn bulk_reservation_borrows_from_the_future() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0);

        assert_eq!(bucket.reserve_at(now, 5), Duration::ZERO);
        assert_eq!(bucket.reserve_at(now, 1), Duration::from_secs(5));
    }

    #[test]
    fn tiny_rate_saturates_the_delay() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1e-20);

        assert_eq!(bucket.reserve_at(now, 1), Duration::ZERO);
        assert_eq!(bucket.reserve_at(now, 1), Duration::MAX);
        assert_eq!(bucket.reserve_at(now, u32::MAX), Duration::MAX);
    }

    #[test]
    fn non_positive_rate_is_unlimited() {
        let now = Instant::now();
        for rate in [0.0, -1.0, f64::INFINITY] {
            let mut bucket = TokenBucket::new(rate);
            assert!(bucket.rate().is_none());
            for _ in 0..10 {
                assert_eq!(bucket.reserve_at(now, 3), Duration::ZERO);
            }
        }
    }
}
