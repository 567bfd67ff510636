//! # Rate limiters
//!
//! Decide how long a key has to wait before it is added back to the work
//! queue by [`RateLimitingQueue::add_rate_limited`](crate::workqueue::RateLimitingQueue::add_rate_limited).
//!
//! The default used by controllers ([`default_controller_rate_limiter`]) is the
//! maximum of a per-key exponential backoff (5ms doubling up to 1000s) and an
//! overall token bucket (10 qps, burst of 100). There is no upper bound on the
//! number of retries, a failing key is retried with the capped delay until it
//! succeeds.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

/// Per-key delay policy for requeues.
pub trait RateLimiter: Send + Sync {
    /// Delay before `item` may be processed again; records one more requeue.
    fn when(&self, item: &str) -> Duration;
    /// Stop tracking `item`, its next delay starts from the minimum again.
    fn forget(&self, item: &str);
    /// How many times `item` was requeued since it was last forgotten.
    fn num_requeues(&self, item: &str) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exponential backoff per key: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Default::default(),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, item: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let exp = failures.entry(item.to_string()).or_insert(0);
        let current = *exp;
        *exp = exp.saturating_add(1);
        // 2^31 * base overflows long before it matters, stop doubling at the cap.
        let factor = 1u32.checked_shl(current.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, item: &str) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &str) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket, independent of the key.
///
/// Tokens refill at `qps` up to `burst`. A reservation beyond the available
/// tokens is granted with the delay until the bucket would have refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _item: &str) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &str) {}

    fn num_requeues(&self, _item: &str) -> u32 {
        0
    }
}

/// Combines rate limiters by taking the longest delay of all of them.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, item: &str) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &str) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &str) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/// Rate limiter used by controllers unless configured otherwise.
pub fn default_controller_rate_limiter() -> Box<dyn RateLimiter> {
    Box::new(MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_sequence() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        assert_eq!(Duration::from_millis(1), limiter.when("one"));
        assert_eq!(Duration::from_millis(2), limiter.when("one"));
        assert_eq!(Duration::from_millis(4), limiter.when("one"));
        assert_eq!(Duration::from_millis(8), limiter.when("one"));
        assert_eq!(Duration::from_millis(16), limiter.when("one"));
        assert_eq!(5, limiter.num_requeues("one"));

        // other keys have their own history
        assert_eq!(Duration::from_millis(1), limiter.when("two"));
        assert_eq!(Duration::from_millis(2), limiter.when("two"));
        assert_eq!(2, limiter.num_requeues("two"));
    }

    #[test]
    fn exponential_forget_resets() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        limiter.when("one");
        limiter.when("one");
        limiter.forget("one");
        assert_eq!(0, limiter.num_requeues("one"));
        assert_eq!(Duration::from_millis(1), limiter.when("one"));
    }

    #[test]
    fn exponential_is_capped() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let mut last = Duration::ZERO;
        for _ in 0..100 {
            let next = limiter.when("one");
            assert!(next >= last);
            assert!(next <= Duration::from_secs(1000));
            last = next;
        }
        assert_eq!(Duration::from_secs(1000), last);
    }

    #[test]
    fn bucket_burst() {
        let limiter = BucketRateLimiter::new(1.0, 3);
        assert_eq!(Duration::ZERO, limiter.when("a"));
        assert_eq!(Duration::ZERO, limiter.when("b"));
        assert_eq!(Duration::ZERO, limiter.when("c"));
        let delay = limiter.when("d");
        assert!(delay > Duration::from_millis(900), "{:?}", delay);
        assert!(delay <= Duration::from_secs(1), "{:?}", delay);
        assert!(limiter.when("e") > delay);
    }

    #[test]
    fn max_of() {
        let limiter = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_secs(1),
            )),
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(3),
                Duration::from_millis(5),
            )),
        ]);
        assert_eq!(Duration::from_millis(3), limiter.when("one"));
        assert_eq!(Duration::from_millis(5), limiter.when("one"));
        assert_eq!(Duration::from_millis(5), limiter.when("one"));
        assert_eq!(Duration::from_millis(8), limiter.when("one"));
        assert_eq!(4, limiter.num_requeues("one"));
        limiter.forget("one");
        assert_eq!(0, limiter.num_requeues("one"));
        assert_eq!(Duration::from_millis(3), limiter.when("one"));
    }

    #[test]
    fn default_limiter_starts_small() {
        let limiter = default_controller_rate_limiter();
        assert_eq!(DEFAULT_BASE_DELAY, limiter.when("default/test-pod"));
        assert_eq!(DEFAULT_BASE_DELAY * 2, limiter.when("default/test-pod"));
        limiter.forget("default/test-pod");
        assert_eq!(DEFAULT_BASE_DELAY, limiter.when("default/test-pod"));
    }
}
