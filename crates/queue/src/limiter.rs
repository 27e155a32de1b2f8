//! Retry delay policies for [`WorkQueue::add_rate_limited`](crate::WorkQueue::add_rate_limited).

use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long a key waits before it is re-queued after a failure.
///
/// Implementations are only ever called with the queue lock held, so they can keep
/// plain mutable state.
pub trait RateLimiter<K>: Send {
    /// Delay before `item` may be processed again; records one more failure for it.
    fn when(&mut self, item: &K) -> Duration;
    /// Drop everything remembered about `item`.
    fn forget(&mut self, item: &K);
    /// Failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: FxHashMap::default() }
    }
}

impl<K: Hash + Eq + Clone + Send> RateLimiter<K> for ItemExponentialBackoff<K> {
    fn when(&mut self, item: &K) -> Duration {
        let count = self.failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        2u32.checked_pow(exp)
            .and_then(|m| self.base.checked_mul(m))
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&mut self, item: &K) { self.failures.remove(item); }

    fn num_requeues(&self, item: &K) -> u32 { self.failures.get(item).copied().unwrap_or(0) }
}

/// Overall token bucket shared by all items: `qps` refill rate, `burst` capacity.
///
/// Tokens may go negative; the deficit is the delay handed back, so callers past the
/// burst are spaced `1/qps` apart.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, tokens: burst, last: Instant::now() }
    }
}

impl<K> RateLimiter<K> for TokenBucket {
    fn when(&mut self, _item: &K) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }

    fn forget(&mut self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 { 0 }
}

/// Combines limiters; the longest delay wins.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&mut self, item: &K) -> Duration {
        self.limiters.iter_mut().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, item: &K) {
        for l in self.limiters.iter_mut() { l.forget(item); }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff from 5ms up to 1000s, bounded overall to 10 qps with a burst of 100.
pub fn default_controller_rate_limiter<K>() -> MaxOf<K>
where
    K: Hash + Eq + Clone + Send + 'static,
{
    MaxOf::new(vec![
        Box::new(ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(TokenBucket::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let mut l = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(30));
        let k = "a".to_string();
        assert_eq!(l.when(&k), Duration::from_millis(5));
        assert_eq!(l.when(&k), Duration::from_millis(10));
        assert_eq!(l.when(&k), Duration::from_millis(20));
        assert_eq!(l.when(&k), Duration::from_millis(30));
        assert_eq!(l.when(&k), Duration::from_millis(30));
        assert_eq!(l.num_requeues(&k), 5);
    }

    #[test]
    fn exponential_tracks_items_independently() {
        let mut l = ItemExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1));
        let (a, b) = ("a".to_string(), "b".to_string());
        l.when(&a);
        l.when(&a);
        assert_eq!(l.when(&b), Duration::from_millis(1));
        l.forget(&a);
        assert_eq!(l.num_requeues(&a), 0);
        assert_eq!(l.num_requeues(&b), 1);
        assert_eq!(l.when(&a), Duration::from_millis(1));
    }

    #[test]
    fn exponential_never_overflows() {
        let mut l = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let k = 1u32;
        for _ in 0..200 { l.when(&k); }
        assert_eq!(l.when(&k), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_allows_burst_then_spaces() {
        let mut b = TokenBucket::new(10.0, 100);
        for _ in 0..100 {
            assert_eq!(RateLimiter::<u32>::when(&mut b, &0), Duration::ZERO);
        }
        assert_eq!(RateLimiter::<u32>::when(&mut b, &0).as_millis(), 100);
        assert_eq!(RateLimiter::<u32>::when(&mut b, &0).as_millis(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_refills_over_time() {
        let mut b = TokenBucket::new(10.0, 1);
        assert_eq!(RateLimiter::<u32>::when(&mut b, &0), Duration::ZERO);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<u32>::when(&mut b, &0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_uses_longest_delay() {
        let mut l = default_controller_rate_limiter::<String>();
        let k = "ns/x".to_string();
        assert_eq!(l.when(&k), Duration::from_millis(5));
        assert_eq!(l.when(&k), Duration::from_millis(10));
        assert_eq!(l.num_requeues(&k), 2);
        l.forget(&k);
        assert_eq!(l.num_requeues(&k), 0);
    }
}
