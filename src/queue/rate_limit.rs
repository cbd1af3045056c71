//! Requeue delay policies.
//!
//! A [`RateLimiter`] answers "how long should this key wait before it is
//! delivered again". Per-key limiters count failures and are reset by
//! `forget`; the bucket limiter throttles the whole queue.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Longest delay any limiter hands out. Degenerate settings (a vanishing
/// QPS, an enormous backoff cap) saturate here instead of overflowing.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Computes requeue delays for keys of type `K`.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be delivered again. Records one more failure.
    fn when(&self, key: &K) -> Duration;

    /// Stop tracking `key`. A no-op for keys with no recorded failures.
    fn forget(&self, key: &K);

    /// Failures recorded for `key` since it was last forgotten.
    fn retries(&self, key: &K) -> u32;
}

impl<K, L: RateLimiter<K> + ?Sized> RateLimiter<K> for Box<L> {
    fn when(&self, key: &K) -> Duration {
        (**self).when(key)
    }

    fn forget(&self, key: &K) {
        (**self).forget(key)
    }

    fn retries(&self, key: &K) -> u32 {
        (**self).retries(key)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Per-key exponential backoff
// ---------------------------------------------------------------------------

/// `base * 2^failures`, capped at `max` (itself capped at [`MAX_DELAY`]).
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.min(MAX_DELAY),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        self.delay_for(exp)
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn retries(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Overall token bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every key: `qps` tokens per second, up to `burst`.
///
/// Each call to `when` reserves one token; when the bucket is empty the
/// returned delay is the time until the reserved token is refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps)
                .map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
        }
    }

    fn forget(&self, _key: &K) {}

    fn retries(&self, _key: &K) -> u32 {
        0
    }
}

// ---------------------------------------------------------------------------
// Combinators
// ---------------------------------------------------------------------------

/// Returns the longest delay of its children.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        // Every child must observe the failure, so no short-circuiting.
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn retries(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.retries(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff from 5ms to 1000s, combined with an overall
/// 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
