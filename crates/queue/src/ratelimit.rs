//! Retry delay policies used by [`WorkQueue::add_rate_limited`](crate::WorkQueue::add_rate_limited).

use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::{lock, QueueItem};

/// Decides how long a failed item waits before it is delivered again.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`; records one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking `item`; its next failure starts from the base delay.
    fn forget(&self, item: &T);
    /// Failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponential<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T: QueueItem> ItemExponential<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: QueueItem> RateLimiter<T> for ItemExponential<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        2u32
            .checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Shared token bucket limiting the overall retry rate of a queue,
/// independent of which item failed.
pub struct Bucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let qps = if qps > 0.0 { qps } else { 1.0 };
        let burst = f64::from(burst.max(1));
        Self { qps, burst, state: Mutex::new(BucketState { tokens: burst, last: Instant::now() }) }
    }
}

impl<T: QueueItem> RateLimiter<T> for Bucket {
    fn when(&self, _item: &T) -> Duration {
        let mut st = lock(&self.state);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(st.last).as_secs_f64();
        st.last = now;
        st.tokens = (st.tokens + elapsed * self.qps).min(self.burst);
        // Reserve a token even when none is left; the debt sets the wait.
        st.tokens -= 1.0;
        if st.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-st.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Combines limiters by taking the longest delay among them.
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T: QueueItem> MaxOf<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T: QueueItem> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff from `base` to `max`, combined with a
/// 10 qps / 100 burst bucket over the whole queue.
pub fn controller_rate_limiter<T: QueueItem>(base: Duration, max: Duration) -> MaxOf<T> {
    MaxOf::new(vec![Box::new(ItemExponential::new(base, max)), Box::new(Bucket::new(10.0, 100))])
}

/// [`controller_rate_limiter`] with 5ms base and 1000s cap.
pub fn default_controller_rate_limiter<T: QueueItem>() -> MaxOf<T> {
    controller_rate_limiter(Duration::from_millis(5), Duration::from_secs(1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_grows_until_cap_and_resets_on_forget() {
        let rl = ItemExponential::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "ns/a".to_string();
        let delays: Vec<_> = (0..12).map(|_| rl.when(&key)).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "delays must not decrease: {:?}", delays);
        assert_eq!(*delays.last().expect("non-empty"), Duration::from_secs(1));
        assert_eq!(rl.num_requeues(&key), 12);

        rl.forget(&key);
        assert_eq!(rl.num_requeues(&key), 0);
        assert_eq!(rl.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn exponential_is_per_item() {
        let rl = ItemExponential::new(Duration::from_millis(1), Duration::from_secs(10));
        let a = "a".to_string();
        let b = "b".to_string();
        rl.when(&a);
        rl.when(&a);
        assert_eq!(rl.when(&b), Duration::from_millis(1));
        assert_eq!(rl.when(&a), Duration::from_millis(4));
    }

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let rl = ItemExponential::new(Duration::from_secs(1), Duration::from_secs(1000));
        let key = 7u32;
        for _ in 0..64 {
            assert!(rl.when(&key) <= Duration::from_secs(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let rl = Bucket::new(10.0, 3);
        let k = 1u32;
        for _ in 0..3 {
            assert_eq!(RateLimiter::<u32>::when(&rl, &k), Duration::ZERO);
        }
        let d1 = RateLimiter::<u32>::when(&rl, &k);
        let d2 = RateLimiter::<u32>::when(&rl, &k);
        assert!(d1 > Duration::ZERO);
        assert!(d2 > d1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(RateLimiter::<u32>::when(&rl, &k), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_longest() {
        let rl: MaxOf<String> = MaxOf::new(vec![
            Box::new(ItemExponential::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ItemExponential::new(Duration::from_millis(50), Duration::from_secs(1))),
        ]);
        let k = "x".to_string();
        assert_eq!(rl.when(&k), Duration::from_millis(50));
        assert_eq!(rl.num_requeues(&k), 1);
        rl.forget(&k);
        assert_eq!(rl.num_requeues(&k), 0);
    }
}
