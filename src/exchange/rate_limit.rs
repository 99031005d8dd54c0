// =============================================================================
// Token-bucket rate limiter
// =============================================================================
//
// Sized from the venue's `requests_per_minute`; `submit_market_order` uses a
// separate bucket constructed from `order_rate_limit`. Lock-free counters,
// classic token bucket refill rather than a header-driven weight counter.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct RateLimiter {
    capacity: i64,
    refill_per_ms: f64,
    tokens_milli: AtomicI64,
    last_refill_ms: AtomicU64,
}

impl RateLimiter {
    /// Construct a bucket that refills to `capacity` tokens over one minute.
    pub fn per_minute(capacity: u32) -> Self {
        let capacity = capacity.max(1) as i64;
        Self {
            capacity,
            refill_per_ms: capacity as f64 / 60_000.0,
            tokens_milli: AtomicI64::new(capacity * 1000),
            last_refill_ms: AtomicU64::new(Self::now_ms()),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn refill(&self) {
        let now = Self::now_ms();
        let last = self.last_refill_ms.swap(now, Ordering::SeqCst);
        let elapsed = now.saturating_sub(last) as f64;
        if elapsed <= 0.0 {
            return;
        }
        let added_milli = (elapsed * self.refill_per_ms * 1000.0) as i64;
        if added_milli == 0 {
            return;
        }
        let cap_milli = self.capacity * 1000;
        self.tokens_milli
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some((t + added_milli).min(cap_milli))
            })
            .ok();
    }

    /// Returns `true` and consumes a token if one is available without
    /// blocking.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        self.tokens_milli
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                if t >= 1000 {
                    Some(t - 1000)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Block until a token is available, polling at a fixed interval. Used
    /// ahead of every Exchange Port call so a burst of ticks naturally
    /// throttles to the venue's budget instead of failing.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::per_minute(5);
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_blocks_until_refill() {
        let limiter = RateLimiter::per_minute(60); // 1 token/sec
        for _ in 0..60 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        tokio::time::timeout(Duration::from_millis(2000), limiter.acquire())
            .await
            .expect("token should refill within two seconds at 1/sec");
    }
}
