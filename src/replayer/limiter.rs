//! Token-bucket rate limiter for outbound replay traffic.
//!
//! One limiter exists per execution; two executions in different flows do
//! not throttle each other. The limiter never errors: callers wait until
//! a token is available.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity equal to one second of refill.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    refill_per_sec: f64,
    capacity: f64,
}

impl RateLimiter {
    /// `rps` of zero or less disables limiting.
    #[must_use]
    pub fn new(rps: f64) -> Self {
        let refill_per_sec = rps.max(0.0);
        let capacity = refill_per_sec.max(1.0);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            refill_per_sec,
            capacity,
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        if self.refill_per_sec <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_then_throttles() {
        let limiter = RateLimiter::new(10.0);
        let start = Instant::now();
        // Capacity is 10 tokens; the 11th acquisition must wait ~100ms.
        for _ in 0..11 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn zero_rps_never_blocks() {
        let limiter = RateLimiter::new(0.0);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
