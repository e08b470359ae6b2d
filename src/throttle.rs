//! Global outbound request throttle
//!
//! A single token bucket shared by every network call the bot makes,
//! across sessions and poller tasks. Acquire waits rather than erroring;
//! the bucket refills continuously at the configured per-minute rate.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    capacity: f32,
    tokens: f32,
    refill_rate: f32,
    last_refill: Instant,
}

impl Bucket {
    fn new(requests_per_minute: u32) -> Self {
        let capacity = requests_per_minute.max(1) as f32;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f32();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f32(needed / self.refill_rate))
        }
    }
}

/// Shared request throttle.
pub struct Throttle {
    bucket: Mutex<Bucket>,
    rate: u32,
}

impl Throttle {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(requests_per_minute)),
            rate: requests_per_minute,
        }
    }

    /// Configured requests per minute.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Take one request slot, sleeping until the bucket allows it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_acquire() {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full() {
        let mut bucket = Bucket::new(10);
        for _ in 0..10 {
            assert!(bucket.try_acquire().is_ok());
        }
        assert!(bucket.try_acquire().is_err());
    }

    #[test]
    fn empty_bucket_reports_wait() {
        let mut bucket = Bucket::new(10);
        for _ in 0..10 {
            bucket.try_acquire().unwrap();
        }
        let wait = bucket.try_acquire().unwrap_err();
        // At 10 rpm one token takes 6 seconds.
        assert!(wait.as_millis() > 0);
        assert!(wait.as_secs() <= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let throttle = Throttle::new(60);
        for _ in 0..60 {
            throttle.acquire().await;
        }
        let before = tokio::time::Instant::now();
        throttle.acquire().await;
        // One token at 60 rpm refills in about a second.
        assert!(before.elapsed() >= Duration::from_millis(900));
    }
}
