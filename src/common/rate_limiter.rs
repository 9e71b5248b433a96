//! Token-bucket rate limiter
//!
//! Tokens refill continuously at `rate` per second up to `burst`. `acquire`
//! sleeps until a token is available, so callers never see a rate-limit
//! rejection from the exchange under normal load.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    /// `rate` requests per second with a burst of the same size
    pub fn per_second(rate: u32) -> Self {
        let rate = f64::from(rate.max(1));
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            })),
            rate,
            burst: rate,
        }
    }

    /// Waits for and consumes one token
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limited");
            sleep(wait).await;
        }
    }

    /// Consumes a token if one is available right now
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
    }
}
