//! In-memory token-bucket rate limiter.
//!
//! One bucket per key (normally a procedure_id): capacity = requests per
//! minute, refill = capacity/60 tokens per second. Waiters queue on the
//! bucket's mutex, so under sustained over-subscription progress is FIFO
//! and nobody starves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{OrchError, OrchResult};

/// Sleep granularity while waiting for a refill.
const POLL_SLICE: Duration = Duration::from_millis(50);

struct Bucket {
    /// Tokens per second.
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_minute: u32) -> Self {
        let capacity = rate_per_minute as f64;
        Self {
            rate: capacity / 60.0,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Process-wide limiter. Constructed once at worker start and shared by
/// dependency injection so tests stay isolated.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire one token for `key`, blocking up to `timeout`. Exceeding the
    /// deadline is a `rate-limit` error.
    pub async fn acquire(
        &self,
        key: &str,
        max_per_minute: u32,
        timeout: Duration,
    ) -> OrchResult<()> {
        // Lazy bucket creation under the map lock avoids the double-init
        // race without holding it during the wait below.
        let bucket = {
            let mut buckets = self.buckets.lock().await;
            buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    tracing::info!(key, max_per_minute, "creating token bucket");
                    Arc::new(Mutex::new(Bucket::new(max_per_minute)))
                })
                .clone()
        };

        let deadline = Instant::now() + timeout;
        // Holding the bucket lock across the wait keeps waiters FIFO.
        let mut bucket = bucket.lock().await;
        loop {
            let now = Instant::now();
            bucket.refill(now);

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }

            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate);
            if now + wait > deadline {
                return Err(OrchError::rate_limit(key));
            }
            tokio::time::sleep(wait.min(POLL_SLICE)).await;
        }
    }

    /// Drop the bucket for `key` (used by tests).
    pub async fn reset(&self, key: &str) {
        self.buckets.lock().await.remove(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
