//! Token bucket guarding calls to the text-generation backend.
//!
//! One limiter is shared (via `Arc`) by every pipeline run in the process.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Allow `max_calls` per `period`, starting with a full bucket
    pub fn new(max_calls: u32, period: Duration) -> Self {
        let capacity = f64::from(max_calls.max(1));
        let period_secs = period.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            refill_rate: capacity / period_secs,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens currently available, after refilling
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_or_wait().is_ok()
    }

    /// Wait for a token. Returns `false` once `timeout` elapses without one;
    /// `None` waits indefinitely.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        loop {
            let wait = match self.try_acquire_or_wait() {
                Ok(()) => return true,
                Err(wait) => wait,
            };

            let mut sleep_for = wait.min(POLL_INTERVAL);
            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    debug!("Rate limiter timed out after {:?}", elapsed);
                    return false;
                }
                sleep_for = sleep_for.min(timeout - elapsed);
            }
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }

    /// Consume a token, or report how long until the next one
    fn try_acquire_or_wait(&self) -> Result<(), Duration> {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
            bucket.last_refill = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        // the bucket stays consistent even if a holder panicked
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
