//! Token Bucket Rate Limiter
//!
//! Continuous-refill bucket: tokens accrue at `fill_rate` per second up to
//! `capacity`. `allow` is non-blocking; a caller that needs to wait for a
//! token re-polls (the worker pool does this through its admission loop,
//! re-queueing the task with a short delay).
//!
//! One bucket exists per rate-limited label, owned by the pool for its
//! whole lifetime. All mutation happens under a single lock per bucket.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
pub struct TokenBucket {
    fill_rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(fill_rate: f64, capacity: f64) -> Self {
        Self {
            fill_rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills for the elapsed wall time, then tries to debit `cost`.
    /// Returns whether the debit succeeded.
    pub fn allow(&self, cost: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = self.capacity.min(state.tokens + elapsed * self.fill_rate);
        state.last_refill = now;

        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Current token count after a refill. Diagnostic only.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = self.capacity.min(state.tokens + elapsed * self.fill_rate);
        state.last_refill = now;
        state.tokens
    }
}
