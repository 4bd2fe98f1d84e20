//! Token bucket for discovery fetches

use std::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts full
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self::new_at(rate_per_sec, burst, Instant::now())
    }

    pub fn new_at(rate_per_sec: f64, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Take one token at `now`, or return how long until one is available
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let Ok(mut state) = self.state.lock() else {
            return Ok(());
        };
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.rate_per_sec))
        }
    }

    pub fn available_at(&self, now: Instant) -> f64 {
        self.state
            .lock()
            .map(|mut s| {
                self.refill(&mut s, now);
                s.tokens
            })
            .unwrap_or(0.0)
    }

    /// Wait until a token is available
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
