//! Global token-bucket rate limiter shared by the worker pool.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use vantage_core::ScanError;

use crate::shutdown::CancelToken;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket replenished at `rate` tokens per second with capacity
/// `burst` (burst never below rate). Acquisition blocks until a token is
/// available or the context is cancelled.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        let rate = rate.max(0.1);
        let burst = burst.max(rate);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    /// Take one token, waiting as long as cancellation allows.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<(), ScanError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let mut token = cancel.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = token.cancelled() => return Err(ScanError::Cancelled),
                    }
                }
            }
        }
    }
}
