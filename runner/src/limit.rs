//! Token-bucket rate limiting for the scheduler.
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// A token bucket with burst 1: acquisitions are spaced `1/rate` apart,
/// with the first token available immediately.
///
/// `acquire` is cancel safe. A waiter that is dropped mid-sleep has already
/// claimed its slot, which only leaves a gap in the schedule, never a burst.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// Create a limiter for `rate` requests per second. A rate of zero (or
    /// below) means no ceiling.
    pub fn new(rate: f64) -> Self {
        let interval = if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait until the next token is available.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }

        let wake = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next_slot).max(now);
            *next_slot = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(wake).await;
    }
}
