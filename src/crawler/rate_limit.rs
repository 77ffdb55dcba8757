//! Global request pacing
//!
//! Every request to the search API, whether a probe, a page or a retry, takes a
//! slot from one shared limiter so the aggregate request rate stays within the
//! configured delay no matter how many workers are running.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Spaces requests at least `interval` apart across all callers
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    /// Earliest instant at which the next slot may start
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter allowing one request per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Creates a limiter from a delay in milliseconds
    pub fn from_millis(delay_ms: u64) -> Self {
        Self::new(Duration::from_millis(delay_ms))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the caller may issue its request
    ///
    /// The slot is reserved under the lock, the wait happens after releasing it.
    pub async fn acquire(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot
        };

        if slot > Instant::now() {
            tracing::trace!("Rate limiter waiting {:?}", slot - Instant::now());
            sleep_until(slot).await;
        }
    }
}
