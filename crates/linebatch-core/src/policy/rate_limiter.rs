//! Interval-pacing rate limiter.
//!
//! Grants are spaced at least `60s / requests_per_minute` apart, so any
//! trailing 60-second window holds at most `requests_per_minute` grants (plus
//! one at the window boundary). Callers that arrive early are suspended for
//! the remaining deficit; nothing is ever rejected. Waiters are served in
//! arrival order because the async mutex is fair.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{self, Instant};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Ceiling on started work per minute. 0 disables pacing.
    pub requests_per_minute: u32,
}

impl RateLimiterConfig {
    /// Minimum spacing between two grants, or `None` when pacing is disabled.
    pub fn interval(&self) -> Option<Duration> {
        match self.requests_per_minute {
            0 => None,
            rpm => Some(Duration::from_secs(60) / rpm),
        }
    }
}

/// Paces the start of new work. Shared by reference across all workers.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    /// Earliest instant the next grant may be handed out.
    next_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            interval: config.interval(),
            next_grant: Mutex::new(None),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait until a new unit of work may start.
    ///
    /// Dropping the returned future before it completes leaves the limiter
    /// untouched, so a cancelled waiter does not consume a slot.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let mut next = self.next_grant.lock().await;
        if let Some(at) = *next {
            let now = Instant::now();
            if at > now {
                tracing::trace!(wait_ms = (at - now).as_millis() as u64, "pacing next start");
                time::sleep_until(at).await;
            }
        }
        *next = Some(Instant::now() + interval);
    }
}
