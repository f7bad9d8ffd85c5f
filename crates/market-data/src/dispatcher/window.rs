//! Sliding-window rate limiter for a single provider.
//!
//! Unlike a token bucket, the window keeps the timestamps of recent
//! dispatches, so "at most `limit` in any `period`" holds exactly.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::provider::RateLimit;

/// Sliding record of recent dispatch times for one provider.
#[derive(Debug)]
pub struct RateLimitWindow {
    limit: usize,
    period: Duration,
    timestamps: VecDeque<Instant>,
    /// Set when the upstream itself rate limited us.
    blocked_until: Option<Instant>,
}

impl RateLimitWindow {
    /// Create a window from a provider's rate limit (a zero limit is clamped to 1).
    pub fn new(rate_limit: &RateLimit) -> Self {
        let limit = rate_limit.max_requests.max(1) as usize;
        Self {
            limit,
            period: rate_limit.period,
            timestamps: VecDeque::with_capacity(limit),
            blocked_until: None,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Forget timestamps that have left the window.
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.period {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    /// When the next dispatch is allowed, or `None` if it is allowed now.
    pub fn ready_at(&mut self, now: Instant) -> Option<Instant> {
        self.prune(now);

        let window_ready = if self.timestamps.len() >= self.limit {
            self.timestamps.front().map(|oldest| *oldest + self.period)
        } else {
            None
        };

        match (window_ready, self.blocked_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Record a dispatch at `now` if the window allows it.
    ///
    /// Returns the instant the window frees up otherwise.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Instant> {
        match self.ready_at(now) {
            Some(at) => Err(at),
            None => {
                self.timestamps.push_back(now);
                Ok(())
            }
        }
    }

    /// Treat the window as saturated until `until`.
    pub fn saturate(&mut self, until: Instant) {
        self.blocked_until = Some(match self.blocked_until {
            Some(current) => current.max(until),
            None => until,
        });
    }

    /// Dispatches currently counted in the window.
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.timestamps.len()
    }
}
