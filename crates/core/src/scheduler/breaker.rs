//! Cycle circuit breaker.
//!
//! Halts cycles after repeated whole-cycle failures. The breaker has two
//! states:
//!
//! - **Closed**: cycles run normally.
//! - **Open**: cycles are skipped until the cooldown, measured from the
//!   trip, has elapsed.
//!
//! Unlike a per-provider breaker there is no half-open probe: the first
//! cycle admitted after the cooldown runs normally, with the failure count
//! back at zero.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerSettings;

/// Breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    /// Normal operation - cycles are allowed.
    Closed,
    /// Too many failures - cycles are skipped.
    Open,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
        }
    }
}

/// Result of asking the breaker whether a cycle may run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    Allowed,
    /// The cooldown just elapsed; the breaker closed and the cycle may run.
    Recovered,
    Denied { remaining: Duration },
}

/// Point-in-time view of the breaker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub consecutive_errors: u32,
    pub max_consecutive_errors: u32,
    /// Time left before cycles resume, while open.
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_errors: u32,
    cooldown_until: Option<Instant>,
}

/// Consecutive-failure breaker owned by one scheduler.
pub struct CycleBreaker {
    inner: Mutex<BreakerInner>,
    settings: BreakerSettings,
}

impl CycleBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                consecutive_errors: 0,
                cooldown_until: None,
            }),
            settings,
        }
    }

    /// Lock the breaker state, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Cycle breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Decide whether a cycle may start now.
    ///
    /// Closes the breaker when its cooldown has elapsed.
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock_inner();
        let Some(until) = inner.cooldown_until else {
            return Admission::Allowed;
        };

        let now = Instant::now();
        if now >= until {
            info!(
                "Cycle breaker: cooldown elapsed after {} failed cycles, closing",
                inner.consecutive_errors
            );
            inner.cooldown_until = None;
            inner.consecutive_errors = 0;
            Admission::Recovered
        } else {
            Admission::Denied {
                remaining: until - now,
            }
        }
    }

    /// Record a successful cycle.
    ///
    /// Returns true if this closed an open breaker.
    pub fn record_success(&self) -> bool {
        let mut inner = self.lock_inner();
        let was_open = inner.cooldown_until.take().is_some();
        if inner.consecutive_errors > 0 {
            debug!(
                "Cycle breaker: success, failure count reset from {}",
                inner.consecutive_errors
            );
        }
        inner.consecutive_errors = 0;
        was_open
    }

    /// Record a failed cycle.
    ///
    /// Returns the cooldown when this failure opened the breaker.
    pub fn record_failure(&self) -> Option<Duration> {
        let mut inner = self.lock_inner();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);

        if inner.cooldown_until.is_some() {
            // The cooldown stays anchored at the original trip.
            return None;
        }

        if inner.consecutive_errors >= self.settings.max_consecutive_errors {
            warn!(
                "Cycle breaker: opening after {} consecutive failed cycles, cooldown {:?}",
                inner.consecutive_errors, self.settings.cooldown
            );
            inner.cooldown_until = Some(Instant::now() + self.settings.cooldown);
            Some(self.settings.cooldown)
        } else {
            debug!(
                "Cycle breaker: failure ({}/{})",
                inner.consecutive_errors, self.settings.max_consecutive_errors
            );
            None
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.lock_inner().consecutive_errors
    }

    pub fn state(&self) -> BreakerState {
        if self.lock_inner().cooldown_until.is_some() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock_inner();
        let now = Instant::now();
        BreakerStatus {
            state: if inner.cooldown_until.is_some() {
                BreakerState::Open
            } else {
                BreakerState::Closed
            },
            consecutive_errors: inner.consecutive_errors,
            max_consecutive_errors: self.settings.max_consecutive_errors,
            cooldown_remaining_ms: inner
                .cooldown_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
        }
    }

    /// Force the breaker closed and forget past failures.
    ///
    /// Returns true if the breaker was open.
    pub fn reset(&self) -> bool {
        let mut inner = self.lock_inner();
        inner.consecutive_errors = 0;
        inner.cooldown_until.take().is_some()
    }
}
