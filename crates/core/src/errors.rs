//! Core error types for the TokenPulse engine.
//!
//! Market data failures are wrapped as-is so callers can still inspect their
//! retry classification. Collaborator failures (`anyhow`) are flattened to
//! strings at the engine boundary.

use std::time::Duration;

use thiserror::Error;
use tokenpulse_market_data::MarketDataError;

use crate::scheduler::SchedulerState;

/// Type alias for Result using our Error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Root error type for the cycle engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Market data operation failed: {0}")]
    MarketData(#[from] MarketDataError),

    /// The cycle was skipped because the breaker is open.
    #[error("Circuit breaker open, cycles resume in {remaining:?}")]
    CircuitOpen { remaining: Duration },

    #[error("A cycle is already in progress")]
    CycleInProgress,

    #[error("Strategy evaluation failed: {0}")]
    Strategy(String),

    #[error("Position check failed: {0}")]
    Position(String),

    #[error("Cannot {action} a scheduler that is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SchedulerState,
    },

    #[error("Invalid configuration value: {0}")]
    Config(String),
}

impl EngineError {
    /// Wrap a strategy collaborator failure, keeping its context chain.
    pub fn strategy(error: anyhow::Error) -> Self {
        Self::Strategy(format!("{:#}", error))
    }

    /// Wrap a position policy failure, keeping its context chain.
    pub fn position(error: anyhow::Error) -> Self {
        Self::Position(format!("{:#}", error))
    }

    /// Whether this error counts as a cycle failure for the breaker.
    ///
    /// Skipped cycles (breaker open, cycle busy) and control-surface misuse
    /// are not failures of the cycle itself.
    pub fn is_cycle_failure(&self) -> bool {
        !matches!(
            self,
            Self::CircuitOpen { .. } | Self::CycleInProgress | Self::InvalidTransition { .. }
        )
    }
}
