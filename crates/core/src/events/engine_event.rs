//! Engine event types.

use serde::Serialize;
use tokenpulse_market_data::TokenId;
use uuid::Uuid;

use crate::strategy::{PositionAction, Signal};

/// What started a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Timer,
    Manual,
}

/// Why a cycle did not run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The circuit breaker is open.
    BreakerOpen { remaining_ms: u64 },
    /// The previous cycle is still running.
    CycleInProgress,
}

/// Events emitted by the scheduler while it drives cycles.
///
/// These are observations, not commands: a sink may forward them to a UI,
/// a log shipper or a test probe without affecting the engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CycleStarted {
        cycle_id: Uuid,
        trigger: CycleTrigger,
    },

    CycleCompleted {
        cycle_id: Uuid,
        tokens_processed: usize,
        tokens_failed: usize,
        signals: usize,
        position_actions: usize,
        duration_ms: u64,
    },

    /// The cycle failed as a whole and counts against the breaker.
    CycleFailed {
        cycle_id: Uuid,
        error: String,
        consecutive_errors: u32,
    },

    CycleSkipped {
        trigger: CycleTrigger,
        #[serde(flatten)]
        reason: SkipReason,
    },

    /// The breaker opened. Cycles are skipped for `cooldown_ms`.
    BreakerTripped {
        consecutive_errors: u32,
        cooldown_ms: u64,
    },

    /// The breaker closed again after its cooldown or a successful cycle.
    BreakerReset,

    /// One token failed inside a batch; the cycle carried on.
    TokenFailed {
        cycle_id: Uuid,
        token: TokenId,
        error: String,
    },

    SignalGenerated {
        cycle_id: Uuid,
        signal: Signal,
    },

    PositionActionRequested {
        cycle_id: Uuid,
        action: PositionAction,
    },
}

impl EngineEvent {
    pub fn cycle_started(cycle_id: Uuid, trigger: CycleTrigger) -> Self {
        Self::CycleStarted { cycle_id, trigger }
    }

    pub fn cycle_failed(cycle_id: Uuid, error: impl ToString, consecutive_errors: u32) -> Self {
        Self::CycleFailed {
            cycle_id,
            error: error.to_string(),
            consecutive_errors,
        }
    }

    pub fn cycle_skipped(trigger: CycleTrigger, reason: SkipReason) -> Self {
        Self::CycleSkipped { trigger, reason }
    }

    pub fn breaker_tripped(consecutive_errors: u32, cooldown_ms: u64) -> Self {
        Self::BreakerTripped {
            consecutive_errors,
            cooldown_ms,
        }
    }

    pub fn token_failed(cycle_id: Uuid, token: TokenId, error: impl ToString) -> Self {
        Self::TokenFailed {
            cycle_id,
            token,
            error: error.to_string(),
        }
    }

    pub fn signal_generated(cycle_id: Uuid, signal: Signal) -> Self {
        Self::SignalGenerated { cycle_id, signal }
    }

    pub fn position_action(cycle_id: Uuid, action: PositionAction) -> Self {
        Self::PositionActionRequested { cycle_id, action }
    }

    /// Short machine-readable name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CycleStarted { .. } => "cycle_started",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::CycleFailed { .. } => "cycle_failed",
            Self::CycleSkipped { .. } => "cycle_skipped",
            Self::BreakerTripped { .. } => "breaker_tripped",
            Self::BreakerReset => "breaker_reset",
            Self::TokenFailed { .. } => "token_failed",
            Self::SignalGenerated { .. } => "signal_generated",
            Self::PositionActionRequested { .. } => "position_action_requested",
        }
    }
}
