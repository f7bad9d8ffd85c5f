//! TokenPulse Core - Cycle orchestration over the market data feed.
//!
//! This crate drives the recurring analysis cycle. It owns the scheduler,
//! its circuit breaker and metrics, and defines the collaborator traits
//! (strategy, position policy, event sink) a host implements. Market data
//! access lives in the `tokenpulse-market-data` crate.

pub mod config;
pub mod errors;
pub mod events;
pub mod scheduler;
pub mod strategy;

pub use config::{BreakerSettings, EngineConfig};
pub use events::{
    ChannelEventSink, CycleTrigger, EngineEvent, EventSink, MockEventSink, NoOpEventSink,
    SkipReason,
};
pub use scheduler::{CycleMetrics, CycleScheduler, EngineMetrics, SchedulerState};
pub use strategy::{
    NoPositions, PositionAction, PositionActionKind, PositionPolicy, Signal, SignalAction,
    StrategyEngine, TokenSnapshot,
};

// Re-export error types
pub use errors::EngineError;
pub use errors::Result;
