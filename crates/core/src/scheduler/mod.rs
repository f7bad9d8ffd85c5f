//! Cycle scheduling module.
//!
//! This module provides:
//! - [`CycleScheduler`]: the recurring cycle driver and its control surface
//! - [`CycleBreaker`]: consecutive-failure circuit breaker for cycles
//! - [`MetricsHistory`]: bounded per-cycle metrics

mod breaker;
mod cycle_scheduler;
mod metrics;

pub use breaker::{Admission, BreakerState, BreakerStatus, CycleBreaker};
pub use cycle_scheduler::{CycleScheduler, SchedulerState};
pub use metrics::{CycleMetrics, CycleOutcome, EngineMetrics, MetricsHistory};
