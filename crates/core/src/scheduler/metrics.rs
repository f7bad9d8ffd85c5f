//! Per-cycle metrics and their bounded history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::breaker::BreakerStatus;
use super::SchedulerState;
use crate::events::CycleTrigger;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Succeeded,
    Failed { error: String },
}

/// Counters and timing of one executed cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleMetrics {
    pub cycle_id: Uuid,
    pub trigger: CycleTrigger,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tokens_discovered: usize,
    pub tokens_processed: usize,
    pub tokens_failed: usize,
    pub batches: usize,
    pub signals: usize,
    pub position_actions: usize,
    /// Set when a stop request ended the cycle before its last batch.
    pub interrupted: bool,
    pub outcome: CycleOutcome,
}

impl CycleMetrics {
    pub fn new(cycle_id: Uuid, trigger: CycleTrigger) -> Self {
        Self {
            cycle_id,
            trigger,
            started_at: Utc::now(),
            duration_ms: 0,
            tokens_discovered: 0,
            tokens_processed: 0,
            tokens_failed: 0,
            batches: 0,
            signals: 0,
            position_actions: 0,
            interrupted: false,
            outcome: CycleOutcome::Succeeded,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == CycleOutcome::Succeeded
    }
}

/// Append-only record of recent cycles, capped at a fixed length.
///
/// Totals keep counting after old entries fall out of the window.
#[derive(Debug)]
pub struct MetricsHistory {
    capacity: usize,
    cycles: VecDeque<CycleMetrics>,
    total_cycles: u64,
    successful_cycles: u64,
    failed_cycles: u64,
    skipped_cycles: u64,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            cycles: VecDeque::with_capacity(capacity),
            total_cycles: 0,
            successful_cycles: 0,
            failed_cycles: 0,
            skipped_cycles: 0,
        }
    }

    pub fn record(&mut self, metrics: CycleMetrics) {
        self.total_cycles += 1;
        if metrics.succeeded() {
            self.successful_cycles += 1;
        } else {
            self.failed_cycles += 1;
        }

        if self.cycles.len() == self.capacity {
            self.cycles.pop_front();
        }
        self.cycles.push_back(metrics);
    }

    pub fn record_skip(&mut self) {
        self.skipped_cycles += 1;
    }

    pub fn last(&self) -> Option<&CycleMetrics> {
        self.cycles.back()
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Mean duration of the cycles still in the window.
    pub fn average_duration_ms(&self) -> u64 {
        if self.cycles.is_empty() {
            return 0;
        }
        let total: u64 = self.cycles.iter().map(|c| c.duration_ms).sum();
        total / self.cycles.len() as u64
    }

    pub fn snapshot(&self, state: SchedulerState, breaker: BreakerStatus) -> EngineMetrics {
        EngineMetrics {
            state,
            total_cycles: self.total_cycles,
            successful_cycles: self.successful_cycles,
            failed_cycles: self.failed_cycles,
            skipped_cycles: self.skipped_cycles,
            average_duration_ms: self.average_duration_ms(),
            last_cycle: self.last().cloned(),
            breaker,
            history: self.cycles.iter().cloned().collect(),
        }
    }
}

/// Serializable view of the engine returned by `metrics()`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub state: SchedulerState,
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub skipped_cycles: u64,
    pub average_duration_ms: u64,
    pub last_cycle: Option<CycleMetrics>,
    pub breaker: BreakerStatus,
    /// Oldest first.
    pub history: Vec<CycleMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::breaker::BreakerState;

    fn cycle(duration_ms: u64, failed: bool) -> CycleMetrics {
        let mut metrics = CycleMetrics::new(Uuid::new_v4(), CycleTrigger::Timer);
        metrics.duration_ms = duration_ms;
        if failed {
            metrics.outcome = CycleOutcome::Failed {
                error: "discovery down".to_string(),
            };
        }
        metrics
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = MetricsHistory::new(3);
        for i in 0..5 {
            history.record(cycle(i * 10, false));
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.last().map(|c| c.duration_ms), Some(40));
        // Window holds 20, 30, 40
        assert_eq!(history.average_duration_ms(), 30);
    }

    #[test]
    fn test_snapshot_totals_outlive_window() {
        let mut history = MetricsHistory::new(2);
        history.record(cycle(5, true));
        history.record(cycle(5, false));
        history.record(cycle(5, false));
        history.record_skip();

        let snapshot = history.snapshot(
            SchedulerState::Idle,
            BreakerStatus {
                state: BreakerState::Closed,
                consecutive_errors: 0,
                max_consecutive_errors: 3,
                cooldown_remaining_ms: None,
            },
        );
        assert_eq!(snapshot.total_cycles, 3);
        assert_eq!(snapshot.failed_cycles, 1);
        assert_eq!(snapshot.successful_cycles, 2);
        assert_eq!(snapshot.skipped_cycles, 1);
        assert_eq!(snapshot.history.len(), 2);
    }
}
