//! Recurring, non-overlapping cycle driver.
//!
//! One cycle:
//! 1. Ask the breaker for admission (an open breaker skips the cycle)
//! 2. Discover the qualifying tokens through the feed
//! 3. Analyse them in fixed-width batches, each batch fully in parallel
//! 4. Check open positions against fresh prices
//! 5. Record metrics and update the breaker
//!
//! Every cycle, whether started by the timer or by hand, must take the
//! single cycle slot. A cycle that finds the slot taken is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokenpulse_market_data::{CacheStats, HistoryRequest, MarketFeed, TokenInfo};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::breaker::{Admission, BreakerStatus, CycleBreaker};
use super::metrics::{CycleMetrics, CycleOutcome, EngineMetrics, MetricsHistory};
use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::events::{CycleTrigger, EngineEvent, EventSink, NoOpEventSink, SkipReason};
use crate::strategy::{PositionAction, PositionPolicy, Signal, StrategyEngine, TokenSnapshot};

/// Lifecycle state of a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    /// The timer keeps ticking but its ticks don't start cycles.
    Paused,
    /// Waiting for the in-flight cycle before returning to idle.
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

struct TimerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Completion of a shutdown in progress; every `stop()` caller awaits it.
type ShutdownHandle = Shared<BoxFuture<'static, ()>>;

struct SchedulerInner {
    config: EngineConfig,
    feed: MarketFeed,
    strategy: Arc<dyn StrategyEngine>,
    positions: Arc<dyn PositionPolicy>,
    events: Arc<dyn EventSink>,
    breaker: CycleBreaker,
    metrics: Mutex<MetricsHistory>,
    state: Mutex<SchedulerState>,
    /// Held for the whole duration of a cycle.
    cycle_slot: tokio::sync::Mutex<()>,
    stop_requested: AtomicBool,
    timer: Mutex<Option<TimerHandle>>,
    /// Set while `Stopping`; lock after `state`.
    shutdown: Mutex<Option<ShutdownHandle>>,
}

/// Recover a poisoned std mutex; the guarded data stays usable.
fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Scheduler {} mutex was poisoned, recovering", name);
        poisoned.into_inner()
    })
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        lock_or_recover(&self.state, "state")
    }

    fn lock_metrics(&self) -> MutexGuard<'_, MetricsHistory> {
        lock_or_recover(&self.metrics, "metrics")
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        lock_or_recover(&self.timer, "timer")
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, Option<ShutdownHandle>> {
        lock_or_recover(&self.shutdown, "shutdown")
    }

    fn state(&self) -> SchedulerState {
        *self.lock_state()
    }

    /// Wait for the timer and any in-flight cycle, then return to `Idle`.
    ///
    /// Runs on its own task so an abandoned `stop()` call still completes it.
    async fn finish_stop(self: Arc<Self>, timer: Option<TimerHandle>) {
        if let Some(timer) = timer {
            let _ = timer.stop.send(true);
            if let Err(e) = timer.task.await {
                error!("Cycle timer task ended abnormally: {}", e);
            }
        }
        // A manual cycle may still hold the slot.
        drop(self.cycle_slot.lock().await);

        self.stop_requested.store(false, Ordering::SeqCst);
        let mut state = self.lock_state();
        self.lock_shutdown().take();
        *state = SchedulerState::Idle;
        info!("Cycle scheduler stopped");
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn skip(&self, trigger: CycleTrigger, reason: SkipReason) {
        self.lock_metrics().record_skip();
        self.events.emit(EngineEvent::cycle_skipped(trigger, reason));
    }

    /// Run one cycle if the slot is free and the breaker admits it.
    async fn run_cycle(&self, trigger: CycleTrigger) -> Result<CycleMetrics> {
        let Ok(_slot) = self.cycle_slot.try_lock() else {
            debug!("Cycle ({:?}) dropped: previous cycle still running", trigger);
            self.skip(trigger, SkipReason::CycleInProgress);
            return Err(EngineError::CycleInProgress);
        };

        match self.breaker.admit() {
            Admission::Allowed => {}
            Admission::Recovered => self.events.emit(EngineEvent::BreakerReset),
            Admission::Denied { remaining } => {
                info!(
                    "Cycle ({:?}) skipped: circuit breaker open for another {:?}",
                    trigger, remaining
                );
                self.skip(
                    trigger,
                    SkipReason::BreakerOpen {
                        remaining_ms: remaining.as_millis() as u64,
                    },
                );
                return Err(EngineError::CircuitOpen { remaining });
            }
        }

        let cycle_id = Uuid::new_v4();
        info!("Cycle {} started ({:?})", cycle_id, trigger);
        self.events
            .emit(EngineEvent::cycle_started(cycle_id, trigger));

        let started = Instant::now();
        let mut metrics = CycleMetrics::new(cycle_id, trigger);
        let result = self.execute_cycle(&mut metrics).await;
        metrics.duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => {
                if self.breaker.record_success() {
                    self.events.emit(EngineEvent::BreakerReset);
                }
                info!(
                    "Cycle {} completed in {}ms: {} tokens processed, {} failed, {} signals, {} position actions",
                    cycle_id,
                    metrics.duration_ms,
                    metrics.tokens_processed,
                    metrics.tokens_failed,
                    metrics.signals,
                    metrics.position_actions
                );
                self.events.emit(EngineEvent::CycleCompleted {
                    cycle_id,
                    tokens_processed: metrics.tokens_processed,
                    tokens_failed: metrics.tokens_failed,
                    signals: metrics.signals,
                    position_actions: metrics.position_actions,
                    duration_ms: metrics.duration_ms,
                });
            }
            Err(e) => {
                metrics.outcome = CycleOutcome::Failed {
                    error: e.to_string(),
                };
                let tripped = if e.is_cycle_failure() {
                    self.breaker.record_failure()
                } else {
                    None
                };
                let consecutive = self.breaker.consecutive_errors();
                error!(
                    "Cycle {} failed after {}ms ({} consecutive): {}",
                    cycle_id, metrics.duration_ms, consecutive, e
                );
                self.events
                    .emit(EngineEvent::cycle_failed(cycle_id, e, consecutive));
                if let Some(cooldown) = tripped {
                    warn!(
                        "Circuit breaker tripped after {} consecutive failed cycles; pausing cycles for {:?}",
                        consecutive, cooldown
                    );
                    self.events.emit(EngineEvent::breaker_tripped(
                        consecutive,
                        cooldown.as_millis() as u64,
                    ));
                }
            }
        }

        self.lock_metrics().record(metrics.clone());
        result.map(|()| metrics)
    }

    async fn execute_cycle(&self, metrics: &mut CycleMetrics) -> Result<()> {
        let cycle_id = metrics.cycle_id;
        let mut tokens = self.feed.discover_tokens(&self.config.discovery).await?;
        metrics.tokens_discovered = tokens.len();
        if tokens.len() > self.config.max_tokens_per_cycle {
            debug!(
                "Cycle {}: capping {} tokens to {}",
                cycle_id,
                tokens.len(),
                self.config.max_tokens_per_cycle
            );
            tokens.truncate(self.config.max_tokens_per_cycle);
        }

        for (index, batch) in tokens.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 && !self.config.batch_delay.is_zero() {
                sleep(self.config.batch_delay).await;
            }
            if self.stop_requested() {
                info!(
                    "Cycle {}: stop requested, skipping remaining {} tokens",
                    cycle_id,
                    tokens.len() - index * self.config.batch_size.max(1)
                );
                metrics.interrupted = true;
                break;
            }

            metrics.batches += 1;
            debug!(
                "Cycle {}: batch {} with {} tokens",
                cycle_id,
                index + 1,
                batch.len()
            );
            let outcomes = join_all(batch.iter().map(|token| self.process_token(token))).await;

            for (token, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(signal) => {
                        metrics.tokens_processed += 1;
                        if signal.is_actionable() {
                            metrics.signals += 1;
                        }
                        self.events
                            .emit(EngineEvent::signal_generated(cycle_id, signal));
                    }
                    Err(e) => {
                        metrics.tokens_failed += 1;
                        warn!("Cycle {}: token '{}' failed: {}", cycle_id, token.symbol, e);
                        self.events
                            .emit(EngineEvent::token_failed(cycle_id, token.id.clone(), e));
                    }
                }
            }
        }

        let actions = self.check_positions().await?;
        metrics.position_actions = actions.len();
        self.events.emit_batch(
            actions
                .into_iter()
                .map(|action| EngineEvent::position_action(cycle_id, action))
                .collect(),
        );
        Ok(())
    }

    /// Gather a token's data, evaluate it and forward the signal.
    async fn process_token(&self, token: &TokenInfo) -> Result<Signal> {
        let request = HistoryRequest::new(
            token.id.clone(),
            self.config.history_interval,
            self.config.history_lookback,
        );
        let (price, history) =
            futures::try_join!(self.feed.price(&token.id), self.feed.historical(&request))?;

        let snapshot = TokenSnapshot {
            token: token.clone(),
            price,
            history,
        };
        let signal = self
            .strategy
            .evaluate(&snapshot)
            .await
            .map_err(EngineError::strategy)?;

        self.positions
            .on_signal(&signal, price)
            .await
            .map_err(EngineError::position)?;
        Ok(signal)
    }

    async fn check_positions(&self) -> Result<Vec<PositionAction>> {
        let open = self
            .positions
            .open_positions()
            .await
            .map_err(EngineError::position)?;
        if open.is_empty() {
            return Ok(Vec::new());
        }

        let prices = self.feed.prices(&open).await;
        if prices.len() < open.len() {
            warn!(
                "Position check: {} of {} open positions have no price",
                open.len() - prices.len(),
                open.len()
            );
        }
        self.positions
            .check_positions(&prices)
            .await
            .map_err(EngineError::position)
    }
}

/// Timer loop: runs cycles inline, so a slow cycle delays (and with
/// `Skip` drops) later ticks instead of overlapping them.
async fn timer_loop(inner: Arc<SchedulerInner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.cycle_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut first_tick = true;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop.borrow() || inner.stop_requested() {
            break;
        }
        // The cycle promised by `start()` runs even if a pause came first.
        if !first_tick && inner.state() == SchedulerState::Paused {
            debug!("Scheduler paused, ignoring tick");
            continue;
        }
        first_tick = false;

        match inner.run_cycle(CycleTrigger::Timer).await {
            Ok(_) => {}
            Err(e) if !e.is_cycle_failure() => {}
            Err(e) => debug!("Timer cycle ended with error: {}", e),
        }
    }
    debug!("Cycle timer stopped");
}

/// Drives recurring cycles over a [`MarketFeed`].
///
/// The scheduler owns its feed, breaker and metrics; nothing is global, so
/// several schedulers can run side by side.
pub struct CycleScheduler {
    inner: Arc<SchedulerInner>,
}

impl CycleScheduler {
    /// Create an idle scheduler that discards its events.
    pub fn new(
        config: EngineConfig,
        feed: MarketFeed,
        strategy: Arc<dyn StrategyEngine>,
        positions: Arc<dyn PositionPolicy>,
    ) -> Result<Self> {
        Self::with_events(config, feed, strategy, positions, Arc::new(NoOpEventSink))
    }

    /// Create an idle scheduler reporting to `events`.
    pub fn with_events(
        config: EngineConfig,
        feed: MarketFeed,
        strategy: Arc<dyn StrategyEngine>,
        positions: Arc<dyn PositionPolicy>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                breaker: CycleBreaker::new(config.breaker.clone()),
                metrics: Mutex::new(MetricsHistory::new(config.metrics_history)),
                config,
                feed,
                strategy,
                positions,
                events,
                state: Mutex::new(SchedulerState::Idle),
                cycle_slot: tokio::sync::Mutex::new(()),
                stop_requested: AtomicBool::new(false),
                timer: Mutex::new(None),
                shutdown: Mutex::new(None),
            }),
        })
    }

    /// Start the recurring timer. The first cycle runs right away, even when
    /// `pause()` is called before the timer task gets to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if *state != SchedulerState::Idle {
                return Err(EngineError::InvalidTransition {
                    action: "start",
                    state: *state,
                });
            }
            *state = SchedulerState::Running;
        }

        self.inner.stop_requested.store(false, Ordering::SeqCst);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(timer_loop(Arc::clone(&self.inner), stop_rx));
        *self.inner.lock_timer() = Some(TimerHandle {
            stop: stop_tx,
            task,
        });

        info!(
            "Cycle scheduler started (interval {:?}, batch size {})",
            self.inner.config.cycle_interval, self.inner.config.batch_size
        );
        Ok(())
    }

    /// Stop the timer and wait for an in-flight cycle to finish.
    ///
    /// The running cycle completes its current batch and skips the rest.
    /// Stopping an idle scheduler is a no-op. The shutdown proceeds even if
    /// this future is dropped; calling `stop()` again while `Stopping` waits
    /// for that same shutdown.
    pub async fn stop(&self) -> Result<()> {
        let shutdown = {
            let mut state = self.inner.lock_state();
            match *state {
                SchedulerState::Idle => return Ok(()),
                SchedulerState::Stopping => match self.inner.lock_shutdown().clone() {
                    Some(shutdown) => shutdown,
                    None => return Ok(()),
                },
                SchedulerState::Running | SchedulerState::Paused => {
                    *state = SchedulerState::Stopping;
                    info!("Stopping cycle scheduler");
                    self.inner.stop_requested.store(true, Ordering::SeqCst);

                    let timer = self.inner.lock_timer().take();
                    let task = tokio::spawn(Arc::clone(&self.inner).finish_stop(timer));
                    let shutdown = async move {
                        if let Err(e) = task.await {
                            error!("Scheduler shutdown task ended abnormally: {}", e);
                        }
                    }
                    .boxed()
                    .shared();
                    *self.inner.lock_shutdown() = Some(shutdown.clone());
                    shutdown
                }
            }
        };

        shutdown.await;
        Ok(())
    }

    /// Close the breaker and forget past failures.
    ///
    /// Emits `BreakerReset` if the breaker was open.
    pub fn reset_breaker(&self) {
        if self.inner.breaker.reset() {
            info!("Circuit breaker reset by request");
            self.inner.events.emit(EngineEvent::BreakerReset);
        }
    }

    /// Keep the timer running but ignore its ticks.
    pub fn pause(&self) -> Result<()> {
        self.transition("pause", SchedulerState::Running, SchedulerState::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.transition("resume", SchedulerState::Paused, SchedulerState::Running)
    }

    fn transition(
        &self,
        action: &'static str,
        from: SchedulerState,
        to: SchedulerState,
    ) -> Result<()> {
        let mut state = self.inner.lock_state();
        if *state != from {
            return Err(EngineError::InvalidTransition {
                action,
                state: *state,
            });
        }
        *state = to;
        info!("Cycle scheduler {}", to);
        Ok(())
    }

    /// Run one cycle now, outside the timer.
    ///
    /// Allowed in any state but `Stopping`, including while paused. Fails
    /// with [`EngineError::CycleInProgress`] if a cycle is running and with
    /// [`EngineError::CircuitOpen`] while the breaker is open.
    pub async fn run_cycle_once(&self) -> Result<CycleMetrics> {
        let state = self.inner.state();
        if state == SchedulerState::Stopping {
            return Err(EngineError::InvalidTransition {
                action: "run a cycle on",
                state,
            });
        }
        self.inner.run_cycle(CycleTrigger::Manual).await
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state()
    }

    pub fn metrics(&self) -> EngineMetrics {
        let state = self.state();
        let breaker = self.inner.breaker.status();
        self.inner.lock_metrics().snapshot(state, breaker)
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.inner.breaker.status()
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.inner.feed.cache_stats()
    }

    pub fn clear_caches(&self) {
        self.inner.feed.clear_caches();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn feed(&self) -> &MarketFeed {
        &self.inner.feed
    }
}

impl Drop for CycleScheduler {
    fn drop(&mut self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        if let Some(timer) = self.inner.lock_timer().take() {
            let _ = timer.stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{NoPositions, SignalAction};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokenpulse_market_data::{
        DispatcherSettings, Interval, MarketDataError, PriceProvider, PricePoint, TokenId,
        TopTokensDiscovery,
    };

    struct FlatProvider;

    #[async_trait]
    impl PriceProvider for FlatProvider {
        fn id(&self) -> &'static str {
            "FLAT"
        }

        async fn get_price(&self, _id: &TokenId) -> std::result::Result<Decimal, MarketDataError> {
            Ok(dec!(1))
        }

        async fn get_batch_prices(
            &self,
            ids: &[TokenId],
        ) -> std::result::Result<HashMap<TokenId, Decimal>, MarketDataError> {
            Ok(ids.iter().map(|id| (id.clone(), dec!(1))).collect())
        }

        async fn get_historical(
            &self,
            _id: &TokenId,
            start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _interval: Interval,
        ) -> std::result::Result<Vec<PricePoint>, MarketDataError> {
            Ok(vec![PricePoint::new(start, dec!(1))])
        }

        async fn get_top_tokens(
            &self,
            _n: usize,
        ) -> std::result::Result<Vec<TokenInfo>, MarketDataError> {
            Ok(vec![TokenInfo::new("WIF", "WIF", dec!(1000000), dec!(1000000))])
        }
    }

    struct HoldStrategy;

    #[async_trait]
    impl StrategyEngine for HoldStrategy {
        async fn evaluate(&self, snapshot: &TokenSnapshot) -> anyhow::Result<Signal> {
            Ok(Signal::hold(snapshot.token.id.clone(), "flat market"))
        }
    }

    fn scheduler() -> CycleScheduler {
        let provider = Arc::new(FlatProvider);
        let feed = MarketFeed::with_settings(
            provider.clone(),
            Arc::new(TopTokensDiscovery::new(provider)),
            &Default::default(),
            DispatcherSettings::default(),
        );
        let config = EngineConfig {
            batch_delay: Duration::ZERO,
            ..Default::default()
        };
        CycleScheduler::new(config, feed, Arc::new(HoldStrategy), Arc::new(NoPositions)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions() {
        let scheduler = scheduler();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(matches!(
            scheduler.pause(),
            Err(EngineError::InvalidTransition { action: "pause", .. })
        ));

        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(matches!(
            scheduler.start(),
            Err(EngineError::InvalidTransition {
                state: SchedulerState::Running,
                ..
            })
        ));

        scheduler.pause().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert!(scheduler.pause().is_err());
        scheduler.resume().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.stop().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        // Stopping an idle scheduler is harmless
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_cycle_while_idle() {
        let scheduler = scheduler();
        let metrics = scheduler.run_cycle_once().await.unwrap();

        assert_eq!(metrics.trigger, CycleTrigger::Manual);
        assert_eq!(metrics.tokens_discovered, 1);
        assert_eq!(metrics.tokens_processed, 1);
        // Hold signals are not actionable
        assert_eq!(metrics.signals, 0);
        assert!(metrics.succeeded());
        assert_eq!(scheduler.metrics().total_cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let provider = Arc::new(FlatProvider);
        let feed = MarketFeed::with_settings(
            provider.clone(),
            Arc::new(TopTokensDiscovery::new(provider)),
            &Default::default(),
            DispatcherSettings::default(),
        );
        let config = EngineConfig {
            batch_size: 0,
            ..Default::default()
        };
        let result =
            CycleScheduler::new(config, feed, Arc::new(HoldStrategy), Arc::new(NoPositions));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_signal_action_display() {
        assert_eq!(SignalAction::Buy.to_string(), "buy");
        assert_eq!(SchedulerState::Stopping.to_string(), "stopping");
    }
}
