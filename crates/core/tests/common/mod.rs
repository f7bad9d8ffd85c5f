//! Shared collaborators for scheduler integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokenpulse_core::{
    CycleScheduler, EngineConfig, EventSink, MockEventSink, PositionAction, PositionPolicy,
    Signal, SignalAction, StrategyEngine, TokenSnapshot,
};
use tokenpulse_market_data::{
    CacheSettings, DispatcherSettings, Interval, MarketDataError, MarketFeed, PriceProvider,
    PricePoint, RateLimit, TokenId, TokenInfo, TopTokensDiscovery,
};

/// Scriptable upstream: fixed token list and prices, switchable failures.
pub struct MockMarket {
    tokens: Mutex<Vec<TokenInfo>>,
    prices: Mutex<HashMap<String, Decimal>>,
    failing_prices: Mutex<HashSet<String>>,
    pub fail_discovery: AtomicBool,
    pub top_calls: AtomicUsize,
    pub price_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
}

impl MockMarket {
    /// A market listing `symbols`, all liquid, each priced at 1.
    pub fn with_tokens(symbols: &[&str]) -> Arc<Self> {
        let tokens = symbols
            .iter()
            .map(|s| TokenInfo::new(*s, *s, dec!(1000000), dec!(2000000)))
            .collect();
        let prices = symbols.iter().map(|s| (s.to_string(), dec!(1))).collect();
        Arc::new(Self {
            tokens: Mutex::new(tokens),
            prices: Mutex::new(prices),
            failing_prices: Mutex::new(HashSet::new()),
            fail_discovery: AtomicBool::new(false),
            top_calls: AtomicUsize::new(0),
            price_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn fail_price(&self, symbol: &str) {
        self.failing_prices.lock().unwrap().insert(symbol.to_string());
    }

    pub fn set_discovery_failing(&self, failing: bool) {
        self.fail_discovery.store(failing, Ordering::SeqCst);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: &TokenId) -> Result<Decimal, MarketDataError> {
        let symbol: &str = id;
        if self.failing_prices.lock().unwrap().contains(symbol) {
            return Err(MarketDataError::NotFound(symbol.to_string()));
        }
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| MarketDataError::NotFound(symbol.to_string()))
    }
}

#[async_trait]
impl PriceProvider for MockMarket {
    fn id(&self) -> &'static str {
        "MOCK"
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit::new(1000, Duration::from_secs(1))
    }

    async fn get_price(&self, id: &TokenId) -> Result<Decimal, MarketDataError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(id)
    }

    async fn get_batch_prices(
        &self,
        ids: &[TokenId],
    ) -> Result<HashMap<TokenId, Decimal>, MarketDataError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ids
            .iter()
            .filter_map(|id| self.lookup(id).ok().map(|price| (id.clone(), price)))
            .collect())
    }

    async fn get_historical(
        &self,
        id: &TokenId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _interval: Interval,
    ) -> Result<Vec<PricePoint>, MarketDataError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let price = self.lookup(id)?;
        Ok(vec![PricePoint::new(start, price), PricePoint::new(end, price)])
    }

    async fn get_top_tokens(&self, n: usize) -> Result<Vec<TokenInfo>, MarketDataError> {
        self.top_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(MarketDataError::InvalidRequest {
                provider: "MOCK".to_string(),
                message: "discovery disabled".to_string(),
            });
        }
        Ok(self.tokens.lock().unwrap().iter().take(n).cloned().collect())
    }
}

/// Buys at or above a price threshold, optionally taking time to decide.
pub struct ThresholdStrategy {
    pub buy_at: Decimal,
    pub delay: Duration,
    pub evaluations: AtomicUsize,
}

impl ThresholdStrategy {
    pub fn new(buy_at: Decimal) -> Arc<Self> {
        Self::slow(buy_at, Duration::ZERO)
    }

    pub fn slow(buy_at: Decimal, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            buy_at,
            delay,
            evaluations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StrategyEngine for ThresholdStrategy {
    async fn evaluate(&self, snapshot: &TokenSnapshot) -> anyhow::Result<Signal> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if snapshot.history.is_empty() {
            anyhow::bail!("no history for {}", snapshot.token.symbol);
        }
        let action = if snapshot.price >= self.buy_at {
            SignalAction::Buy
        } else {
            SignalAction::Hold
        };
        Ok(Signal::new(
            snapshot.token.id.clone(),
            action,
            dec!(0.8),
            "threshold",
        ))
    }
}

/// Records signals and closes open positions priced below a floor.
pub struct RecordingPositions {
    pub signals: Mutex<Vec<(Signal, Decimal)>>,
    open: Mutex<Vec<TokenId>>,
    close_below: Decimal,
    pub fail_check: AtomicBool,
    pub checked_prices: Mutex<Vec<HashMap<TokenId, Decimal>>>,
}

impl RecordingPositions {
    pub fn new(open: &[&str], close_below: Decimal) -> Arc<Self> {
        Arc::new(Self {
            signals: Mutex::new(Vec::new()),
            open: Mutex::new(open.iter().map(|s| TokenId::from(*s)).collect()),
            close_below,
            fail_check: AtomicBool::new(false),
            checked_prices: Mutex::new(Vec::new()),
        })
    }

    pub fn signal_count(&self) -> usize {
        self.signals.lock().unwrap().len()
    }
}

#[async_trait]
impl PositionPolicy for RecordingPositions {
    async fn on_signal(&self, signal: &Signal, price: Decimal) -> anyhow::Result<()> {
        self.signals.lock().unwrap().push((signal.clone(), price));
        Ok(())
    }

    async fn open_positions(&self) -> anyhow::Result<Vec<TokenId>> {
        Ok(self.open.lock().unwrap().clone())
    }

    async fn check_positions(
        &self,
        prices: &HashMap<TokenId, Decimal>,
    ) -> anyhow::Result<Vec<PositionAction>> {
        if self.fail_check.load(Ordering::SeqCst) {
            anyhow::bail!("position store unavailable");
        }
        self.checked_prices.lock().unwrap().push(prices.clone());
        let mut actions: Vec<PositionAction> = prices
            .iter()
            .filter(|(_, price)| **price < self.close_below)
            .map(|(token, _)| PositionAction::close(token.clone(), "below floor"))
            .collect();
        actions.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(actions)
    }
}

/// Config for tests: no pacing delay, small batches.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        cycle_interval: Duration::from_secs(1),
        batch_size: 2,
        batch_delay: Duration::ZERO,
        ..Default::default()
    }
}

pub fn feed(market: &Arc<MockMarket>) -> MarketFeed {
    let discovery = Arc::new(TopTokensDiscovery::new(market.clone()));
    MarketFeed::with_settings(
        market.clone(),
        discovery,
        &CacheSettings::default(),
        DispatcherSettings::default(),
    )
}

pub struct Harness {
    pub market: Arc<MockMarket>,
    pub strategy: Arc<ThresholdStrategy>,
    pub positions: Arc<RecordingPositions>,
    pub events: MockEventSink,
    pub scheduler: CycleScheduler,
}

pub fn harness(
    config: EngineConfig,
    market: Arc<MockMarket>,
    strategy: Arc<ThresholdStrategy>,
    positions: Arc<RecordingPositions>,
) -> Harness {
    let events = MockEventSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(events.clone());
    let scheduler = CycleScheduler::with_events(
        config,
        feed(&market),
        strategy.clone(),
        positions.clone(),
        sink,
    )
    .expect("valid config");
    Harness {
        market,
        strategy,
        positions,
        events,
        scheduler,
    }
}
