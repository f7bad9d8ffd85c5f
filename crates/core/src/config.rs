//! Engine configuration.
//!
//! Every setting has a default, so a config can be deserialized from a
//! partial JSON document or built from `TOKENPULSE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokenpulse_market_data::provider::duration_ms;
use tokenpulse_market_data::{CacheSettings, DiscoveryCriteria, DispatcherSettings, Interval};

use crate::errors::{EngineError, Result};

/// Circuit breaker thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    /// Consecutive failed cycles that open the breaker.
    pub max_consecutive_errors: u32,
    /// How long the breaker stays open, measured from the trip.
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Full engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    #[serde(with = "duration_ms")]
    pub cycle_interval: Duration,
    /// Tokens analysed in parallel per batch.
    pub batch_size: usize,
    /// Pause between two batches of one cycle.
    #[serde(with = "duration_ms")]
    pub batch_delay: Duration,
    pub max_tokens_per_cycle: usize,
    pub history_interval: Interval,
    /// Candles of history fetched per token.
    pub history_lookback: u32,
    /// Cycles kept in the metrics history.
    pub metrics_history: usize,
    pub breaker: BreakerSettings,
    pub discovery: DiscoveryCriteria,
    pub cache: CacheSettings,
    pub dispatcher: DispatcherSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            batch_size: 5,
            batch_delay: Duration::from_secs(1),
            max_tokens_per_cycle: 50,
            history_interval: Interval::OneHour,
            history_lookback: 24,
            metrics_history: 100,
            breaker: BreakerSettings::default(),
            discovery: DiscoveryCriteria::default(),
            cache: CacheSettings::default(),
            dispatcher: DispatcherSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load the configuration from the environment, reading `.env` first.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let vars = EnvVars { lookup: &lookup };

        if let Some(ms) = vars.parse::<u64>("TOKENPULSE_CYCLE_INTERVAL_MS")? {
            config.cycle_interval = Duration::from_millis(ms);
        }
        if let Some(size) = vars.parse("TOKENPULSE_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(ms) = vars.parse::<u64>("TOKENPULSE_BATCH_DELAY_MS")? {
            config.batch_delay = Duration::from_millis(ms);
        }
        if let Some(max) = vars.parse("TOKENPULSE_MAX_TOKENS_PER_CYCLE")? {
            config.max_tokens_per_cycle = max;
        }
        if let Some(lookback) = vars.parse("TOKENPULSE_HISTORY_LOOKBACK")? {
            config.history_lookback = lookback;
        }
        if let Some(interval) = vars.get("TOKENPULSE_HISTORY_INTERVAL") {
            config.history_interval = parse_interval(&interval)?;
        }
        if let Some(len) = vars.parse("TOKENPULSE_METRICS_HISTORY")? {
            config.metrics_history = len;
        }
        if let Some(max) = vars.parse("TOKENPULSE_MAX_CONSECUTIVE_ERRORS")? {
            config.breaker.max_consecutive_errors = max;
        }
        if let Some(ms) = vars.parse::<u64>("TOKENPULSE_BREAKER_COOLDOWN_MS")? {
            config.breaker.cooldown = Duration::from_millis(ms);
        }
        if let Some(min) = vars.parse::<Decimal>("TOKENPULSE_MIN_LIQUIDITY_USD")? {
            config.discovery.min_liquidity_usd = min;
        }
        if let Some(min) = vars.parse::<Decimal>("TOKENPULSE_MIN_VOLUME_24H")? {
            config.discovery.min_volume_24h = min;
        }
        if let Some(ms) = vars.parse::<u64>("TOKENPULSE_REQUEST_TIMEOUT_MS")? {
            config.dispatcher.request_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = vars.parse("TOKENPULSE_MAX_ATTEMPTS")? {
            config.dispatcher.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cycle_interval.is_zero() {
            return Err(EngineError::Config(
                "cycle interval must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.breaker.max_consecutive_errors == 0 {
            return Err(EngineError::Config(
                "max consecutive errors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

struct EnvVars<'a, F> {
    lookup: &'a F,
}

impl<F> EnvVars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => {
                debug!("Config override {}={}", key, raw);
                raw.parse()
                    .map(Some)
                    .map_err(|e| EngineError::Config(format!("{key}='{raw}': {e}")))
            }
            None => Ok(None),
        }
    }
}

fn parse_interval(raw: &str) -> Result<Interval> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| EngineError::Config(format!("TOKENPULSE_HISTORY_INTERVAL='{raw}'")))
}
