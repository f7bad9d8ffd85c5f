//! Request descriptors.
//!
//! Both types are hashable so they can key a cache category directly.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::price::Interval;
use super::token::TokenInfo;
use super::types::TokenId;

/// Thresholds a token must meet to be considered in a cycle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryCriteria {
    pub min_liquidity_usd: Decimal,
    pub min_volume_24h: Decimal,
    /// Maximum number of tokens to return
    pub limit: usize,
}

impl Default for DiscoveryCriteria {
    fn default() -> Self {
        Self {
            min_liquidity_usd: Decimal::from(50_000),
            min_volume_24h: Decimal::from(100_000),
            limit: 100,
        }
    }
}

impl DiscoveryCriteria {
    /// Whether a token passes the liquidity and volume thresholds.
    pub fn accepts(&self, token: &TokenInfo) -> bool {
        token.liquidity_usd >= self.min_liquidity_usd && token.volume_24h >= self.min_volume_24h
    }
}

impl fmt::Display for DiscoveryCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "liq>={} vol>={} limit={}",
            self.min_liquidity_usd, self.min_volume_24h, self.limit
        )
    }
}

/// Historical series request: `lookback` candles of `interval` ending now.
///
/// The window is relative so the same request keys the cache across cycles;
/// absolute bounds are computed at fetch time by [`HistoryRequest::range`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HistoryRequest {
    pub token: TokenId,
    pub interval: Interval,
    pub lookback: u32,
}

impl HistoryRequest {
    pub fn new(token: TokenId, interval: Interval, lookback: u32) -> Self {
        Self {
            token,
            interval,
            lookback,
        }
    }

    /// Absolute `(start, end)` bounds ending at `now`.
    pub fn range(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let span = self
            .interval
            .duration()
            .checked_mul(self.lookback)
            .and_then(|span| ChronoDuration::from_std(span).ok())
            .unwrap_or(ChronoDuration::MAX);
        let start = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        (start, now)
    }
}

impl fmt::Display for HistoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}x{}", self.token, self.interval, self.lookback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_criteria_accepts_thresholds_inclusive() {
        let criteria = DiscoveryCriteria {
            min_liquidity_usd: dec!(1000),
            min_volume_24h: dec!(500),
            limit: 10,
        };
        assert!(criteria.accepts(&TokenInfo::new("a", "A", dec!(1000), dec!(500))));
        assert!(!criteria.accepts(&TokenInfo::new("b", "B", dec!(999), dec!(5000))));
        assert!(!criteria.accepts(&TokenInfo::new("c", "C", dec!(5000), dec!(499))));
    }

    #[test]
    fn test_history_range() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let request = HistoryRequest::new("SOL".into(), Interval::OneHour, 24);
        let (start, end) = request.range(now);
        assert_eq!(end, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
        assert_eq!(request.to_string(), "SOL:1hx24");
    }
}
