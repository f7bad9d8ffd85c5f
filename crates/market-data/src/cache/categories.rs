//! The cache categories used by the market feed.
//!
//! Each category is its own strongly typed [`CacheStore`] with an
//! independent TTL and capacity.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::store::{CacheStats, CacheStore};
use crate::models::{DiscoveryCriteria, HistoryRequest, PricePoint, TokenId, TokenInfo};
use crate::provider::duration_ms;

/// TTL and capacity of one category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySettings {
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub capacity: usize,
}

impl CategorySettings {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, capacity }
    }
}

/// Settings for every cache category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub prices: CategorySettings,
    pub volumes: CategorySettings,
    pub token_data: CategorySettings,
    pub historical: CategorySettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            prices: CategorySettings::new(Duration::from_secs(30), 1000),
            volumes: CategorySettings::new(Duration::from_secs(5 * 60), 1000),
            token_data: CategorySettings::new(Duration::from_secs(5 * 60), 16),
            historical: CategorySettings::new(Duration::from_secs(15 * 60), 500),
        }
    }
}

/// All cache categories, owned by one feed instance.
#[derive(Clone)]
pub struct MarketCaches {
    pub prices: CacheStore<TokenId, Decimal>,
    pub volumes: CacheStore<TokenId, Decimal>,
    pub token_data: CacheStore<DiscoveryCriteria, Vec<TokenInfo>>,
    pub historical: CacheStore<HistoryRequest, Vec<PricePoint>>,
}

impl MarketCaches {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            prices: CacheStore::new("prices", settings.prices.ttl, settings.prices.capacity),
            volumes: CacheStore::new("volumes", settings.volumes.ttl, settings.volumes.capacity),
            token_data: CacheStore::new(
                "tokenData",
                settings.token_data.ttl,
                settings.token_data.capacity,
            ),
            historical: CacheStore::new(
                "historicalData",
                settings.historical.ttl,
                settings.historical.capacity,
            ),
        }
    }

    /// Clear every category. In-flight fetches finish uncached.
    pub fn invalidate_all(&self) {
        self.prices.invalidate_all();
        self.volumes.invalidate_all();
        self.token_data.invalidate_all();
        self.historical.invalidate_all();
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![
            self.prices.stats(),
            self.volumes.stats(),
            self.token_data.stats(),
            self.historical.stats(),
        ]
    }
}

impl Default for MarketCaches {
    fn default() -> Self {
        Self::new(&CacheSettings::default())
    }
}
