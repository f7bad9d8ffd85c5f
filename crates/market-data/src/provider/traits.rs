//! Provider trait definitions.
//!
//! These are the seams between the acquisition engine and the outside
//! world. Every call may fail with a classified [`MarketDataError`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::errors::MarketDataError;
use crate::models::{DiscoveryCriteria, Interval, PricePoint, TokenId, TokenInfo};

use super::capabilities::RateLimit;

/// Trait for upstream price sources.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use tokenpulse_market_data::provider::{PriceProvider, RateLimit};
///
/// struct MyProvider {
///     api_key: String,
/// }
///
/// #[async_trait]
/// impl PriceProvider for MyProvider {
///     fn id(&self) -> &'static str {
///         "MY_PROVIDER"
///     }
///
///     fn rate_limit(&self) -> RateLimit {
///         RateLimit::per_minute(50)
///     }
///
///     // ... implement price methods
/// }
/// ```
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Unique identifier for this provider.
    ///
    /// Used for logging and to select the dispatcher's rate-limit window.
    fn id(&self) -> &'static str;

    /// Rate limiting configuration.
    fn rate_limit(&self) -> RateLimit {
        RateLimit::default()
    }

    /// Fetch the latest USD price for a token.
    async fn get_price(&self, id: &TokenId) -> Result<Decimal, MarketDataError>;

    /// Fetch prices for several tokens in one upstream call.
    ///
    /// Tokens the provider could not price are simply absent from the map;
    /// an `Err` means the whole call failed.
    async fn get_batch_prices(
        &self,
        ids: &[TokenId],
    ) -> Result<HashMap<TokenId, Decimal>, MarketDataError>;

    /// Fetch a historical series, ordered by timestamp ascending.
    async fn get_historical(
        &self,
        id: &TokenId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<Vec<PricePoint>, MarketDataError>;

    /// Fetch the `n` top tokens by the provider's own ranking.
    async fn get_top_tokens(&self, n: usize) -> Result<Vec<TokenInfo>, MarketDataError>;
}

/// Source of the qualifying token set for a cycle.
#[async_trait]
pub trait TokenDiscovery: Send + Sync {
    /// Identifier used for the dispatcher's rate-limit window.
    fn id(&self) -> &'static str;

    fn rate_limit(&self) -> RateLimit {
        RateLimit::default()
    }

    /// Return the tokens meeting `criteria`, at most `criteria.limit` of them.
    async fn discover(
        &self,
        criteria: &DiscoveryCriteria,
    ) -> Result<Vec<TokenInfo>, MarketDataError>;
}
