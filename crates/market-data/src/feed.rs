//! Market feed: cached, dispatched access to upstream market data.
//!
//! The feed maps every data kind to a cache category and a dispatch
//! priority:
//!
//! | Data            | Cache category   | Priority |
//! |-----------------|------------------|----------|
//! | single price    | `prices`         | High     |
//! | batched prices  | `prices`         | Medium   |
//! | token discovery | `tokenData`      | Medium   |
//! | history series  | `historicalData` | Low      |
//!
//! A cache miss becomes a dispatcher request; concurrent misses for one key
//! share a single request.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use rust_decimal::Decimal;

use crate::cache::{BatchResult, CacheSettings, CacheStats, MarketCaches};
use crate::dispatcher::{DispatcherSettings, Priority, RequestDispatcher};
use crate::errors::MarketDataError;
use crate::models::{DiscoveryCriteria, HistoryRequest, PricePoint, ProviderId, TokenId, TokenInfo};
use crate::provider::{PriceProvider, TokenDiscovery};

/// Facade over the caches, the dispatcher and the provider collaborators.
pub struct MarketFeed {
    provider: Arc<dyn PriceProvider>,
    discovery: Arc<dyn TokenDiscovery>,
    provider_id: ProviderId,
    discovery_id: ProviderId,
    dispatcher: RequestDispatcher,
    caches: MarketCaches,
}

impl MarketFeed {
    /// Create a feed over an existing dispatcher and cache set.
    ///
    /// Registers the rate limits of both collaborators with the dispatcher.
    pub fn new(
        provider: Arc<dyn PriceProvider>,
        discovery: Arc<dyn TokenDiscovery>,
        dispatcher: RequestDispatcher,
        caches: MarketCaches,
    ) -> Self {
        let provider_id: ProviderId = Cow::Borrowed(provider.id());
        let discovery_id: ProviderId = Cow::Borrowed(discovery.id());

        dispatcher.register_provider(provider_id.clone(), &provider.rate_limit());
        if discovery_id != provider_id {
            dispatcher.register_provider(discovery_id.clone(), &discovery.rate_limit());
        }

        info!(
            "Market feed ready (prices via '{}', discovery via '{}')",
            provider_id, discovery_id
        );

        Self {
            provider,
            discovery,
            provider_id,
            discovery_id,
            dispatcher,
            caches,
        }
    }

    /// Create a feed with a fresh dispatcher and cache set.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_settings(
        provider: Arc<dyn PriceProvider>,
        discovery: Arc<dyn TokenDiscovery>,
        cache_settings: &CacheSettings,
        dispatcher_settings: DispatcherSettings,
    ) -> Self {
        Self::new(
            provider,
            discovery,
            RequestDispatcher::start(dispatcher_settings),
            MarketCaches::new(cache_settings),
        )
    }

    /// Latest price of one token.
    pub async fn price(&self, id: &TokenId) -> Result<Decimal, MarketDataError> {
        let provider = Arc::clone(&self.provider);
        let dispatcher = self.dispatcher.clone();
        let provider_id = self.provider_id.clone();
        let token = id.clone();

        self.caches
            .prices
            .get_or_fetch(id.clone(), move || {
                let label = format!("price:{token}");
                dispatcher.enqueue(&provider_id, Priority::High, label, move || {
                    let provider = Arc::clone(&provider);
                    let token = token.clone();
                    async move { provider.get_price(&token).await }
                })
            })
            .await
    }

    /// Prices of several tokens through one batched upstream call.
    ///
    /// Keys the batch could not resolve are reported, not retried.
    pub async fn batch_prices(&self, ids: &[TokenId]) -> BatchResult<TokenId, Decimal> {
        let provider = Arc::clone(&self.provider);
        let dispatcher = self.dispatcher.clone();
        let provider_id = self.provider_id.clone();

        self.caches
            .prices
            .get_or_fetch_many(ids, move |missing| {
                let label = format!("prices:{}", missing.len());
                dispatcher.enqueue(&provider_id, Priority::Medium, label, move || {
                    let provider = Arc::clone(&provider);
                    let missing = missing.clone();
                    async move { provider.get_batch_prices(&missing).await }
                })
            })
            .await
    }

    /// Prices of several tokens.
    ///
    /// Uses one batched call, then retries the unresolved tokens one by one.
    /// Tokens that still fail are logged and left out of the result.
    pub async fn prices(&self, ids: &[TokenId]) -> HashMap<TokenId, Decimal> {
        let batch = self.batch_prices(ids).await;
        if batch.is_complete() {
            return batch.values;
        }

        let mut prices = batch.values;
        debug!(
            "Retrying {} unresolved tokens individually",
            batch.unresolved.len()
        );
        let retries = batch.unresolved.into_keys().map(|id| async move {
            let outcome = self.price(&id).await;
            (id, outcome)
        });

        for (id, outcome) in join_all(retries).await {
            match outcome {
                Ok(price) => {
                    prices.insert(id, price);
                }
                Err(e) => warn!("No price for '{}': {}", id, e),
            }
        }
        prices
    }

    /// Historical series for `request`, ending now.
    pub async fn historical(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<PricePoint>, MarketDataError> {
        let provider = Arc::clone(&self.provider);
        let dispatcher = self.dispatcher.clone();
        let provider_id = self.provider_id.clone();
        let key = request.clone();

        self.caches
            .historical
            .get_or_fetch(request.clone(), move || {
                let (start, end) = key.range(Utc::now());
                let label = format!("history:{key}");
                dispatcher.enqueue(&provider_id, Priority::Low, label, move || {
                    let provider = Arc::clone(&provider);
                    let token = key.token.clone();
                    let interval = key.interval;
                    async move { provider.get_historical(&token, start, end, interval).await }
                })
            })
            .await
    }

    /// Tokens meeting `criteria`.
    ///
    /// A fresh discovery result also seeds the volume cache.
    pub async fn discover_tokens(
        &self,
        criteria: &DiscoveryCriteria,
    ) -> Result<Vec<TokenInfo>, MarketDataError> {
        let discovery = Arc::clone(&self.discovery);
        let dispatcher = self.dispatcher.clone();
        let discovery_id = self.discovery_id.clone();
        let volumes = self.caches.volumes.clone();
        let key = criteria.clone();

        self.caches
            .token_data
            .get_or_fetch(criteria.clone(), move || {
                let label = format!("discover:{key}");
                let request = dispatcher.enqueue(&discovery_id, Priority::Medium, label, move || {
                    let discovery = Arc::clone(&discovery);
                    let criteria = key.clone();
                    async move { discovery.discover(&criteria).await }
                });
                async move {
                    let tokens = request.await?;
                    for token in &tokens {
                        volumes.insert(token.id.clone(), token.volume_24h);
                    }
                    Ok(tokens)
                }
            })
            .await
    }

    /// Cached 24h volume of a token, as last reported by discovery.
    pub fn volume(&self, id: &TokenId) -> Option<Decimal> {
        self.caches.volumes.get(id)
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.caches.stats()
    }

    /// Drop every cached value. In-flight fetches finish uncached.
    pub fn clear_caches(&self) {
        info!("Clearing market data caches");
        self.caches.invalidate_all();
    }

    pub fn caches(&self) -> &MarketCaches {
        &self.caches
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }
}
