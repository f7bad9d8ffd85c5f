use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::errors::MarketDataError;
use crate::models::{DiscoveryCriteria, TokenInfo};

use super::capabilities::RateLimit;
use super::traits::{PriceProvider, TokenDiscovery};

/// Over-fetch factor applied to `get_top_tokens` before filtering, so that
/// tokens dropped by the thresholds don't leave the result short.
const OVERFETCH_FACTOR: usize = 2;

/// Discovery backed by a price provider's top-token ranking.
///
/// Fetches the provider's top list and keeps the tokens that meet the
/// liquidity and volume thresholds, preserving the provider's order.
pub struct TopTokensDiscovery {
    provider: Arc<dyn PriceProvider>,
}

impl TopTokensDiscovery {
    pub fn new(provider: Arc<dyn PriceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TokenDiscovery for TopTokensDiscovery {
    fn id(&self) -> &'static str {
        self.provider.id()
    }

    fn rate_limit(&self) -> RateLimit {
        self.provider.rate_limit()
    }

    async fn discover(
        &self,
        criteria: &DiscoveryCriteria,
    ) -> Result<Vec<TokenInfo>, MarketDataError> {
        let requested = criteria.limit.saturating_mul(OVERFETCH_FACTOR);
        let candidates = self.provider.get_top_tokens(requested).await?;
        let total = candidates.len();

        let qualified: Vec<TokenInfo> = candidates
            .into_iter()
            .filter(|token| criteria.accepts(token))
            .take(criteria.limit)
            .collect();

        debug!(
            "Discovery via '{}': {} of {} top tokens qualified ({})",
            self.provider.id(),
            qualified.len(),
            total,
            criteria
        );
        Ok(qualified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::models::{Interval, PricePoint, TokenId};

    struct RankedProvider {
        tokens: Vec<TokenInfo>,
        requested: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl PriceProvider for RankedProvider {
        fn id(&self) -> &'static str {
            "RANKED"
        }

        async fn get_price(&self, id: &TokenId) -> Result<Decimal, MarketDataError> {
            Err(MarketDataError::NotFound(id.to_string()))
        }

        async fn get_batch_prices(
            &self,
            _ids: &[TokenId],
        ) -> Result<HashMap<TokenId, Decimal>, MarketDataError> {
            Ok(HashMap::new())
        }

        async fn get_historical(
            &self,
            _id: &TokenId,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _interval: Interval,
        ) -> Result<Vec<PricePoint>, MarketDataError> {
            Ok(Vec::new())
        }

        async fn get_top_tokens(&self, n: usize) -> Result<Vec<TokenInfo>, MarketDataError> {
            self.requested.lock().unwrap().push(n);
            Ok(self.tokens.iter().take(n).cloned().collect())
        }
    }

    #[tokio::test]
    async fn test_filters_by_thresholds_and_limit() {
        let provider = Arc::new(RankedProvider {
            tokens: vec![
                TokenInfo::new("a", "A", dec!(100), dec!(100)),
                TokenInfo::new("b", "B", dec!(5), dec!(100)),
                TokenInfo::new("c", "C", dec!(100), dec!(100)),
                TokenInfo::new("d", "D", dec!(100), dec!(100)),
            ],
            requested: Mutex::new(Vec::new()),
        });
        let discovery = TopTokensDiscovery::new(provider.clone());
        let criteria = DiscoveryCriteria {
            min_liquidity_usd: dec!(50),
            min_volume_24h: dec!(50),
            limit: 2,
        };

        let tokens = discovery.discover(&criteria).await.unwrap();
        let ids: Vec<&str> = tokens.iter().map(|t| t.id.as_ref()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(*provider.requested.lock().unwrap(), vec![4]);
        assert_eq!(discovery.id(), "RANKED");
    }
}
