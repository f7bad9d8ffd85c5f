//! Token metadata returned by discovery providers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::types::TokenId;

/// A tradable token as reported by a discovery source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    /// Canonical token identifier
    pub id: TokenId,

    /// Ticker symbol (e.g., "BONK")
    pub symbol: String,

    /// Display name
    pub name: String,

    /// Last known USD price, when the source reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<Decimal>,

    /// Pool liquidity in USD
    pub liquidity_usd: Decimal,

    /// Trailing 24h traded volume in USD
    pub volume_24h: Decimal,
}

impl TokenInfo {
    /// Create a token with the fields discovery filtering relies on.
    pub fn new(
        id: impl Into<TokenId>,
        symbol: impl Into<String>,
        liquidity_usd: Decimal,
        volume_24h: Decimal,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            id: id.into(),
            name: symbol.clone(),
            symbol,
            price_usd: None,
            liquidity_usd,
            volume_24h,
        }
    }

    /// Builder method to attach a price.
    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price_usd = Some(price);
        self
    }
}
