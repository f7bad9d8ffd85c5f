//! Market data models
//!
//! This module contains the core data types for market data operations:
//! - `types` - Type aliases for common identifiers (ProviderId, TokenId)
//! - `token` - Token metadata returned by discovery (TokenInfo)
//! - `price` - Historical price points and candle intervals
//! - `request` - Request descriptors that double as cache keys

mod price;
mod request;
mod token;
mod types;

pub use price::{Interval, PricePoint};
pub use request::{DiscoveryCriteria, HistoryRequest};
pub use token::TokenInfo;
pub use types::{ProviderId, TokenId};
