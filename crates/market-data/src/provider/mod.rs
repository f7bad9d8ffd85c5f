//! Market data provider abstractions.
//!
//! This module contains:
//! - The `PriceProvider` and `TokenDiscovery` traits consumed by the feed
//! - Provider rate limiting configuration
//! - `TopTokensDiscovery`, a discovery source built on any price provider
//!
//! Concrete HTTP providers live outside this crate. They report failures
//! through [`MarketDataError`](crate::errors::MarketDataError), typically via
//! `MarketDataError::from_status`, so the dispatcher can classify them.

mod capabilities;
mod discovery;
mod traits;

pub use capabilities::{duration_ms, RateLimit};
pub use discovery::TopTokensDiscovery;
pub use traits::{PriceProvider, TokenDiscovery};
