//! TokenPulse Market Data Crate
//!
//! This crate provides cached, rate-limited access to upstream token market
//! data for the TokenPulse cycle engine.
//!
//! # Overview
//!
//! The market data crate supports:
//! - Size-bounded LRU storage with per-category TTL caching
//! - Coalescing of concurrent fetches for the same key
//! - Per-provider sliding-window rate limiting with priority lanes
//! - Retry of transient failures with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   Cycle Engine   |  (tokenpulse-core)
//! +------------------+
//!          |
//!          v
//! +------------------+     +------------------+
//! |    MarketFeed    | --> |   MarketCaches   |  (TTL + coalescing)
//! +------------------+     +------------------+
//!          |  miss
//!          v
//! +-------------------+
//! | RequestDispatcher |  (priority lanes, rate limits, retries)
//! +-------------------+
//!          |
//!          v
//! +------------------+
//! |  PriceProvider   |  (external HTTP source)
//! +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`MarketFeed`] - Facade used by the cycle engine
//! - [`CacheStore`] - One TTL cache category
//! - [`RequestDispatcher`] - Outbound request executor
//! - [`PriceProvider`] / [`TokenDiscovery`] - Upstream collaborator traits
//! - [`MarketDataError`] - Classified error type
//!
//! # Type Aliases
//!
//! - [`ProviderId`] - Provider identifier (e.g., "DEXSCREENER")
//! - [`TokenId`] - Token identifier

pub mod cache;
pub mod dispatcher;
pub mod errors;
pub mod feed;
pub mod models;
pub mod provider;

pub use errors::{MarketDataError, RetryClass};

// Re-export all public types from models
pub use models::{
    DiscoveryCriteria, HistoryRequest, Interval, PricePoint, ProviderId, TokenId, TokenInfo,
};

// Re-export cache types
pub use cache::{
    BatchResult, CacheSettings, CacheStats, CacheStore, CategorySettings, LruCache, MarketCaches,
};

// Re-export dispatcher types
pub use dispatcher::{DispatcherSettings, DispatcherStats, Priority, RequestDispatcher, RetryPolicy};

// Re-export provider types
pub use provider::{PriceProvider, RateLimit, TokenDiscovery, TopTokensDiscovery};

pub use feed::MarketFeed;
