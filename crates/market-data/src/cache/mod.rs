//! Caching module.
//!
//! This module provides:
//! - [`LruCache`]: the size-bounded eviction primitive
//! - [`CacheStore`]: one TTL cache category with request coalescing
//! - [`MarketCaches`]: the set of categories used by the market feed

mod categories;
mod lru;
mod store;

pub use categories::{CacheSettings, CategorySettings, MarketCaches};
pub use lru::{LruCache, LruStats};
pub use store::{BatchResult, CacheEntry, CacheKey, CacheStats, CacheStore, CacheValue};
