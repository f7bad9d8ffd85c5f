//! TTL cache store with in-flight request coalescing.
//!
//! A [`CacheStore`] is one cache category: an LRU map of timestamped
//! entries plus a table of pending fetches. Concurrent callers asking for the
//! same absent key join the single pending fetch instead of issuing their own.
//!
//! Fetches run on their own Tokio task. A caller that gives up waiting does
//! not strand the other waiters, and the settlement bookkeeping (caching the
//! value, removing the pending record) always runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use serde::Serialize;
use tokio::time::Instant;

use super::lru::LruCache;
use crate::errors::MarketDataError;

/// Bounds for cache keys.
///
/// `Display` is used to name unresolved keys in batch results and logs.
pub trait CacheKey: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static {}

/// Bounds for cached values.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// A cached value with the moment it was stored and its lifetime.
///
/// Entries are never mutated; a refresh replaces the whole entry.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, stored_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            stored_at,
            ttl,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// An entry is fresh while its age does not exceed its TTL.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

/// Outcome of [`CacheStore::get_or_fetch_many`].
#[derive(Debug)]
pub struct BatchResult<K, V> {
    /// Keys served from cache, joined fetches, or the batched call.
    pub values: HashMap<K, V>,
    /// Keys that did not resolve, with the reason. Nothing is cached for them.
    pub unresolved: HashMap<K, MarketDataError>,
}

impl<K, V> Default for BatchResult<K, V> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            unresolved: HashMap::new(),
        }
    }
}

impl<K: CacheKey, V> BatchResult<K, V> {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn unresolved_keys(&self) -> Vec<K> {
        self.unresolved.keys().cloned().collect()
    }
}

/// Snapshot of one category's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub category: String,
    pub entries: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    /// Entries found but dropped because they outlived their TTL.
    pub expired: u64,
    /// Callers that joined an already pending fetch.
    pub coalesced: u64,
    /// Upstream fetches started (a batched call counts once).
    pub fetches: u64,
    pub evictions: u64,
    pub in_flight: usize,
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, MarketDataError>>>;

struct Pending<V> {
    /// Distinguishes this fetch from a later one for the same key
    /// started after an invalidation.
    id: u64,
    fetch: SharedFetch<V>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    coalesced: AtomicU64,
    fetches: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct StoreInner<K, V> {
    category: &'static str,
    ttl: Duration,
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    pending: Mutex<HashMap<K, Pending<V>>>,
    /// Bumped by `invalidate_all`; fetches started under an older
    /// generation settle without caching.
    generation: AtomicU64,
    next_fetch_id: AtomicU64,
    counters: Counters,
}

impl<K: CacheKey, V: CacheValue> StoreInner<K, V> {
    /// Lock the entries mutex, recovering from poison if necessary.
    fn lock_entries(&self) -> MutexGuard<'_, LruCache<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Cache '{}' entries mutex was poisoned, recovering", self.category);
            poisoned.into_inner()
        })
    }

    /// Lock the pending-fetch mutex, recovering from poison if necessary.
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<K, Pending<V>>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            warn!("Cache '{}' pending mutex was poisoned, recovering", self.category);
            poisoned.into_inner()
        })
    }

    /// Fresh value for `key`, dropping the entry if it has expired.
    /// Does not touch the hit/miss counters.
    fn lookup(&self, key: &K) -> Option<V> {
        let mut entries = self.lock_entries();
        match entries.get(key) {
            Some(entry) if entry.is_fresh(Instant::now()) => return Some(entry.value().clone()),
            Some(_) => {}
            None => return None,
        }
        entries.delete(key);
        Counters::bump(&self.counters.expired);
        None
    }

    fn store(&self, key: K, value: V) {
        let entry = CacheEntry::new(value, Instant::now(), self.ttl);
        let evicted = self.lock_entries().set(key, entry);
        if let Some((evicted_key, _)) = evicted {
            debug!("Cache '{}': evicted '{}'", self.category, evicted_key);
        }
    }

    fn next_fetch(&self) -> (u64, u64) {
        Counters::bump(&self.counters.fetches);
        (
            self.next_fetch_id.fetch_add(1, Ordering::Relaxed),
            self.generation.load(Ordering::SeqCst),
        )
    }

    /// Remove the pending record for `key` if it still belongs to fetch `id`.
    fn release(pending: &mut HashMap<K, Pending<V>>, key: &K, id: u64) {
        if pending.get(key).is_some_and(|p| p.id == id) {
            pending.remove(key);
        }
    }

    fn settle(&self, key: &K, id: u64, generation: u64, result: &Result<V, MarketDataError>) {
        let mut pending = self.lock_pending();
        match result {
            Ok(value) if self.generation.load(Ordering::SeqCst) == generation => {
                self.store(key.clone(), value.clone());
            }
            Ok(_) => {
                debug!(
                    "Cache '{}': discarding result for '{}' fetched before invalidation",
                    self.category, key
                );
            }
            Err(e) => {
                debug!("Cache '{}': fetch for '{}' failed: {}", self.category, key, e);
            }
        }
        Self::release(&mut pending, key, id);
    }

    fn settle_batch(
        &self,
        keys: &[K],
        id: u64,
        generation: u64,
        result: &Result<HashMap<K, V>, MarketDataError>,
    ) {
        let mut pending = self.lock_pending();
        match result {
            Ok(values) => {
                let current = self.generation.load(Ordering::SeqCst) == generation;
                let mut resolved = 0usize;
                for key in keys {
                    if let Some(value) = values.get(key) {
                        resolved += 1;
                        if current {
                            self.store(key.clone(), value.clone());
                        }
                    }
                }
                if resolved < keys.len() {
                    debug!(
                        "Cache '{}': batch fetch resolved {} of {} keys",
                        self.category,
                        resolved,
                        keys.len()
                    );
                }
            }
            Err(e) => {
                debug!(
                    "Cache '{}': batch fetch of {} keys failed: {}",
                    self.category,
                    keys.len(),
                    e
                );
            }
        }
        for key in keys {
            Self::release(&mut pending, key, id);
        }
    }

    fn start_fetch<Fut>(
        self: &Arc<Self>,
        pending: &mut HashMap<K, Pending<V>>,
        key: K,
        fut: Fut,
    ) -> SharedFetch<V>
    where
        Fut: Future<Output = Result<V, MarketDataError>> + Send + 'static,
    {
        let (id, generation) = self.next_fetch();

        let inner = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            inner.settle(&task_key, id, generation, &result);
            result
        });

        let inner = Arc::clone(self);
        let abort_key = key.clone();
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    Self::release(&mut inner.lock_pending(), &abort_key, id);
                    Err(MarketDataError::FetchAborted(join_error.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        pending.insert(
            key,
            Pending {
                id,
                fetch: fetch.clone(),
            },
        );
        fetch
    }

    fn start_batch_fetch<Fut>(
        self: &Arc<Self>,
        pending: &mut HashMap<K, Pending<V>>,
        keys: Vec<K>,
        fut: Fut,
    ) -> Vec<(K, SharedFetch<V>)>
    where
        Fut: Future<Output = Result<HashMap<K, V>, MarketDataError>> + Send + 'static,
    {
        let (id, generation) = self.next_fetch();

        let inner = Arc::clone(self);
        let task_keys = keys.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            inner.settle_batch(&task_keys, id, generation, &result);
            result
        });

        let inner = Arc::clone(self);
        let abort_keys = keys.clone();
        let batch = async move {
            match handle.await {
                Ok(result) => result.map(Arc::new),
                Err(join_error) => {
                    let mut pending = inner.lock_pending();
                    for key in &abort_keys {
                        Self::release(&mut pending, key, id);
                    }
                    Err(MarketDataError::FetchAborted(join_error.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        keys.into_iter()
            .map(|key| {
                let batch = batch.clone();
                let wanted = key.clone();
                let fetch = async move {
                    let values = batch.await?;
                    values
                        .get(&wanted)
                        .cloned()
                        .ok_or_else(|| MarketDataError::Unresolved {
                            key: wanted.to_string(),
                        })
                }
                .boxed()
                .shared();
                pending.insert(
                    key.clone(),
                    Pending {
                        id,
                        fetch: fetch.clone(),
                    },
                );
                (key, fetch)
            })
            .collect()
    }
}

/// One cache category: TTL entries in an LRU map plus request coalescing.
///
/// Cloning is cheap and yields a handle to the same store.
pub struct CacheStore<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K, V> Clone for CacheStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> {
    /// Create a store for `category` with its own TTL and capacity.
    pub fn new(category: &'static str, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                category,
                ttl,
                entries: Mutex::new(LruCache::new(capacity)),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                next_fetch_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn category(&self) -> &'static str {
        self.inner.category
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Fresh cached value for `key`, if any. Never triggers a fetch.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.lookup(key);
        let counter = if value.is_some() {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        Counters::bump(counter);
        value
    }

    /// Write a value directly, replacing any existing entry.
    pub fn insert(&self, key: K, value: V) {
        self.inner.store(key, value);
    }

    /// Return the fresh cached value for `key`, or fetch it.
    ///
    /// If a fetch for `key` is already pending, this call joins it and
    /// receives the identical outcome. Otherwise `fetch` is invoked exactly
    /// once; a successful result is cached, a failure is not.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, MarketDataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, MarketDataError>> + Send + 'static,
    {
        if let Some(value) = self.inner.lookup(&key) {
            Counters::bump(&self.inner.counters.hits);
            return Ok(value);
        }

        let shared = {
            let mut pending = self.inner.lock_pending();
            // A fetch may have settled between the lookup above and taking
            // the lock; settlement happens under this lock.
            if let Some(value) = self.inner.lookup(&key) {
                Counters::bump(&self.inner.counters.hits);
                return Ok(value);
            }
            Counters::bump(&self.inner.counters.misses);

            match pending.get(&key) {
                Some(existing) => {
                    Counters::bump(&self.inner.counters.coalesced);
                    debug!(
                        "Cache '{}': joining pending fetch for '{}'",
                        self.inner.category, key
                    );
                    existing.fetch.clone()
                }
                None => self.inner.start_fetch(&mut pending, key, fetch()),
            }
        };

        shared.await
    }

    /// Batched variant of [`get_or_fetch`](Self::get_or_fetch).
    ///
    /// Cached keys are served directly and keys with a pending fetch are
    /// joined. The remaining keys go to `batch_fetch` in a single call;
    /// only the keys it resolves are cached. Keys it leaves out, or all
    /// remaining keys when it fails, are reported in
    /// [`BatchResult::unresolved`] for the caller to retry individually.
    pub async fn get_or_fetch_many<F, Fut>(&self, keys: &[K], batch_fetch: F) -> BatchResult<K, V>
    where
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = Result<HashMap<K, V>, MarketDataError>> + Send + 'static,
    {
        let mut result = BatchResult::default();
        let mut seen = HashSet::with_capacity(keys.len());
        let mut remaining = Vec::new();

        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.inner.lookup(key) {
                Some(value) => {
                    Counters::bump(&self.inner.counters.hits);
                    result.values.insert(key.clone(), value);
                }
                None => remaining.push(key.clone()),
            }
        }

        let mut waits: Vec<(K, SharedFetch<V>)> = Vec::new();
        if !remaining.is_empty() {
            let mut pending = self.inner.lock_pending();
            let mut missing = Vec::new();

            for key in remaining {
                if let Some(value) = self.inner.lookup(&key) {
                    Counters::bump(&self.inner.counters.hits);
                    result.values.insert(key, value);
                    continue;
                }
                Counters::bump(&self.inner.counters.misses);
                match pending.get(&key) {
                    Some(existing) => {
                        Counters::bump(&self.inner.counters.coalesced);
                        waits.push((key, existing.fetch.clone()));
                    }
                    None => missing.push(key),
                }
            }

            if !missing.is_empty() {
                debug!(
                    "Cache '{}': batch fetching {} keys ({} joined)",
                    self.inner.category,
                    missing.len(),
                    waits.len()
                );
                let fut = batch_fetch(missing.clone());
                waits.extend(self.inner.start_batch_fetch(&mut pending, missing, fut));
            }
        }

        let outcomes = join_all(
            waits
                .into_iter()
                .map(|(key, fetch)| async move { (key, fetch.await) }),
        )
        .await;

        for (key, outcome) in outcomes {
            match outcome {
                Ok(value) => {
                    result.values.insert(key, value);
                }
                Err(e) => {
                    result.unresolved.insert(key, e);
                }
            }
        }
        result
    }

    /// Drop the cached entry for `key`. A pending fetch is left alone.
    pub fn invalidate(&self, key: &K) {
        self.inner.lock_entries().delete(key);
    }

    /// Drop every entry and forget pending fetches.
    ///
    /// Fetches already in flight run to completion and still answer their
    /// waiters, but their results are not cached.
    pub fn invalidate_all(&self) {
        let mut pending = self.inner.lock_pending();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let in_flight = pending.len();
        pending.clear();
        self.inner.lock_entries().clear();
        debug!(
            "Cache '{}': invalidated ({} fetches in flight)",
            self.inner.category, in_flight
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, capacity, evictions) = {
            let lru = self.inner.lock_entries();
            (lru.len(), lru.capacity(), lru.stats().evictions)
        };
        let counters = &self.inner.counters;
        CacheStats {
            category: self.inner.category.to_string(),
            entries,
            capacity,
            ttl_ms: self.inner.ttl.as_millis() as u64,
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            evictions,
            in_flight: self.in_flight(),
        }
    }
}
