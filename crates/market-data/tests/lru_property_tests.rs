//! Property-based tests for the LRU eviction primitive.
//!
//! Random operation sequences are replayed against both [`LruCache`] and a
//! naive recency list; the two must agree on every observable result.

use proptest::prelude::*;
use tokenpulse_market_data::LruCache;

// =============================================================================
// Generators
// =============================================================================

#[derive(Clone, Debug)]
enum Op {
    Get(u8),
    Set(u8, u32),
    Delete(u8),
}

/// Keys from a small domain so operations collide often.
fn arb_key() -> impl Strategy<Value = u8> {
    0u8..12
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => arb_key().prop_map(Op::Get),
        4 => (arb_key(), any::<u32>()).prop_map(|(k, v)| Op::Set(k, v)),
        1 => arb_key().prop_map(Op::Delete),
    ]
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(arb_op(), 0..200)
}

// =============================================================================
// Reference model
// =============================================================================

/// Recency list, least recent first.
struct Model {
    capacity: usize,
    entries: Vec<(u8, u32)>,
}

impl Model {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
        }
    }

    fn take(&mut self, key: u8) -> Option<(u8, u32)> {
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos))
    }

    fn get(&mut self, key: u8) -> Option<u32> {
        let entry = self.take(key)?;
        self.entries.push(entry);
        Some(entry.1)
    }

    fn set(&mut self, key: u8, value: u32) -> Option<(u8, u32)> {
        let existed = self.take(key).is_some();
        self.entries.push((key, value));
        if !existed && self.entries.len() > self.capacity {
            return Some(self.entries.remove(0));
        }
        None
    }

    fn delete(&mut self, key: u8) -> Option<u32> {
        self.take(key).map(|(_, v)| v)
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_matches_recency_model(capacity in 1usize..8, ops in arb_ops()) {
        let mut cache = LruCache::new(capacity);
        let mut model = Model::new(capacity);

        for op in ops {
            match op {
                Op::Get(k) => prop_assert_eq!(cache.get(&k).copied(), model.get(k)),
                Op::Set(k, v) => prop_assert_eq!(cache.set(k, v), model.set(k, v)),
                Op::Delete(k) => prop_assert_eq!(cache.delete(&k), model.delete(k)),
            }
            prop_assert_eq!(cache.len(), model.entries.len());
        }
    }

    #[test]
    fn prop_never_exceeds_capacity(capacity in 1usize..8, ops in arb_ops()) {
        let mut cache = LruCache::new(capacity);
        for op in ops {
            if let Op::Set(k, v) = op {
                cache.set(k, v);
            }
            prop_assert!(cache.len() <= cache.capacity());
        }
    }

    #[test]
    fn prop_last_written_key_survives(capacity in 1usize..8, ops in arb_ops(), key in arb_key(), value in any::<u32>()) {
        let mut cache = LruCache::new(capacity);
        for op in ops {
            if let Op::Set(k, v) = op {
                cache.set(k, v);
            }
        }
        cache.set(key, value);
        prop_assert_eq!(cache.peek(&key), Some(&value));
    }

    #[test]
    fn prop_evictions_count_overflowing_inserts(capacity in 1usize..8, keys in prop::collection::vec(arb_key(), 0..100)) {
        let mut cache = LruCache::new(capacity);
        let mut evicted = 0u64;
        for k in keys {
            if cache.set(k, 0u32).is_some() {
                evicted += 1;
            }
        }
        prop_assert_eq!(cache.stats().evictions, evicted);
    }
}
