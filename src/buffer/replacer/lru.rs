//! LRU (Least Recently Used) replacement policy.

use std::collections::{BTreeMap, HashMap};

use crate::common::ChunkKey;

use super::EvictionPolicy;

/// Evicts the key whose last access is oldest.
///
/// Every access takes the next value of a monotonic tick, so two keys never
/// share a position and ties cannot occur.
pub struct LruPolicy {
    tick: u64,
    /// tick → key, oldest first.
    order: BTreeMap<u64, ChunkKey>,
    ticks: HashMap<ChunkKey, u64>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            tick: 0,
            order: BTreeMap::new(),
            ticks: HashMap::new(),
        }
    }

    /// Tracked keys from least to most recently used.
    pub fn keys_in_order(&self) -> impl Iterator<Item = &ChunkKey> {
        self.order.values()
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn record_access(&mut self, key: ChunkKey) {
        self.tick += 1;
        if let Some(old) = self.ticks.insert(key, self.tick) {
            self.order.remove(&old);
        }
        self.order.insert(self.tick, key);
    }

    fn remove(&mut self, key: &ChunkKey) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
    }

    fn choose_victim(&mut self, evictable: &dyn Fn(&ChunkKey) -> bool) -> Option<ChunkKey> {
        self.order.values().find(|key| evictable(key)).copied()
    }

    fn len(&self) -> usize {
        self.ticks.len()
    }
}
