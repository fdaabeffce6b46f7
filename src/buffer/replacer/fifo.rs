//! FIFO (First-In-First-Out) replacement policy.

use std::collections::{HashMap, VecDeque};

use crate::common::ChunkKey;

use super::EvictionPolicy;

/// Evicts keys in the order they were first tracked.
///
/// Re-access does not reorder. Removal is lazy: the queue keeps stale
/// `(seq, key)` entries and skips those whose sequence no longer matches.
pub struct FifoPolicy {
    next_seq: u64,
    /// Queue of (sequence, key) in insertion order (front = oldest).
    queue: VecDeque<(u64, ChunkKey)>,
    /// Live sequence per tracked key.
    live: HashMap<ChunkKey, u64>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            queue: VecDeque::new(),
            live: HashMap::new(),
        }
    }

    fn is_live(&self, seq: u64, key: &ChunkKey) -> bool {
        self.live.get(key) == Some(&seq)
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn record_access(&mut self, key: ChunkKey) {
        if !self.live.contains_key(&key) {
            self.next_seq += 1;
            self.live.insert(key, self.next_seq);
            self.queue.push_back((self.next_seq, key));
        }
    }

    fn remove(&mut self, key: &ChunkKey) {
        self.live.remove(key);
    }

    fn choose_victim(&mut self, evictable: &dyn Fn(&ChunkKey) -> bool) -> Option<ChunkKey> {
        // Drop stale entries at the front so the queue does not grow unbounded.
        while let Some((seq, key)) = self.queue.front() {
            if self.is_live(*seq, key) {
                break;
            }
            self.queue.pop_front();
        }
        self.queue
            .iter()
            .find(|(seq, key)| self.is_live(*seq, key) && evictable(key))
            .map(|(_, key)| *key)
    }

    fn len(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fragment: u32) -> ChunkKey {
        ChunkKey::new(1, 1, 1, fragment)
    }

    #[test]
    fn test_fifo_basic() {
        let mut fifo = FifoPolicy::new();
        fifo.record_access(key(0));
        fifo.record_access(key(1));
        fifo.record_access(key(2));
        assert_eq!(fifo.len(), 3);

        assert_eq!(fifo.choose_victim(&|_| true), Some(key(0)));
        fifo.remove(&key(0));
        assert_eq!(fifo.choose_victim(&|_| true), Some(key(1)));
        fifo.remove(&key(1));
        assert_eq!(fifo.choose_victim(&|_| true), Some(key(2)));
        fifo.remove(&key(2));
        assert_eq!(fifo.choose_victim(&|_| true), None);
    }

    #[test]
    fn test_fifo_skips_pinned() {
        let mut fifo = FifoPolicy::new();
        fifo.record_access(key(0));
        fifo.record_access(key(1));
        fifo.record_access(key(2));

        assert_eq!(fifo.choose_victim(&|k| *k == key(1)), Some(key(1)));
    }

    #[test]
    fn test_fifo_reaccess_no_reorder() {
        let mut fifo = FifoPolicy::new();
        fifo.record_access(key(0));
        fifo.record_access(key(1));
        fifo.record_access(key(0));

        assert_eq!(fifo.choose_victim(&|_| true), Some(key(0)));
    }

    #[test]
    fn test_fifo_readd_after_remove_goes_to_back() {
        let mut fifo = FifoPolicy::new();
        fifo.record_access(key(0));
        fifo.record_access(key(1));
        fifo.remove(&key(0));
        fifo.record_access(key(0));

        assert_eq!(fifo.choose_victim(&|_| true), Some(key(1)));
        assert_eq!(fifo.len(), 2);
    }
}
