//! Eviction policy implementations (replacers).
//!
//! - [`LruPolicy`] - least recently used; the default for every cache
//! - [`FifoPolicy`] - insertion order, ignores re-access
//!
//! Callers own the notion of "evictable" (pins, dirty state, placeholders)
//! and pass it to [`EvictionPolicy::choose_victim`] as a predicate.

mod fifo;
mod lru;

pub use fifo::FifoPolicy;
pub use lru::LruPolicy;

use crate::common::config::PolicyKind;
use crate::common::ChunkKey;

/// Victim selection for a cache keyed by [`ChunkKey`].
pub trait EvictionPolicy: Send {
    /// Record a use of `key`, tracking it if new.
    fn record_access(&mut self, key: ChunkKey);

    /// Stop tracking `key`.
    fn remove(&mut self, key: &ChunkKey);

    /// First tracked key, in eviction order, for which `evictable` holds.
    ///
    /// The key stays tracked; callers `remove` it once it is actually evicted.
    fn choose_victim(&mut self, evictable: &dyn Fn(&ChunkKey) -> bool) -> Option<ChunkKey>;

    /// Number of tracked keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the policy named by `kind`.
pub fn new_policy(kind: PolicyKind) -> Box<dyn EvictionPolicy> {
    match kind {
        PolicyKind::Lru => Box::new(LruPolicy::new()),
        PolicyKind::Fifo => Box::new(FifoPolicy::new()),
    }
}
