//! Foreign Storage Cache - materialized chunks of foreign tables.
//!
//! Holds chunks decoded by data wrappers so repeated scans of a foreign
//! table skip the external source. Memory is bounded in bytes; entries
//! pushed out go to an optional spill directory and are promoted back on
//! their next hit.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::buffer::replacer::{new_policy, EvictionPolicy};
use crate::common::config::ForeignCacheConfig;
use crate::common::{ChunkKey, Result};

use super::entry::ForeignChunk;
use super::spill::SpillStore;
use super::stats::ForeignCacheStats;

struct CacheState {
    entries: HashMap<ChunkKey, ForeignChunk>,
    policy: Box<dyn EvictionPolicy>,
    used_bytes: usize,
}

/// One wrapper fetch in progress. Followers block on `done`.
struct InflightFetch {
    state: Mutex<FetchState>,
    done: Condvar,
}

struct FetchState {
    loading: bool,
    result: Option<ForeignChunk>,
    /// Set when the key or its table was invalidated mid-fetch.
    invalidated: bool,
    /// Sources invalidated mid-fetch.
    stale_sources: Vec<String>,
}

impl InflightFetch {
    fn new() -> Self {
        Self {
            state: Mutex::new(FetchState {
                loading: true,
                result: None,
                invalidated: false,
                stale_sources: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: Option<ForeignChunk>) {
        {
            let mut state = self.state.lock();
            state.loading = false;
            state.result = result;
        }
        self.done.notify_all();
    }

    fn invalidate(&self) {
        self.state.lock().invalidated = true;
    }

    fn invalidate_source(&self, source_path: &str) {
        self.state.lock().stale_sources.push(source_path.to_owned());
    }

    /// Whether `chunk` is still current after whatever was invalidated
    /// while it was being fetched.
    fn is_current(&self, chunk: &ForeignChunk) -> bool {
        let state = self.state.lock();
        !state.invalidated
            && !state
                .stale_sources
                .iter()
                .any(|path| *path == chunk.provenance.source_path)
    }

    /// Block until the leader finishes. `None` if its fetch failed or its
    /// result went stale.
    fn wait(&self) -> Option<ForeignChunk> {
        let mut state = self.state.lock();
        while state.loading {
            self.done.wait(&mut state);
        }
        state.result.clone()
    }
}

enum FetchRole {
    Leader(Arc<InflightFetch>),
    Follower(Arc<InflightFetch>),
}

/// Completes the leader's slot on every exit path, unwinding included.
struct SlotRelease<'a> {
    inflight: &'a Mutex<HashMap<ChunkKey, Arc<InflightFetch>>>,
    key: ChunkKey,
    slot: Arc<InflightFetch>,
    result: Option<ForeignChunk>,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
        self.slot.complete(self.result.take());
    }
}

/// Byte-bounded cache of foreign chunks with optional disk spill.
///
/// # Thread Safety
/// - `state`: one `Mutex` for entries, eviction order and byte count
/// - `spill`: its own `Mutex`; never acquired before `state`
/// - `inflight`: per-key fetch slots for [`get_or_fetch`](Self::get_or_fetch)
///
/// Spill I/O runs with `state` released. Spill failures degrade to misses
/// and are logged, never returned.
pub struct ForeignStorageCache {
    config: ForeignCacheConfig,
    state: Mutex<CacheState>,
    spill: Option<Mutex<SpillStore>>,
    inflight: Mutex<HashMap<ChunkKey, Arc<InflightFetch>>>,
    stats: ForeignCacheStats,
}

impl ForeignStorageCache {
    /// Create a cache, preparing the spill directory if one is configured.
    ///
    /// # Errors
    /// - `Error::InvalidConfig` for a zero budget
    /// - `Error::Io` if the spill directory cannot be prepared
    pub fn new(config: ForeignCacheConfig) -> Result<Self> {
        config.validate()?;
        let spill = match &config.spill {
            Some(spill) => Some(Mutex::new(SpillStore::open(spill)?)),
            None => None,
        };
        let policy = new_policy(config.policy);
        debug!(
            max_bytes = config.max_bytes,
            spill = spill.is_some(),
            "foreign storage cache ready"
        );
        Ok(Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                policy,
                used_bytes: 0,
            }),
            spill,
            inflight: Mutex::new(HashMap::new()),
            stats: ForeignCacheStats::new(),
        })
    }

    // ========================================================================
    // Public API: lookup and insertion
    // ========================================================================

    /// Cached chunk for `key`, from memory or the spill store.
    ///
    /// A spill hit is promoted back into memory when it fits the budget.
    pub fn get(&self, key: &ChunkKey) -> Option<ForeignChunk> {
        if let Some(chunk) = self.lookup_memory(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(chunk);
        }
        if let Some(chunk) = self.load_spilled(key) {
            self.stats.spill_hits.fetch_add(1, Ordering::Relaxed);
            return Some(chunk);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace the entry for `key`.
    ///
    /// Least recently used entries are evicted (and spilled) while the
    /// memory budget is exceeded. A chunk larger than the whole budget is
    /// not admitted to memory; it goes straight to the spill store if
    /// there is room there.
    pub fn put(&self, key: ChunkKey, chunk: ForeignChunk) {
        self.drop_spilled(&key);
        if chunk.len() > self.config.max_bytes {
            self.remove_memory(&key);
            debug!(key = %key, bytes = chunk.len(), "chunk exceeds cache budget");
            self.spill_entry(key, &chunk);
            return;
        }
        self.admit(key, chunk, true);
    }

    /// Return the cached chunk or run `fetch` to produce it.
    ///
    /// Concurrent misses on one key run `fetch` once: the first caller
    /// fetches while the others wait and share its result. If the fetch
    /// fails its error goes to the fetching caller and one waiter retries.
    ///
    /// A fetch overtaken by an invalidation of its key, table or source
    /// still answers its own caller but is not cached; waiters refetch.
    pub fn get_or_fetch<F>(&self, key: ChunkKey, fetch: F) -> Result<ForeignChunk>
    where
        F: FnOnce() -> Result<ForeignChunk>,
    {
        loop {
            if let Some(chunk) = self.get(&key) {
                return Ok(chunk);
            }

            match self.claim_slot(key) {
                FetchRole::Follower(slot) => {
                    trace!(key = %key, "waiting for fetch in flight");
                    if let Some(chunk) = slot.wait() {
                        return Ok(chunk);
                    }
                }
                FetchRole::Leader(slot) => {
                    let mut release = SlotRelease {
                        inflight: &self.inflight,
                        key,
                        slot,
                        result: None,
                    };
                    if let Some(chunk) = self.lookup_memory(&key) {
                        release.result = Some(chunk.clone());
                        return Ok(chunk);
                    }

                    self.stats.fetches.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "fetching foreign chunk");
                    match fetch() {
                        Ok(chunk) => {
                            if release.slot.is_current(&chunk) {
                                self.put(key, chunk.clone());
                                release.result = Some(chunk.clone());
                            } else {
                                debug!(key = %key, "chunk invalidated during fetch, not cached");
                            }
                            return Ok(chunk);
                        }
                        Err(e) => {
                            self.stats.failed_fetches.fetch_add(1, Ordering::Relaxed);
                            warn!(key = %key, error = %e, "foreign fetch failed");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Public API: invalidation
    // ========================================================================

    /// Drop `key` from memory and spill. Returns whether it was cached.
    pub fn invalidate(&self, key: &ChunkKey) -> bool {
        if let Some(slot) = self.inflight.lock().get(key) {
            slot.invalidate();
        }
        let in_memory = self.remove_memory(key);
        let spilled = self.drop_spilled(key);
        in_memory || spilled
    }

    /// Drop every chunk of a table. Returns the number of keys dropped.
    pub fn invalidate_table(&self, db_id: u32, table_id: u32) -> usize {
        for (key, slot) in self.inflight.lock().iter() {
            if key.belongs_to_table(db_id, table_id) {
                slot.invalidate();
            }
        }
        self.invalidate_where(|key, _| key.belongs_to_table(db_id, table_id))
    }

    /// Drop every chunk fetched from `source_path`, e.g. after the external
    /// file was rewritten.
    pub fn invalidate_source(&self, source_path: &str) -> usize {
        for slot in self.inflight.lock().values() {
            slot.invalidate_source(source_path);
        }
        let dropped = self.invalidate_where(|_, path| path == source_path);
        debug!(source = source_path, chunks = dropped, "invalidated foreign source");
        dropped
    }

    // ========================================================================
    // Public API: introspection
    // ========================================================================

    pub fn config(&self) -> &ForeignCacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &ForeignCacheStats {
        &self.stats
    }

    /// Payload bytes held in memory.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    /// Entries held in memory.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is in memory. Does not count as an access.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Entries held in the spill store.
    pub fn spilled_len(&self) -> usize {
        self.spill.as_ref().map_or(0, |spill| spill.lock().len())
    }

    /// Bytes of spill files on disk.
    pub fn spilled_bytes(&self) -> u64 {
        self.spill.as_ref().map_or(0, |spill| spill.lock().used_bytes())
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn claim_slot(&self, key: ChunkKey) -> FetchRole {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            return FetchRole::Follower(Arc::clone(existing));
        }
        let slot = Arc::new(InflightFetch::new());
        inflight.insert(key, Arc::clone(&slot));
        FetchRole::Leader(slot)
    }

    fn lookup_memory(&self, key: &ChunkKey) -> Option<ForeignChunk> {
        let mut state = self.state.lock();
        let chunk = state.entries.get(key).cloned()?;
        state.policy.record_access(*key);
        Some(chunk)
    }

    fn load_spilled(&self, key: &ChunkKey) -> Option<ForeignChunk> {
        let spill = self.spill.as_ref()?;
        let loaded = spill.lock().load(key);
        let chunk = match loaded {
            Ok(chunk) => chunk?,
            Err(e) => {
                warn!(key = %key, error = %e, "spill read failed");
                return None;
            }
        };

        if chunk.len() <= self.config.max_bytes {
            self.drop_spilled(key);
            self.admit(*key, chunk.clone(), false);
            trace!(key = %key, bytes = chunk.len(), "promoted spilled chunk");
        }
        Some(chunk)
    }

    /// Insert into memory, then evict down to budget. With `replace` unset
    /// an existing entry wins.
    fn admit(&self, key: ChunkKey, chunk: ForeignChunk, replace: bool) {
        let evicted = {
            let mut state = self.state.lock();
            if !replace && state.entries.contains_key(&key) {
                return;
            }
            let bytes = chunk.len();
            if let Some(previous) = state.entries.insert(key, chunk) {
                state.used_bytes -= previous.len();
            }
            state.used_bytes += bytes;
            state.policy.record_access(key);

            let mut evicted = Vec::new();
            while state.used_bytes > self.config.max_bytes {
                let Some(victim) = state.policy.choose_victim(&|k: &ChunkKey| *k != key) else {
                    break;
                };
                state.policy.remove(&victim);
                if let Some(old) = state.entries.remove(&victim) {
                    state.used_bytes -= old.len();
                    evicted.push((victim, old));
                }
            }
            evicted
        };

        for (victim, chunk) in evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, bytes = chunk.len(), "evicted foreign chunk");
            self.spill_entry(victim, &chunk);
        }
    }

    fn remove_memory(&self, key: &ChunkKey) -> bool {
        let mut state = self.state.lock();
        state.policy.remove(key);
        match state.entries.remove(key) {
            Some(old) => {
                state.used_bytes -= old.len();
                true
            }
            None => false,
        }
    }

    fn spill_entry(&self, key: ChunkKey, chunk: &ForeignChunk) {
        let Some(spill) = &self.spill else {
            return;
        };
        let stored = spill.lock().store(key, chunk);
        match stored {
            Ok(true) => {
                self.stats.spills.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => debug!(key = %key, bytes = chunk.len(), "chunk exceeds spill budget"),
            Err(e) => warn!(key = %key, error = %e, "spill write failed"),
        }
    }

    fn drop_spilled(&self, key: &ChunkKey) -> bool {
        let Some(spill) = &self.spill else {
            return false;
        };
        let removed = spill.lock().remove(key);
        removed.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "spill remove failed");
            false
        })
    }

    fn invalidate_where(&self, pred: impl Fn(&ChunkKey, &str) -> bool) -> usize {
        let mut dropped: BTreeSet<ChunkKey> = {
            let mut state = self.state.lock();
            let doomed: Vec<ChunkKey> = state
                .entries
                .iter()
                .filter(|(key, chunk)| pred(*key, chunk.provenance.source_path.as_str()))
                .map(|(key, _)| *key)
                .collect();
            for key in &doomed {
                state.policy.remove(key);
                if let Some(old) = state.entries.remove(key) {
                    state.used_bytes -= old.len();
                }
            }
            doomed.into_iter().collect()
        };

        if let Some(spill) = &self.spill {
            let mut spill = spill.lock();
            for key in spill.keys_where(&pred) {
                if let Err(e) = spill.remove(&key) {
                    warn!(key = %key, error = %e, "spill remove failed");
                }
                dropped.insert(key);
            }
        }
        dropped.len()
    }
}

impl std::fmt::Debug for ForeignStorageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignStorageCache")
            .field("max_bytes", &self.config.max_bytes)
            .field("used_bytes", &self.used_bytes())
            .field("entries", &self.len())
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}
