//! Tier Manager - the cache engine of one memory tier.
//!
//! The [`TierManager`] provides:
//! - Buffer creation on a slab allocator with a hard capacity
//! - Pin-based reference counting through [`BufferHandle`]
//! - Least-recently-unpinned eviction with flush-before-reclaim
//! - Placeholder population so each key is filled at most once at a time
//! - Cross-tier copies for CPU/GPU staging

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::buffer::buffer::{Buffer, BufferStatus};
use crate::buffer::memory::{HostMemory, MemoryBackend, SimulatedDeviceMemory};
use crate::buffer::replacer::{new_policy, EvictionPolicy};
use crate::buffer::slab::{Extent, SlabSet};
use crate::buffer::summary::{MemorySummary, SegmentSummary, SlabSummary};
use crate::buffer::{BufferHandle, TierStats};
use crate::common::config::TierConfig;
use crate::common::{ChunkKey, EncodingMetadata, Error, Result, TierId};

/// Durable destination for dirty buffers.
///
/// Called with the tier lock held; implementations must not call back
/// into any tier manager.
pub trait FlushTarget: Send + Sync {
    fn flush_chunk(&self, key: &ChunkKey, data: &[u8], encoding: EncodingMetadata) -> Result<()>;
}

struct TierState {
    slabs: SlabSet,
    buffers: HashMap<ChunkKey, Arc<Buffer>>,
    policy: Box<dyn EvictionPolicy>,
}

/// Owns every buffer of one tier.
///
/// # Architecture
/// ```text
/// ┌──────────────────────────── TierManager ────────────────────────────┐
/// │  state: Mutex<TierState>                                            │
/// │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐   │
/// │  │ buffers          │  │ slabs            │  │ policy           │   │
/// │  │ key → Arc<Buffer>│─▶│ extents per slab │  │ LRU / FIFO order │   │
/// │  └──────────────────┘  └──────────────────┘  └──────────────────┘   │
/// │  populated: Condvar      memory: Arc<dyn MemoryBackend>             │
/// │  flush_target: Option<Arc<dyn FlushTarget>>                         │
/// └─────────────────────────────────────────────────────────────────────┘
/// ```
///
/// # Thread Safety
/// - `state`: one `Mutex` for all metadata (buffer map, free segments, order)
/// - `populated`: `Condvar` woken when a placeholder resolves
/// - buffer contents: guarded per buffer, never under the tier lock except
///   for relocation and dirty-victim flushes
/// - `stats`: atomic counters
///
/// Lock order is tier state, then buffer metadata, then flush target, then
/// memory backend.
pub struct TierManager {
    id: TierId,
    config: TierConfig,
    memory: Arc<dyn MemoryBackend>,
    state: Mutex<TierState>,
    populated: Condvar,
    flush_target: Option<Arc<dyn FlushTarget>>,
    stats: TierStats,
}

impl TierManager {
    /// Create a tier over `memory`.
    ///
    /// # Errors
    /// `Error::InvalidConfig` if the config is invalid or asks for more than
    /// the backend's hard limit.
    pub fn new(config: TierConfig, memory: Arc<dyn MemoryBackend>) -> Result<Self> {
        config.validate()?;
        if let Some(limit) = memory.capacity() {
            if config.capacity > limit {
                return Err(Error::InvalidConfig(format!(
                    "{} capacity {} exceeds device memory {}",
                    memory.tier(),
                    config.capacity,
                    limit
                )));
            }
        }

        Ok(Self {
            id: memory.tier(),
            state: Mutex::new(TierState {
                slabs: SlabSet::new(),
                buffers: HashMap::new(),
                policy: new_policy(config.policy),
            }),
            config,
            memory,
            populated: Condvar::new(),
            flush_target: None,
            stats: TierStats::new(),
        })
    }

    /// CPU tier on host memory.
    pub fn cpu(config: TierConfig) -> Result<Self> {
        Self::new(config, Arc::new(HostMemory::new()))
    }

    /// GPU tier on a simulated device sized to the tier capacity.
    pub fn simulated_gpu(device: u16, config: TierConfig) -> Result<Self> {
        let memory = SimulatedDeviceMemory::new(device, config.capacity);
        Self::new(config, Arc::new(memory))
    }

    /// Dirty victims are flushed here before their memory is reused.
    pub fn with_flush_target(mut self, target: Arc<dyn FlushTarget>) -> Self {
        self.flush_target = Some(target);
        self
    }

    // ========================================================================
    // Public API: buffer lookup and creation
    // ========================================================================

    /// Return the resident buffer for `key`, or create an empty one of at
    /// least `min_size` bytes, evicting if the tier is full.
    ///
    /// # Errors
    /// - `Error::CapacityExceeded` if `min_size` exceeds the tier, or no
    ///   remaining buffer can be evicted
    /// - `Error::Allocation` if a dirty victim fails to flush or the memory
    ///   backend refuses a slab
    pub fn get_or_create(&self, key: ChunkKey, min_size: usize) -> Result<BufferHandle<'_>> {
        let mut state = self.state.lock();
        if let Some(buffer) = self.wait_for_resident(&mut state, &key) {
            return Ok(self.hit(&mut state, buffer));
        }

        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        let buffer = self.create_locked(&mut state, key, min_size, BufferStatus::Populated)?;
        Ok(BufferHandle::new(self, buffer))
    }

    /// Pin the resident buffer for `key`, if any. Counts as an access.
    pub fn get(&self, key: &ChunkKey) -> Option<BufferHandle<'_>> {
        let mut state = self.state.lock();
        let buffer = self.wait_for_resident(&mut state, key)?;
        Some(self.hit(&mut state, buffer))
    }

    /// Like [`get_or_create`](Self::get_or_create), filling a new buffer
    /// with `populate` before anyone else can see it.
    ///
    /// The new buffer is registered as a placeholder and the tier lock is
    /// released while `populate` runs. Concurrent requests for the key wait
    /// for the outcome. On failure the placeholder is discarded, waiters are
    /// woken (one of them takes over population) and the error is returned.
    ///
    /// A populated buffer starts clean: its bytes mirror their source.
    pub fn fetch_or_populate<F>(&self, key: ChunkKey, min_size: usize, populate: F) -> Result<BufferHandle<'_>>
    where
        F: FnOnce(&BufferHandle<'_>) -> Result<()>,
    {
        let handle = {
            let mut state = self.state.lock();
            if let Some(buffer) = self.wait_for_resident(&mut state, &key) {
                return Ok(self.hit(&mut state, buffer));
            }
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            let buffer = self.create_locked(&mut state, key, min_size, BufferStatus::Populating)?;
            BufferHandle::new(self, buffer)
        };

        match populate(&handle) {
            Ok(()) => {
                let mut state = self.state.lock();
                handle.buffer().clear_dirty();
                handle.buffer().mark_populated();
                state.policy.record_access(key);
                drop(state);
                self.populated.notify_all();
                trace!(tier = %self.id, key = %key, bytes = handle.size(), "populated buffer");
                Ok(handle)
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    self.discard_locked(&mut state, handle.buffer());
                }
                self.populated.notify_all();
                self.stats.failed_populations.fetch_add(1, Ordering::Relaxed);
                warn!(tier = %self.id, key = %key, error = %e, "population failed");
                drop(handle);
                Err(e)
            }
        }
    }

    /// Copy the resident buffer for `key` into a buffer of `dest`,
    /// preserving its encoding. An existing buffer in `dest` is returned
    /// as is.
    ///
    /// Bytes move with neither tier locked.
    ///
    /// # Errors
    /// - `Error::BufferNotFound` if `key` is not resident here
    /// - `Error::InvalidDevice` if `dest` is this tier
    pub fn copy_into<'d>(&self, dest: &'d TierManager, key: ChunkKey) -> Result<BufferHandle<'d>> {
        if std::ptr::eq(self, dest) {
            return Err(Error::InvalidDevice(dest.id));
        }
        let source = self.pin_resident(&key).ok_or(Error::BufferNotFound { key, tier: self.id })?;
        let size = source.size();
        let encoding = source.encoding();

        let handle = dest.fetch_or_populate(key, size, |target| {
            let data = source.read_all()?;
            target.overwrite(&data)?;
            target.set_encoding(encoding);
            Ok(())
        })?;
        debug!(from = %self.id, to = %dest.id, key = %key, bytes = size, "copied buffer between tiers");
        Ok(handle)
    }

    // ========================================================================
    // Public API: removal and write-back
    // ========================================================================

    /// Discard the buffer for `key` without flushing it.
    ///
    /// # Errors
    /// - `Error::BufferNotFound` if `key` is not resident
    /// - `Error::BufferPinned` if anyone holds a handle
    pub fn free(&self, key: &ChunkKey) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get(key)
            .cloned()
            .ok_or(Error::BufferNotFound { key: *key, tier: self.id })?;
        let pin_count = buffer.pin_count();
        if pin_count > 0 {
            return Err(Error::BufferPinned { key: *key, pin_count });
        }
        self.discard_locked(&mut state, &buffer);
        debug!(tier = %self.id, key = %key, "freed buffer");
        Ok(())
    }

    /// Discard every buffer of a table. Nothing is freed if any is pinned.
    pub fn free_table(&self, db_id: u32, table_id: u32) -> Result<usize> {
        let mut state = self.state.lock();
        let doomed: Vec<Arc<Buffer>> = state
            .buffers
            .values()
            .filter(|b| b.key().belongs_to_table(db_id, table_id))
            .cloned()
            .collect();
        if let Some(pinned) = doomed.iter().find(|b| b.is_pinned()) {
            return Err(Error::BufferPinned {
                key: pinned.key(),
                pin_count: pinned.pin_count(),
            });
        }
        for buffer in &doomed {
            self.discard_locked(&mut state, buffer);
        }
        debug!(tier = %self.id, db_id, table_id, buffers = doomed.len(), "freed table");
        Ok(doomed.len())
    }

    /// Evict every evictable buffer and return empty slabs to the backend.
    ///
    /// Dirty buffers are flushed first, or kept when there is no flush target.
    pub fn free_all_unpinned(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let mut evicted = 0;
        while self.evict_one_locked(&mut state, 0)? {
            evicted += 1;
        }
        self.release_empty_slabs_locked(&mut state)?;
        Ok(evicted)
    }

    /// Write the buffer for `key` to the flush target if dirty.
    ///
    /// Returns whether anything was written.
    pub fn flush(&self, key: &ChunkKey) -> Result<bool> {
        let handle = self
            .pin_resident(key)
            .ok_or(Error::BufferNotFound { key: *key, tier: self.id })?;
        self.flush_buffer(&handle)
    }

    /// Write every dirty buffer to the flush target, in key order.
    pub fn flush_all(&self) -> Result<usize> {
        let mut handles: Vec<BufferHandle<'_>> = {
            let state = self.state.lock();
            let dirty = state
                .buffers
                .values()
                .filter(|b| b.is_dirty() && b.status() == BufferStatus::Populated)
                .map(|b| {
                    b.pin();
                    BufferHandle::new(self, Arc::clone(b))
                })
                .collect();
            dirty
        };
        handles.sort_by_key(|h| h.key());

        let mut flushed = 0;
        for handle in &handles {
            if self.flush_buffer(handle)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    // ========================================================================
    // Public API: introspection
    // ========================================================================

    #[inline]
    pub fn id(&self) -> TierId {
        self.id
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn memory(&self) -> &Arc<dyn MemoryBackend> {
        &self.memory
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn has_flush_target(&self) -> bool {
        self.flush_target.is_some()
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.state.lock().buffers.contains_key(key)
    }

    pub fn pin_count(&self, key: &ChunkKey) -> Option<u32> {
        self.state.lock().buffers.get(key).map(|b| b.pin_count())
    }

    /// Resident keys, sorted.
    pub fn keys(&self) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = self.state.lock().buffers.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of tier memory bound to buffers.
    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().slabs.bound_bytes()
    }

    pub fn memory_summary(&self) -> MemorySummary {
        let state = self.state.lock();
        let mut summary = MemorySummary {
            tier: self.id,
            capacity: self.config.capacity,
            slab_bytes: state.slabs.total_bytes(),
            reserved_bytes: state.slabs.bound_bytes(),
            ..MemorySummary::default()
        };
        for buffer in state.buffers.values() {
            summary.used_bytes += buffer.size();
            summary.buffers += 1;
            if buffer.is_pinned() {
                summary.pinned += 1;
            }
            if buffer.is_dirty() {
                summary.dirty += 1;
            }
        }
        summary.slabs = state
            .slabs
            .slabs()
            .map(|(id, slab)| SlabSummary {
                id: *id,
                bytes: slab.allocation.size,
                segments: slab
                    .segments
                    .iter()
                    .map(|s| SegmentSummary {
                        offset: s.offset,
                        len: s.len,
                        owner: s.owner,
                    })
                    .collect(),
            })
            .collect();
        summary
    }

    // ========================================================================
    // Crate-internal API (used by BufferHandle)
    // ========================================================================

    /// Release one pin. The last unpin counts as the buffer's latest use.
    pub(crate) fn unpin(&self, buffer: &Arc<Buffer>) {
        if buffer.unpin() > 0 {
            return;
        }
        let mut state = self.state.lock();
        let key = buffer.key();
        let resident = state
            .buffers
            .get(&key)
            .is_some_and(|b| Arc::ptr_eq(b, buffer));
        if resident && buffer.status() == BufferStatus::Populated {
            state.policy.record_access(key);
        }
    }

    /// Grow `buffer` to at least `n` reserved bytes, in place when the
    /// following segment is free, otherwise by relocating it.
    pub(crate) fn reserve(&self, buffer: &Arc<Buffer>, n: usize) -> Result<()> {
        let mut state = self.state.lock();
        let key = buffer.key();
        let extent = buffer
            .extent()
            .ok_or(Error::BufferNotFound { key, tier: self.id })?;
        let len = self.granular(n);
        if len <= extent.len {
            return Ok(());
        }
        if len > self.config.capacity {
            return Err(Error::CapacityExceeded {
                tier: self.id,
                requested: n,
                available: self.config.capacity,
            });
        }

        if let Some(grown) = state.slabs.try_grow(&extent, len) {
            buffer.set_extent(grown);
            trace!(tier = %self.id, key = %key, bytes = len, "grew buffer in place");
            return Ok(());
        }

        let target = self.allocate_locked(&mut state, key, n)?;
        match buffer.relocate(target) {
            Ok(old) => {
                if let Some(old) = old {
                    state.slabs.release(&old);
                }
                self.stats.relocations.fetch_add(1, Ordering::Relaxed);
                debug!(tier = %self.id, key = %key, from = extent.len, to = len, "relocated buffer");
                Ok(())
            }
            Err(e) => {
                state.slabs.release(&target);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Resident buffer for `key`, waiting out a placeholder in progress.
    fn wait_for_resident(
        &self,
        state: &mut MutexGuard<'_, TierState>,
        key: &ChunkKey,
    ) -> Option<Arc<Buffer>> {
        loop {
            let buffer = Arc::clone(state.buffers.get(key)?);
            if buffer.status() != BufferStatus::Populating {
                return Some(buffer);
            }
            self.populated.wait(state);
        }
    }

    fn hit(&self, state: &mut TierState, buffer: Arc<Buffer>) -> BufferHandle<'_> {
        buffer.pin();
        state.policy.record_access(buffer.key());
        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        trace!(tier = %self.id, key = %buffer.key(), "buffer hit");
        BufferHandle::new(self, buffer)
    }

    /// Pin without counting an access.
    fn pin_resident(&self, key: &ChunkKey) -> Option<BufferHandle<'_>> {
        let mut state = self.state.lock();
        let buffer = self.wait_for_resident(&mut state, key)?;
        buffer.pin();
        Some(BufferHandle::new(self, buffer))
    }

    fn flush_buffer(&self, buffer: &Buffer) -> Result<bool> {
        let Some(target) = &self.flush_target else {
            return Ok(false);
        };
        let flushed = buffer.flush_with(|key, data, encoding| target.flush_chunk(key, data, encoding))?;
        if flushed {
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            debug!(tier = %self.id, key = %buffer.key(), "flushed dirty buffer");
        }
        Ok(flushed)
    }

    fn granular(&self, size: usize) -> usize {
        size.max(1).div_ceil(self.config.alignment) * self.config.alignment
    }

    fn create_locked(
        &self,
        state: &mut TierState,
        key: ChunkKey,
        min_size: usize,
        status: BufferStatus,
    ) -> Result<Arc<Buffer>> {
        let extent = self.allocate_locked(state, key, min_size)?;
        let buffer = Arc::new(Buffer::new(key, self.id, Arc::clone(&self.memory), extent, status));
        buffer.pin();
        state.buffers.insert(key, Arc::clone(&buffer));
        state.policy.record_access(key);
        trace!(tier = %self.id, key = %key, bytes = extent.len, "created buffer");
        Ok(buffer)
    }

    /// Find `size` bytes: best fit, then a new slab, then returning empty
    /// slabs to the backend, then eviction.
    fn allocate_locked(&self, state: &mut TierState, key: ChunkKey, size: usize) -> Result<Extent> {
        let len = self.granular(size);
        if len > self.config.capacity {
            return Err(Error::CapacityExceeded {
                tier: self.id,
                requested: size,
                available: self.config.capacity,
            });
        }

        loop {
            if let Some(extent) = state.slabs.allocate_best_fit(len, key) {
                return Ok(extent);
            }

            let headroom = self.config.capacity - state.slabs.total_bytes();
            if headroom >= len {
                let slab_size = self.config.slab_size.max(len).min(headroom);
                let allocation = self.memory.allocate(slab_size)?;
                state.slabs.add_slab(allocation);
                debug!(tier = %self.id, bytes = slab_size, total = state.slabs.total_bytes(), "added slab");
                continue;
            }

            if self.release_empty_slabs_locked(state)? > 0 {
                continue;
            }

            if !self.evict_one_locked(state, size)? {
                return Err(Error::CapacityExceeded {
                    tier: self.id,
                    requested: size,
                    available: self.config.capacity - state.slabs.bound_bytes(),
                });
            }
        }
    }

    /// Return every empty slab to the backend. Slabs the backend refuses
    /// stay in the tier; the first refusal is returned after the rest are
    /// released.
    fn release_empty_slabs_locked(&self, state: &mut TierState) -> Result<usize> {
        let mut released = 0;
        let mut failure = None;
        for allocation in state.slabs.take_empty_slabs() {
            match self.memory.deallocate(&allocation) {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!(tier = %self.id, slab = allocation.id, error = %e, "slab release failed");
                    state.slabs.add_slab(allocation);
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Evict the first evictable buffer in policy order.
    ///
    /// A dirty victim is flushed first; if that fails the victim stays
    /// resident and dirty and the allocation fails.
    fn evict_one_locked(&self, state: &mut TierState, requested: usize) -> Result<bool> {
        let can_flush = self.flush_target.is_some();
        let TierState {
            slabs,
            buffers,
            policy,
        } = state;

        let victim = policy.choose_victim(&|key: &ChunkKey| {
            buffers.get(key).is_some_and(|b| b.is_evictable(can_flush))
        });
        let Some(key) = victim else {
            return Ok(false);
        };
        let Some(buffer) = buffers.get(&key).cloned() else {
            return Ok(false);
        };

        if buffer.is_dirty() {
            self.flush_buffer(&buffer).map_err(|e| {
                warn!(tier = %self.id, key = %key, error = %e, "flush before eviction failed");
                Error::Allocation {
                    tier: self.id,
                    requested,
                    reason: format!("flushing dirty victim {} failed: {}", key, e),
                }
            })?;
        }

        buffers.remove(&key);
        policy.remove(&key);
        if let Some(extent) = buffer.detach() {
            slabs.release(&extent);
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(tier = %self.id, key = %key, "evicted buffer");
        Ok(true)
    }

    fn discard_locked(&self, state: &mut TierState, buffer: &Arc<Buffer>) {
        let key = buffer.key();
        if state
            .buffers
            .get(&key)
            .is_some_and(|b| Arc::ptr_eq(b, buffer))
        {
            state.buffers.remove(&key);
            state.policy.remove(&key);
        }
        if let Some(extent) = buffer.detach() {
            state.slabs.release(&extent);
        }
    }
}
