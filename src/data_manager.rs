//! Data Manager - the single entry point for chunk access.
//!
//! Routes each request to the tier of the requested device and fills
//! misses from the nearest source:
//!
//! ```text
//!   get_chunk_buffer(key, device)
//!            │
//!            ▼
//!   device tier hit? ──yes──▶ pinned handle
//!            │ no
//!            ▼
//!   CPU tier hit? ──no──▶ foreign table? ──yes──▶ ForeignStorageCache
//!            │                   │ no               (single-flight fetch)
//!            │                   ▼
//!            │              PageStore::read_chunk
//!            ▼
//!   device is GPU? ──yes──▶ copy_into(GPU tier)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::buffer::{BufferHandle, FlushTarget, MemorySummary, TierManager};
use crate::common::config::DataManagerConfig;
use crate::common::{ChunkKey, EncodingMetadata, Error, Result, TierId};
use crate::foreign::{DataWrapper, ForeignStorageCache};
use crate::storage::PageStore;

/// Stale foreign resident keys tolerated before a prune.
const RESIDENT_SLACK: usize = 64;

/// Physical layout the catalog records for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkLayout {
    /// Expected size in bytes, used to size new buffers.
    pub size_hint: usize,
    pub encoding: EncodingMetadata,
}

/// Read-only view of table metadata.
pub trait Catalog: Send + Sync {
    fn chunk_layout(&self, key: &ChunkKey) -> Option<ChunkLayout>;
}

/// Unified chunk API over the CPU tier, GPU tiers, the page store and the
/// foreign storage cache.
///
/// Every tier writes dirty buffers back to the page store on eviction.
/// Writes become durable at [`checkpoint`](Self::checkpoint).
///
/// # Example
/// ```no_run
/// use tiercache::{ChunkKey, DataManager, DataManagerConfig, EncodingMetadata, TierConfig, TierId};
///
/// let config = DataManagerConfig::new("chunks.db")
///     .with_cpu(TierConfig::new(64 << 20))
///     .with_gpu(TierConfig::new(16 << 20));
/// let dm = DataManager::open(config)?;
///
/// let key = ChunkKey::new(1, 7, 2, 0);
/// dm.put_chunk_buffer(key, b"column bytes", EncodingMetadata::default())?;
/// dm.checkpoint()?;
///
/// let on_device = dm.get_chunk_buffer(key, TierId::Gpu(0))?;
/// assert_eq!(on_device.read_all()?, b"column bytes");
/// # Ok::<(), tiercache::Error>(())
/// ```
pub struct DataManager {
    cpu: TierManager,
    gpus: Vec<TierManager>,
    page_store: Arc<PageStore>,
    foreign: ForeignStorageCache,
    catalog: Option<Arc<dyn Catalog>>,
    /// `(db_id, table_id)` → wrapper of a foreign table.
    wrappers: RwLock<HashMap<(u32, u32), Arc<dyn DataWrapper>>>,
    /// Source path → foreign keys materialized into tiers from it.
    foreign_residents: Mutex<HashMap<String, BTreeSet<ChunkKey>>>,
}

impl DataManager {
    /// Open (or create) the page store and build one tier per configured
    /// device. GPU tiers run on simulated device memory.
    pub fn open(config: DataManagerConfig) -> Result<Self> {
        config.validate()?;
        let page_store = Arc::new(PageStore::open_or_create(&config.page_store)?);
        let cpu = TierManager::cpu(config.cpu)?;
        let gpus = config
            .gpus
            .into_iter()
            .enumerate()
            .map(|(device, tier)| TierManager::simulated_gpu(device as u16, tier))
            .collect::<Result<Vec<_>>>()?;
        let foreign = ForeignStorageCache::new(config.foreign_cache)?;
        Self::from_parts(page_store, cpu, gpus, foreign)
    }

    /// Assemble a data manager from prepared parts, e.g. tiers built on a
    /// real device runtime. Each tier's flush target becomes `page_store`.
    ///
    /// # Errors
    /// `Error::InvalidConfig` if `cpu` is not the CPU tier or `gpus[i]` is
    /// not `TierId::Gpu(i)`.
    pub fn from_parts(
        page_store: Arc<PageStore>,
        cpu: TierManager,
        gpus: Vec<TierManager>,
        foreign: ForeignStorageCache,
    ) -> Result<Self> {
        if cpu.id() != TierId::Cpu {
            return Err(Error::InvalidConfig(format!("{} given as the CPU tier", cpu.id())));
        }
        for (device, gpu) in gpus.iter().enumerate() {
            if gpu.id() != TierId::Gpu(device as u16) {
                return Err(Error::InvalidConfig(format!(
                    "{} given as GPU{}",
                    gpu.id(),
                    device
                )));
            }
        }

        let target: Arc<dyn FlushTarget> = Arc::clone(&page_store) as Arc<dyn FlushTarget>;
        let cpu = cpu.with_flush_target(Arc::clone(&target));
        let gpus: Vec<TierManager> = gpus
            .into_iter()
            .map(|gpu| gpu.with_flush_target(Arc::clone(&target)))
            .collect();

        info!(
            cpu_bytes = cpu.capacity(),
            gpus = gpus.len(),
            epoch = page_store.epoch(),
            chunks = page_store.chunk_keys().len(),
            "data manager ready"
        );
        Ok(Self {
            cpu,
            gpus,
            page_store,
            foreign,
            catalog: None,
            wrappers: RwLock::new(HashMap::new()),
            foreign_residents: Mutex::new(HashMap::new()),
        })
    }

    /// Use `catalog` for buffer size hints and foreign chunk encodings.
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    // ========================================================================
    // Public API: chunk access
    // ========================================================================

    /// Pinned handle to `key` on `device`, populating it on a miss.
    ///
    /// A GPU miss is staged through the CPU tier. Wrapper errors are
    /// returned unchanged.
    ///
    /// # Errors
    /// - `Error::InvalidDevice` if `device` is not configured
    /// - `Error::ChunkNotFound` for a native chunk absent from the page store
    /// - `Error::CapacityExceeded` / `Error::Allocation` from either tier
    /// - `Error::Corruption` if the durable image fails verification
    pub fn get_chunk_buffer(&self, key: ChunkKey, device: TierId) -> Result<BufferHandle<'_>> {
        let target = self.tier(device)?;
        if let Some(handle) = target.get(&key) {
            return Ok(handle);
        }

        let staged = self.load_into_cpu(key)?;
        if device == TierId::Cpu {
            return Ok(staged);
        }
        let handle = self.cpu.copy_into(target, key)?;
        drop(staged);
        Ok(handle)
    }

    /// Replace the contents of a native chunk in the CPU tier.
    ///
    /// The buffer is left dirty; it reaches the page store on eviction or
    /// at the next checkpoint. Copies on GPU tiers are dropped.
    ///
    /// # Errors
    /// - `Error::ForeignTableReadOnly` for a chunk of a foreign table
    /// - `Error::BufferPinned` if a GPU copy is pinned
    pub fn put_chunk_buffer(&self, key: ChunkKey, data: &[u8], encoding: EncodingMetadata) -> Result<()> {
        self.ensure_native(&key)?;
        for gpu in &self.gpus {
            if let Some(pin_count) = gpu.pin_count(&key).filter(|pins| *pins > 0) {
                return Err(Error::BufferPinned { key, pin_count });
            }
        }
        for gpu in &self.gpus {
            free_if_resident(gpu, &key)?;
        }

        let handle = self.cpu.get_or_create(key, data.len())?;
        handle.overwrite(data)?;
        handle.set_encoding(encoding);
        debug!(key = %key, bytes = data.len(), "put chunk");
        Ok(())
    }

    /// Flush dirty buffers of every tier, CPU first, then publish them.
    ///
    /// Returns the committed epoch.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut flushed = self.cpu.flush_all()?;
        for gpu in &self.gpus {
            flushed += gpu.flush_all()?;
        }
        let epoch = self.page_store.checkpoint()?;
        info!(epoch, flushed, "checkpoint complete");
        Ok(epoch)
    }

    /// Remove a native chunk from every tier and delete it from the page
    /// store. The delete is durable after the next checkpoint.
    ///
    /// # Errors
    /// - `Error::BufferPinned` if any tier holds it pinned
    /// - `Error::ChunkNotFound` if it exists nowhere
    pub fn delete_chunk(&self, key: &ChunkKey) -> Result<()> {
        self.ensure_native(key)?;
        for tier in self.tiers() {
            if let Some(pin_count) = tier.pin_count(key).filter(|pins| *pins > 0) {
                return Err(Error::BufferPinned { key: *key, pin_count });
            }
        }
        let mut resident = false;
        for tier in self.tiers() {
            resident |= free_if_resident(tier, key)?;
        }
        match self.page_store.delete_chunk(key) {
            Err(Error::ChunkNotFound(_)) if resident => Ok(()),
            other => other,
        }
    }

    /// Drop every chunk of a table from the tiers and the page store, or
    /// from the foreign cache for a foreign table.
    ///
    /// Returns the number of durable chunks deleted.
    ///
    /// # Errors
    /// `Error::BufferPinned` if any tier holds a chunk of the table pinned;
    /// nothing is freed in that case.
    pub fn delete_table(&self, db_id: u32, table_id: u32) -> Result<usize> {
        self.free_table_everywhere(db_id, table_id)?;
        if self.wrapper_for(db_id, table_id).is_some() {
            let dropped = self.foreign.invalidate_table(db_id, table_id);
            debug!(db_id, table_id, dropped, "dropped foreign table chunks");
            return Ok(0);
        }

        let doomed: Vec<ChunkKey> = self
            .page_store
            .chunk_keys()
            .into_iter()
            .filter(|key| key.belongs_to_table(db_id, table_id))
            .collect();
        for key in &doomed {
            self.page_store.delete_chunk(key)?;
        }
        info!(db_id, table_id, chunks = doomed.len(), "deleted table");
        Ok(doomed.len())
    }

    // ========================================================================
    // Public API: foreign tables
    // ========================================================================

    /// Serve chunks of `(db_id, table_id)` through `wrapper`.
    ///
    /// Replacing a wrapper drops whatever the previous one materialized.
    pub fn register_foreign_table(
        &self,
        db_id: u32,
        table_id: u32,
        wrapper: Arc<dyn DataWrapper>,
    ) -> Result<()> {
        let previous = self.wrappers.write().insert((db_id, table_id), wrapper);
        if previous.is_some() {
            self.drop_foreign_table(db_id, table_id)?;
        }
        info!(db_id, table_id, replaced = previous.is_some(), "registered foreign table");
        Ok(())
    }

    /// Stop serving a foreign table and drop its cached chunks.
    ///
    /// Returns whether a wrapper was registered.
    pub fn unregister_foreign_table(&self, db_id: u32, table_id: u32) -> Result<bool> {
        if self.wrapper_for(db_id, table_id).is_none() {
            return Ok(false);
        }
        self.drop_foreign_table(db_id, table_id)?;
        self.wrappers.write().remove(&(db_id, table_id));
        info!(db_id, table_id, "unregistered foreign table");
        Ok(true)
    }

    /// Forget everything fetched from `source_path` so the next request
    /// reads the refreshed source.
    ///
    /// Unpinned tier buffers from the source are freed. Returns the number
    /// of foreign cache entries dropped.
    ///
    /// # Errors
    /// `Error::BufferPinned` if a buffer from the source is still pinned;
    /// the cache entries and every other buffer are dropped regardless.
    pub fn refresh_foreign_source(&self, source_path: &str) -> Result<usize> {
        let dropped = self.foreign.invalidate_source(source_path);
        let keys = self
            .foreign_residents
            .lock()
            .remove(source_path)
            .unwrap_or_default();

        let mut pinned = None;
        for key in &keys {
            for tier in self.tiers() {
                match free_if_resident(tier, key) {
                    Ok(_) => {}
                    Err(e @ Error::BufferPinned { .. }) => {
                        pinned.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(source = source_path, dropped, buffers = keys.len(), "refreshed foreign source");
        match pinned {
            Some(e) => Err(e),
            None => Ok(dropped),
        }
    }

    // ========================================================================
    // Public API: introspection
    // ========================================================================

    /// Tier manager of `device`.
    pub fn tier(&self, device: TierId) -> Result<&TierManager> {
        match device {
            TierId::Cpu => Ok(&self.cpu),
            TierId::Gpu(n) => self
                .gpus
                .get(n as usize)
                .ok_or(Error::InvalidDevice(device)),
        }
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    /// One summary per tier, CPU first.
    pub fn memory_summary(&self) -> Vec<MemorySummary> {
        self.tiers().map(TierManager::memory_summary).collect()
    }

    pub fn page_store(&self) -> &Arc<PageStore> {
        &self.page_store
    }

    pub fn foreign_cache(&self) -> &ForeignStorageCache {
        &self.foreign
    }

    pub fn is_foreign(&self, key: &ChunkKey) -> bool {
        self.wrapper_for(key.db_id, key.table_id).is_some()
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn tiers(&self) -> impl Iterator<Item = &TierManager> {
        std::iter::once(&self.cpu).chain(self.gpus.iter())
    }

    fn wrapper_for(&self, db_id: u32, table_id: u32) -> Option<Arc<dyn DataWrapper>> {
        self.wrappers.read().get(&(db_id, table_id)).cloned()
    }

    fn layout(&self, key: &ChunkKey) -> Option<ChunkLayout> {
        self.catalog.as_ref()?.chunk_layout(key)
    }

    fn ensure_native(&self, key: &ChunkKey) -> Result<()> {
        if self.is_foreign(key) {
            return Err(Error::ForeignTableReadOnly {
                db_id: key.db_id,
                table_id: key.table_id,
            });
        }
        Ok(())
    }

    /// Pin `key` in the CPU tier, reading it from its source on a miss.
    fn load_into_cpu(&self, key: ChunkKey) -> Result<BufferHandle<'_>> {
        let layout = self.layout(&key);
        match self.wrapper_for(key.db_id, key.table_id) {
            Some(wrapper) => {
                let size_hint = layout.map_or(0, |l| l.size_hint);
                self.cpu.fetch_or_populate(key, size_hint, |buffer| {
                    let mut chunk = self
                        .foreign
                        .get_or_fetch(key, || wrapper.materialize(&key))?;
                    if let Some(layout) = layout {
                        chunk.encoding = layout.encoding;
                    }
                    buffer.overwrite(&chunk.data)?;
                    buffer.set_encoding(chunk.encoding);
                    self.track_foreign_resident(chunk.provenance.source_path, key);
                    Ok(())
                })
            }
            None => {
                let size_hint = self
                    .page_store
                    .chunk_size(&key)
                    .map(|size| size as usize)
                    .or(layout.map(|l| l.size_hint))
                    .unwrap_or(0);
                self.cpu.fetch_or_populate(key, size_hint, |buffer| {
                    let stored = self.page_store.read_chunk(&key)?;
                    buffer.overwrite(&stored.data)?;
                    buffer.set_encoding(stored.encoding);
                    Ok(())
                })
            }
        }
    }

    /// Free a table from every tier, or from none if any tier pins one of
    /// its buffers. Device copies go before the CPU buffers, which may be
    /// the only dirty ones.
    fn free_table_everywhere(&self, db_id: u32, table_id: u32) -> Result<()> {
        for tier in self.tiers() {
            for key in tier.keys() {
                if !key.belongs_to_table(db_id, table_id) {
                    continue;
                }
                if let Some(pin_count) = tier.pin_count(&key).filter(|pins| *pins > 0) {
                    return Err(Error::BufferPinned { key, pin_count });
                }
            }
        }
        for gpu in &self.gpus {
            gpu.free_table(db_id, table_id)?;
        }
        self.cpu.free_table(db_id, table_id)?;
        Ok(())
    }

    /// Remember that `key` was materialized from `source_path`.
    ///
    /// Keys whose buffers have since left every tier are pruned once they
    /// outnumber the resident buffers.
    fn track_foreign_resident(&self, source_path: String, key: ChunkKey) {
        let mut residents = self.foreign_residents.lock();
        residents.entry(source_path).or_default().insert(key);

        let tracked: usize = residents.values().map(BTreeSet::len).sum();
        let resident: usize = self.tiers().map(TierManager::len).sum();
        if tracked > 2 * resident + RESIDENT_SLACK {
            residents.retain(|_, keys| {
                keys.retain(|key| self.tiers().any(|tier| tier.contains(key)));
                !keys.is_empty()
            });
            let kept: usize = residents.values().map(BTreeSet::len).sum();
            trace!(tracked, kept, "pruned foreign residents");
        }
    }

    fn drop_foreign_table(&self, db_id: u32, table_id: u32) -> Result<()> {
        self.free_table_everywhere(db_id, table_id)?;
        self.foreign.invalidate_table(db_id, table_id);
        for keys in self.foreign_residents.lock().values_mut() {
            keys.retain(|key| !key.belongs_to_table(db_id, table_id));
        }
        Ok(())
    }
}

/// Free `key` from `tier` if resident. Returns whether it was.
fn free_if_resident(tier: &TierManager, key: &ChunkKey) -> Result<bool> {
    match tier.free(key) {
        Ok(()) => Ok(true),
        Err(Error::BufferNotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("cpu", &self.cpu.id())
            .field("gpus", &self.gpus.len())
            .field("epoch", &self.page_store.epoch())
            .field("foreign_tables", &self.wrappers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{ForeignCacheConfig, TierConfig};
    use crate::common::Compression;
    use crate::foreign::ChunkProvenance;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CsvWrapper {
        fetches: AtomicUsize,
        fail: bool,
    }

    impl CsvWrapper {
        fn new() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl DataWrapper for CsvWrapper {
        fn provenance(&self, key: &ChunkKey) -> Result<ChunkProvenance> {
            Ok(ChunkProvenance::new(format!("/data/t{}.csv", key.table_id))
                .with_row_group(key.fragment_id))
        }

        fn fetch_chunk(&self, key: &ChunkKey, provenance: &ChunkProvenance) -> Result<Bytes> {
            if self.fail {
                return Err(Error::Parse {
                    source_path: provenance.source_path.clone(),
                    reason: "unterminated quote".into(),
                });
            }
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(format!("rows of {}", key)))
        }
    }

    struct FixedCatalog;

    impl Catalog for FixedCatalog {
        fn chunk_layout(&self, _key: &ChunkKey) -> Option<ChunkLayout> {
            Some(ChunkLayout {
                size_hint: 2048,
                encoding: EncodingMetadata::new(4, Compression::Dictionary),
            })
        }
    }

    fn open(dir: &std::path::Path) -> DataManager {
        let config = DataManagerConfig::new(dir.join("chunks.db"))
            .with_cpu(TierConfig::new(64 << 10))
            .with_gpu(TierConfig::new(16 << 10))
            .with_gpu(TierConfig::new(16 << 10))
            .with_foreign_cache(ForeignCacheConfig::new(8 << 10));
        DataManager::open(config).unwrap()
    }

    #[test]
    fn test_put_then_get_on_every_device() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        let key = ChunkKey::new(1, 1, 0, 0);
        dm.put_chunk_buffer(key, b"abc", EncodingMetadata::default()).unwrap();

        for device in [TierId::Cpu, TierId::Gpu(0), TierId::Gpu(1)] {
            let handle = dm.get_chunk_buffer(key, device).unwrap();
            assert_eq!(handle.tier(), device);
            assert_eq!(handle.read_all().unwrap(), b"abc");
        }
        assert!(matches!(
            dm.get_chunk_buffer(key, TierId::Gpu(2)),
            Err(Error::InvalidDevice(TierId::Gpu(2)))
        ));
    }

    #[test]
    fn test_missing_native_chunk() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        let key = ChunkKey::new(1, 1, 0, 9);
        assert!(matches!(
            dm.get_chunk_buffer(key, TierId::Cpu),
            Err(Error::ChunkNotFound(k)) if k == key
        ));
        assert!(!dm.tier(TierId::Cpu).unwrap().contains(&key));
    }

    #[test]
    fn test_put_drops_gpu_copies() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        let key = ChunkKey::new(1, 1, 0, 0);
        dm.put_chunk_buffer(key, b"v1", EncodingMetadata::default()).unwrap();

        let pinned = dm.get_chunk_buffer(key, TierId::Gpu(0)).unwrap();
        assert!(matches!(
            dm.put_chunk_buffer(key, b"v2", EncodingMetadata::default()),
            Err(Error::BufferPinned { .. })
        ));
        drop(pinned);

        dm.put_chunk_buffer(key, b"v2", EncodingMetadata::default()).unwrap();
        assert!(!dm.tier(TierId::Gpu(0)).unwrap().contains(&key));
        let gpu = dm.get_chunk_buffer(key, TierId::Gpu(0)).unwrap();
        assert_eq!(gpu.read_all().unwrap(), b"v2");
    }

    #[test]
    fn test_checkpoint_survives_reopen() {
        let dir = tempdir().unwrap();
        let key = ChunkKey::new(1, 2, 3, 4);
        let encoding = EncodingMetadata::new(8, Compression::RunLength);
        {
            let dm = open(dir.path());
            dm.put_chunk_buffer(key, b"durable", encoding).unwrap();
            assert_eq!(dm.checkpoint().unwrap(), 1);
        }
        let dm = open(dir.path());
        let handle = dm.get_chunk_buffer(key, TierId::Gpu(1)).unwrap();
        assert_eq!(handle.read_all().unwrap(), b"durable");
        assert_eq!(handle.encoding(), encoding);
    }

    #[test]
    fn test_foreign_chunk_fetched_once() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path()).with_catalog(Arc::new(FixedCatalog));
        let wrapper = Arc::new(CsvWrapper::new());
        dm.register_foreign_table(2, 5, wrapper.clone()).unwrap();
        let key = ChunkKey::new(2, 5, 0, 1);

        let handle = dm.get_chunk_buffer(key, TierId::Gpu(0)).unwrap();
        assert_eq!(handle.read_all().unwrap(), b"rows of Chunk(2,5,0,1)");
        assert_eq!(handle.encoding().compression, Compression::Dictionary);
        drop(handle);

        dm.tier(TierId::Cpu).unwrap().free(&key).unwrap();
        dm.tier(TierId::Gpu(0)).unwrap().free(&key).unwrap();
        dm.get_chunk_buffer(key, TierId::Cpu).unwrap();
        assert_eq!(wrapper.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(dm.foreign_cache().stats().snapshot().hits, 1);
    }

    #[test]
    fn test_foreign_table_is_read_only() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        dm.register_foreign_table(2, 5, Arc::new(CsvWrapper::new())).unwrap();
        let key = ChunkKey::new(2, 5, 0, 0);
        assert!(matches!(
            dm.put_chunk_buffer(key, b"x", EncodingMetadata::default()),
            Err(Error::ForeignTableReadOnly { db_id: 2, table_id: 5 })
        ));
    }

    #[test]
    fn test_wrapper_error_passes_through() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        let wrapper = CsvWrapper {
            fetches: AtomicUsize::new(0),
            fail: true,
        };
        dm.register_foreign_table(2, 5, Arc::new(wrapper)).unwrap();
        let key = ChunkKey::new(2, 5, 0, 0);

        assert!(matches!(
            dm.get_chunk_buffer(key, TierId::Cpu),
            Err(Error::Parse { .. })
        ));
        assert!(!dm.tier(TierId::Cpu).unwrap().contains(&key));
    }

    #[test]
    fn test_refresh_foreign_source() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        let wrapper = Arc::new(CsvWrapper::new());
        dm.register_foreign_table(2, 5, wrapper.clone()).unwrap();
        let key = ChunkKey::new(2, 5, 0, 0);
        dm.get_chunk_buffer(key, TierId::Gpu(0)).unwrap();

        assert_eq!(dm.refresh_foreign_source("/data/t5.csv").unwrap(), 1);
        assert!(!dm.tier(TierId::Cpu).unwrap().contains(&key));
        assert!(!dm.tier(TierId::Gpu(0)).unwrap().contains(&key));

        dm.get_chunk_buffer(key, TierId::Cpu).unwrap();
        assert_eq!(wrapper.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister_foreign_table() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        dm.register_foreign_table(2, 5, Arc::new(CsvWrapper::new())).unwrap();
        let key = ChunkKey::new(2, 5, 0, 0);
        dm.get_chunk_buffer(key, TierId::Cpu).unwrap();

        assert!(dm.unregister_foreign_table(2, 5).unwrap());
        assert!(!dm.unregister_foreign_table(2, 5).unwrap());
        assert!(dm.foreign_cache().is_empty());
        assert!(matches!(
            dm.get_chunk_buffer(key, TierId::Cpu),
            Err(Error::ChunkNotFound(_))
        ));
    }

    #[test]
    fn test_delete_chunk_and_table() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        for fragment in 0..3 {
            dm.put_chunk_buffer(ChunkKey::new(1, 1, 0, fragment), b"x", EncodingMetadata::default())
                .unwrap();
        }
        dm.checkpoint().unwrap();

        // Never flushed: only the tier holds it.
        let fresh = ChunkKey::new(1, 1, 0, 7);
        dm.put_chunk_buffer(fresh, b"y", EncodingMetadata::default()).unwrap();
        dm.delete_chunk(&fresh).unwrap();
        assert!(matches!(dm.delete_chunk(&fresh), Err(Error::ChunkNotFound(_))));

        {
            let _pinned = dm.get_chunk_buffer(ChunkKey::new(1, 1, 0, 0), TierId::Cpu).unwrap();
            assert!(matches!(dm.delete_table(1, 1), Err(Error::BufferPinned { .. })));
        }
        assert_eq!(dm.delete_table(1, 1).unwrap(), 3);
        dm.checkpoint().unwrap();
        assert!(dm.page_store().chunk_keys().is_empty());
    }

    #[test]
    fn test_delete_table_pinned_on_gpu_keeps_dirty_data() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        let key = ChunkKey::new(1, 1, 0, 0);
        dm.put_chunk_buffer(key, b"v1", EncodingMetadata::default()).unwrap();
        dm.checkpoint().unwrap();
        dm.put_chunk_buffer(key, b"v2", EncodingMetadata::default()).unwrap();

        {
            let _pinned = dm.get_chunk_buffer(key, TierId::Gpu(1)).unwrap();
            assert!(matches!(
                dm.delete_table(1, 1),
                Err(Error::BufferPinned { key: k, .. }) if k == key
            ));
        }
        let cpu = dm.tier(TierId::Cpu).unwrap();
        assert!(cpu.get(&key).unwrap().is_dirty());
        assert!(dm.tier(TierId::Gpu(1)).unwrap().contains(&key));

        dm.checkpoint().unwrap();
        assert_eq!(dm.page_store().read_committed_chunk(&key).unwrap().data, b"v2");
    }

    #[test]
    fn test_foreign_residents_stay_bounded() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        dm.register_foreign_table(2, 5, Arc::new(CsvWrapper::new())).unwrap();
        let kept = ChunkKey::new(2, 5, 0, 1000);
        dm.get_chunk_buffer(kept, TierId::Cpu).unwrap();

        let cpu = dm.tier(TierId::Cpu).unwrap();
        for fragment in 0..300 {
            let key = ChunkKey::new(2, 5, 0, fragment);
            dm.get_chunk_buffer(key, TierId::Cpu).unwrap();
            cpu.free(&key).unwrap();
        }
        let tracked: usize = dm.foreign_residents.lock().values().map(BTreeSet::len).sum();
        assert!(tracked <= RESIDENT_SLACK + 4, "tracking {} keys", tracked);

        dm.refresh_foreign_source("/data/t5.csv").unwrap();
        assert!(!cpu.contains(&kept));
    }

    #[test]
    fn test_memory_summary_per_tier() {
        let dir = tempdir().unwrap();
        let dm = open(dir.path());
        dm.put_chunk_buffer(ChunkKey::new(1, 1, 0, 0), &[1u8; 600], EncodingMetadata::default())
            .unwrap();

        let summaries = dm.memory_summary();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].tier, TierId::Cpu);
        assert_eq!(summaries[0].used_bytes, 600);
        assert_eq!(summaries[0].dirty, 1);
        assert_eq!(summaries[2].tier, TierId::Gpu(1));
        assert_eq!(summaries[2].buffers, 0);
    }
}
