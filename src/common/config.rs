//! Configuration constants and config structs for tiercache.

use std::path::PathBuf;

use crate::common::{Error, Result};

/// Size of a durable page in bytes (4KB).
///
/// # Memory Layout
/// With 4KB pages and 32-bit PageIds:
/// - Max pages: 2^32 = 4,294,967,296 pages
/// - Max page file size: 4,294,967,296 × 4KB = 16TB
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of pages with u32 PageId.
pub const MAX_PAGES: u64 = (u32::MAX as u64) + 1;

/// Maximum theoretical page file size in bytes.
pub const MAX_DB_SIZE_BYTES: u64 = MAX_PAGES * PAGE_SIZE as u64;

/// Magic number at the start of every superblock ("TCPGFILE").
pub const SUPERBLOCK_MAGIC: u64 = 0x5443_5047_4649_4C45;

/// On-disk format version written into superblocks.
pub const FORMAT_VERSION: u32 = 1;

/// Default CPU tier capacity (1GB).
pub const DEFAULT_CPU_CAPACITY: usize = 1 << 30;

/// Default capacity of a GPU device tier (256MB).
pub const DEFAULT_GPU_CAPACITY: usize = 256 << 20;

/// Default slab size (64MB). Oversized requests get a slab of their own size.
pub const DEFAULT_SLAB_SIZE: usize = 64 << 20;

/// Default allocation granularity inside a slab.
pub const DEFAULT_ALIGNMENT: usize = 512;

/// Default in-memory budget of the foreign storage cache (128MB).
pub const DEFAULT_FOREIGN_CACHE_BYTES: usize = 128 << 20;

/// Which eviction policy a cache is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    /// Least recently used (least recently unpinned for tiers).
    #[default]
    Lru,
    /// First in, first out.
    Fifo,
}

/// Configuration of one memory tier.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Hard upper bound on slab bytes owned by the tier.
    pub capacity: usize,
    /// Size of a regular slab.
    pub slab_size: usize,
    /// Segment sizes are rounded up to a multiple of this.
    pub alignment: usize,
    /// Victim selection order.
    pub policy: PolicyKind,
}

impl TierConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slab_size: DEFAULT_SLAB_SIZE.min(capacity),
            alignment: DEFAULT_ALIGNMENT,
            policy: PolicyKind::Lru,
        }
    }

    pub fn with_slab_size(mut self, slab_size: usize) -> Self {
        self.slab_size = slab_size;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("tier capacity must be > 0".into()));
        }
        if self.slab_size == 0 || self.slab_size > self.capacity {
            return Err(Error::InvalidConfig(format!(
                "slab size {} must be in 1..={}",
                self.slab_size, self.capacity
            )));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CPU_CAPACITY)
    }
}

/// Disk spill settings of the foreign storage cache.
#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Directory holding spilled chunk files.
    pub dir: PathBuf,
    /// Byte budget of the spill directory.
    pub max_bytes: u64,
}

/// Configuration of the foreign storage cache.
#[derive(Debug, Clone)]
pub struct ForeignCacheConfig {
    /// In-memory byte budget.
    pub max_bytes: usize,
    pub policy: PolicyKind,
    /// Optional disk spill; `None` drops evicted entries.
    pub spill: Option<SpillConfig>,
}

impl ForeignCacheConfig {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            policy: PolicyKind::Lru,
            spill: None,
        }
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_spill(mut self, dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        self.spill = Some(SpillConfig {
            dir: dir.into(),
            max_bytes,
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::InvalidConfig(
                "foreign cache budget must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ForeignCacheConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FOREIGN_CACHE_BYTES)
    }
}

/// Configuration of the durable page store.
#[derive(Debug, Clone)]
pub struct PageStoreConfig {
    pub path: PathBuf,
    /// Identifier recorded in the file header.
    pub file_id: u32,
    /// fsync data and superblock on every checkpoint.
    pub sync_on_checkpoint: bool,
}

impl PageStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_id: 0,
            sync_on_checkpoint: true,
        }
    }

    pub fn with_file_id(mut self, file_id: u32) -> Self {
        self.file_id = file_id;
        self
    }
}

/// Top-level configuration of a [`DataManager`](crate::DataManager).
#[derive(Debug, Clone)]
pub struct DataManagerConfig {
    pub cpu: TierConfig,
    /// One entry per GPU device, indexed by device number.
    pub gpus: Vec<TierConfig>,
    pub foreign_cache: ForeignCacheConfig,
    pub page_store: PageStoreConfig,
}

impl DataManagerConfig {
    pub fn new(page_store_path: impl Into<PathBuf>) -> Self {
        Self {
            cpu: TierConfig::default(),
            gpus: Vec::new(),
            foreign_cache: ForeignCacheConfig::default(),
            page_store: PageStoreConfig::new(page_store_path),
        }
    }

    pub fn with_cpu(mut self, cpu: TierConfig) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_gpu(mut self, gpu: TierConfig) -> Self {
        self.gpus.push(gpu);
        self
    }

    pub fn with_foreign_cache(mut self, foreign_cache: ForeignCacheConfig) -> Self {
        self.foreign_cache = foreign_cache;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.cpu.validate()?;
        for gpu in &self.gpus {
            gpu.validate()?;
        }
        self.foreign_cache.validate()
    }
}
