//! tiercache - A tiered chunk buffer manager for columnar data.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           tiercache                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │            Data Manager (data_manager)                   │   │
//! │  │   get_chunk_buffer / put_chunk_buffer / checkpoint       │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │           Tier Managers (buffer/)                        │   │
//! │  │   ┌──────────┐   ┌──────────┐   ┌──────────┐            │   │
//! │  │   │   GPU0   │   │   GPU1   │   │   CPU    │  ...       │   │
//! │  │   └──────────┘   └──────────┘   └──────────┘            │   │
//! │  │   Slabs + Buffers + LRU/FIFO + pinned BufferHandles      │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                 ↓                              ↓                │
//! │  ┌───────────────────────────┐  ┌──────────────────────────┐   │
//! │  │   Page Store (storage/)   │  │ Foreign Cache (foreign/) │   │
//! │  │ versioned page chains,    │  │ byte budget, disk spill, │   │
//! │  │ superblocks, checkpoints  │  │ single-flight fetches    │   │
//! │  └───────────────────────────┘  └──────────────────────────┘   │
//! │                                              ↓                  │
//! │                                 DataWrapper (external sources)  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (ChunkKey, TierId, PageId, Error, config)
//! - [`buffer`] - Tier managers, buffers, slabs and eviction policies
//! - [`storage`] - Page file, page formats and the durable page store
//! - [`foreign`] - Foreign storage cache and the data wrapper interface
//! - [`data_manager`] - The facade tying tiers and sources together
//!
//! # Quick Start
//! ```no_run
//! use tiercache::{ChunkKey, DataManager, DataManagerConfig, EncodingMetadata, TierId};
//!
//! let dm = DataManager::open(DataManagerConfig::new("chunks.db")).unwrap();
//! let key = ChunkKey::new(1, 1, 0, 0);
//!
//! dm.put_chunk_buffer(key, &[0u8; 1024], EncodingMetadata::default()).unwrap();
//! let handle = dm.get_chunk_buffer(key, TierId::Cpu).unwrap();
//! assert_eq!(handle.size(), 1024);
//! ```

pub mod buffer;
pub mod common;
pub mod data_manager;
pub mod foreign;
pub mod storage;

// Re-export commonly used items at crate root for convenience
pub use common::config::{
    DataManagerConfig, ForeignCacheConfig, PageStoreConfig, PolicyKind, TierConfig, PAGE_SIZE,
};
pub use common::{ChunkKey, ChunkPart, Compression, EncodingMetadata, Error, PageId, Result, TierId};

pub use buffer::{Buffer, BufferHandle, FlushTarget, MemoryBackend, MemorySummary, TierManager, TierStats};
pub use data_manager::{Catalog, ChunkLayout, DataManager};
pub use foreign::{ChunkProvenance, DataWrapper, ForeignChunk, ForeignStorageCache};
pub use storage::{ChunkState, PageStore, StoredChunk};
