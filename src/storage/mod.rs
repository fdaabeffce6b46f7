//! Storage layer - the durable page store behind the buffer tiers.
//!
//! - [`PageStore`] - epoch-versioned chunk storage with checkpoints
//! - [`DiskManager`] - low-level page file I/O
//! - [`Superblock`] / [`ChunkHeader`] - on-disk metadata records
//! - [`page`] - page types and layouts

mod chunk_header;
mod disk_manager;
pub mod page;
mod page_store;
mod stats;
mod superblock;

pub use chunk_header::ChunkHeader;
pub use disk_manager::DiskManager;
pub use page_store::{ChunkState, PageStore, StoredChunk};
pub use stats::{PageStoreSnapshot, PageStoreStats};
pub use superblock::Superblock;
