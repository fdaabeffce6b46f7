//! Foreign storage: chunks of tables whose data lives outside the page store.
//!
//! - [`DataWrapper`] - reads chunks from an external source
//! - [`ForeignStorageCache`] - byte-bounded cache of fetched chunks with
//!   disk spill and single-flight fetches
//! - [`ChunkProvenance`] - where a cached chunk came from, for refresh

mod cache;
mod entry;
mod spill;
mod stats;
mod wrapper;

pub use cache::ForeignStorageCache;
pub use entry::{ChunkProvenance, ForeignChunk};
pub use stats::{ForeignCacheStats, ForeignCacheStatsSnapshot};
pub use wrapper::DataWrapper;
