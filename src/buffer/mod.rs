//! Tiered buffer management.
//!
//! Each memory tier (host RAM, one GPU device) has its own [`TierManager`]
//! caching chunk buffers on a slab allocator with a hard capacity.
//!
//! # Components
//! - [`TierManager`] - the per-tier cache engine
//! - [`Buffer`] - one chunk's bytes plus size, pin and dirty state
//! - [`BufferHandle`] - RAII pin on a buffer
//! - [`MemoryBackend`] - raw tier memory ([`HostMemory`], [`SimulatedDeviceMemory`])
//! - [`replacer`] - eviction policy implementations
//! - [`TierStats`] / [`MemorySummary`] - counters and layout snapshots

#[allow(clippy::module_inception)]
mod buffer;
mod handle;
mod memory;
pub mod replacer;
mod slab;
mod stats;
mod summary;
mod tier_manager;

pub use buffer::Buffer;
pub use handle::BufferHandle;
pub use memory::{HostMemory, MemoryBackend, SimulatedDeviceMemory, SlabAllocation};
pub use stats::{TierStats, TierStatsSnapshot};
pub use summary::{MemorySummary, SegmentSummary, SlabSummary};
pub use tier_manager::{FlushTarget, TierManager};
