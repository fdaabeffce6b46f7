//! Error types for tiercache.

use thiserror::Error;

use crate::common::{ChunkKey, TierId};

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in tiercache.
///
/// Allocation and pin errors are surfaced to the immediate caller and never
/// retried internally. I/O and data wrapper errors pass through unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from page file or spill file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tier could not satisfy a request even after eviction, e.g. because
    /// flushing a dirty victim failed or the memory backend refused a slab.
    #[error("allocation of {requested} bytes failed on {tier}: {reason}")]
    Allocation {
        tier: TierId,
        requested: usize,
        reason: String,
    },

    /// The request cannot fit: it is larger than the tier, or every
    /// remaining buffer is pinned.
    #[error("{tier} cannot fit {requested} bytes ({available} bytes reclaimable)")]
    CapacityExceeded {
        tier: TierId,
        requested: usize,
        available: usize,
    },

    /// Attempted to free a buffer that is still pinned.
    #[error("{key} is pinned ({pin_count} pins)")]
    BufferPinned { key: ChunkKey, pin_count: u32 },

    /// The tier holds no buffer for the key.
    #[error("{key} is not resident on {tier}")]
    BufferNotFound { key: ChunkKey, tier: TierId },

    /// Read or write past the buffer bounds.
    #[error("access of {len} bytes at offset {offset} exceeds limit {limit}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        limit: usize,
    },

    /// No committed or pending version of the chunk exists.
    #[error("{0} not found in page store")]
    ChunkNotFound(ChunkKey),

    /// External source could not be reached.
    #[error("source {source_path} unavailable: {reason}")]
    SourceUnavailable { source_path: String, reason: String },

    /// External source returned data that could not be decoded.
    #[error("failed to parse {source_path}: {reason}")]
    Parse { source_path: String, reason: String },

    /// Page chain, checksum or header mismatch on a durable read.
    #[error("corruption at page {page}: {reason}")]
    Corruption { page: u32, reason: String },

    /// Requested page does not exist on disk.
    #[error("page {0} not found")]
    PageNotFound(u32),

    /// The device number does not name a configured tier.
    #[error("no tier configured for {0}")]
    InvalidDevice(TierId),

    /// Writes to a table backed by a data wrapper.
    #[error("table ({db_id},{table_id}) is foreign and read-only")]
    ForeignTableReadOnly { db_id: u32, table_id: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True for errors that a caller may resolve by releasing pins and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::BufferPinned { .. }
        )
    }
}
