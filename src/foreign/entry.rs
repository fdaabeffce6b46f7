//! Foreign cache entry types.

use std::ops::Range;

use bytes::Bytes;

use crate::common::EncodingMetadata;

/// Where a foreign chunk came from.
///
/// Recorded with every cached entry so a refreshed source can invalidate
/// exactly the chunks it produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkProvenance {
    /// External file or object path.
    pub source_path: String,
    /// Row group (or stripe) inside the source.
    pub row_group: u32,
    /// Byte range of the source the chunk was decoded from.
    pub byte_range: Range<u64>,
    /// Source modification stamp at fetch time.
    pub modified: u64,
}

impl ChunkProvenance {
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            ..Self::default()
        }
    }

    pub fn with_row_group(mut self, row_group: u32) -> Self {
        self.row_group = row_group;
        self
    }

    pub fn with_byte_range(mut self, byte_range: Range<u64>) -> Self {
        self.byte_range = byte_range;
        self
    }

    pub fn with_modified(mut self, modified: u64) -> Self {
        self.modified = modified;
        self
    }
}

/// A materialized chunk held by the foreign storage cache.
///
/// `data` is reference counted, so clones handed to readers share one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignChunk {
    pub data: Bytes,
    pub encoding: EncodingMetadata,
    pub provenance: ChunkProvenance,
}

impl ForeignChunk {
    pub fn new(data: impl Into<Bytes>, encoding: EncodingMetadata, provenance: ChunkProvenance) -> Self {
        Self {
            data: data.into(),
            encoding,
            provenance,
        }
    }

    /// Payload size in bytes, the unit of the cache budget.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
