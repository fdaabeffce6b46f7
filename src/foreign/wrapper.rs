//! Data wrapper interface to external sources.

use bytes::Bytes;

use crate::common::{ChunkKey, EncodingMetadata, Result};

use super::entry::{ChunkProvenance, ForeignChunk};

/// Reads chunks of a foreign table from its external source.
///
/// Implementations report failures as `Error::SourceUnavailable` or
/// `Error::Parse`; the cache and the data manager pass them through
/// unchanged.
pub trait DataWrapper: Send + Sync {
    /// Locate the source region holding `key`.
    fn provenance(&self, key: &ChunkKey) -> Result<ChunkProvenance>;

    /// Read and decode the chunk described by `provenance`.
    fn fetch_chunk(&self, key: &ChunkKey, provenance: &ChunkProvenance) -> Result<Bytes>;

    /// Encoding of the decoded bytes. Plain, uncompressed by default.
    fn encoding(&self, _key: &ChunkKey) -> EncodingMetadata {
        EncodingMetadata::default()
    }

    /// Locate, fetch and wrap `key` as a cache entry.
    fn materialize(&self, key: &ChunkKey) -> Result<ForeignChunk> {
        let provenance = self.provenance(key)?;
        let data = self.fetch_chunk(key, &provenance)?;
        Ok(ForeignChunk::new(data, self.encoding(key), provenance))
    }
}
