//! Point-in-time view of a tier's memory layout.

use std::fmt;

use crate::common::{ChunkKey, TierId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub offset: usize,
    pub len: usize,
    /// `None` for a free segment.
    pub owner: Option<ChunkKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabSummary {
    pub id: u32,
    pub bytes: usize,
    pub segments: Vec<SegmentSummary>,
}

impl SlabSummary {
    pub fn free_bytes(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.owner.is_none())
            .map(|s| s.len)
            .sum()
    }
}

/// Memory usage of one tier, as returned by
/// [`TierManager::memory_summary`](super::TierManager::memory_summary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySummary {
    pub tier: TierId,
    pub capacity: usize,
    /// Bytes held from the memory backend.
    pub slab_bytes: usize,
    /// Bytes bound to buffers.
    pub reserved_bytes: usize,
    /// Bytes logically populated across buffers.
    pub used_bytes: usize,
    pub buffers: usize,
    pub pinned: usize,
    pub dirty: usize,
    pub slabs: Vec<SlabSummary>,
}

impl Default for MemorySummary {
    fn default() -> Self {
        Self {
            tier: TierId::Cpu,
            capacity: 0,
            slab_bytes: 0,
            reserved_bytes: 0,
            used_bytes: 0,
            buffers: 0,
            pinned: 0,
            dirty: 0,
            slabs: Vec::new(),
        }
    }
}

impl fmt::Display for MemorySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} of {} bytes reserved, {} used, {} buffers ({} pinned, {} dirty)",
            self.tier,
            self.reserved_bytes,
            self.capacity,
            self.used_bytes,
            self.buffers,
            self.pinned,
            self.dirty
        )?;
        for slab in &self.slabs {
            write!(f, "  slab {} ({} bytes):", slab.id, slab.bytes)?;
            for segment in &slab.segments {
                match &segment.owner {
                    Some(key) => write!(f, " [{}+{} {}]", segment.offset, segment.len, key)?,
                    None => write!(f, " [{}+{} free]", segment.offset, segment.len)?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_segments() {
        let summary = MemorySummary {
            tier: TierId::Gpu(1),
            capacity: 2048,
            slab_bytes: 2048,
            reserved_bytes: 512,
            used_bytes: 100,
            buffers: 1,
            pinned: 0,
            dirty: 0,
            slabs: vec![SlabSummary {
                id: 0,
                bytes: 2048,
                segments: vec![
                    SegmentSummary {
                        offset: 0,
                        len: 512,
                        owner: Some(ChunkKey::new(1, 2, 3, 4)),
                    },
                    SegmentSummary {
                        offset: 512,
                        len: 1536,
                        owner: None,
                    },
                ],
            }],
        };

        let text = summary.to_string();
        assert!(text.starts_with("GPU1: 512 of 2048 bytes reserved"));
        assert!(text.contains("[0+512 Chunk(1,2,3,4)]"));
        assert!(text.contains("[512+1536 free]"));
        assert_eq!(summary.slabs[0].free_bytes(), 1536);
    }
}
