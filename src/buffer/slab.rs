//! Slab allocator for one tier.
//!
//! Tier memory is a set of slabs obtained from the tier's
//! [`MemoryBackend`](super::MemoryBackend). Each slab is an ordered list of
//! segments that are either free or bound to one chunk.

use std::collections::BTreeMap;

use crate::common::ChunkKey;

use super::memory::SlabAllocation;

/// The region of tier memory bound to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub slab: u32,
    pub allocation: SlabAllocation,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub offset: usize,
    pub len: usize,
    pub owner: Option<ChunkKey>,
}

pub(crate) struct Slab {
    pub allocation: SlabAllocation,
    /// Sorted by offset, contiguous, covering the whole slab.
    pub segments: Vec<Segment>,
}

impl Slab {
    fn new(allocation: SlabAllocation) -> Self {
        Self {
            allocation,
            segments: vec![Segment {
                offset: 0,
                len: allocation.size,
                owner: None,
            }],
        }
    }

    fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.owner.is_none())
    }

    fn find(&self, offset: usize) -> Option<usize> {
        self.segments.binary_search_by_key(&offset, |s| s.offset).ok()
    }

    /// Merge the free segment at `idx` with free neighbours.
    fn coalesce(&mut self, mut idx: usize) {
        if idx + 1 < self.segments.len() && self.segments[idx + 1].owner.is_none() {
            let next = self.segments.remove(idx + 1);
            self.segments[idx].len += next.len;
        }
        if idx > 0 && self.segments[idx - 1].owner.is_none() {
            let current = self.segments.remove(idx);
            idx -= 1;
            self.segments[idx].len += current.len;
        }
    }
}

/// All slabs of a tier.
///
/// Not thread safe; the tier manager keeps it behind its state mutex.
pub(crate) struct SlabSet {
    slabs: BTreeMap<u32, Slab>,
    next_slab: u32,
    total_bytes: usize,
}

impl SlabSet {
    pub fn new() -> Self {
        Self {
            slabs: BTreeMap::new(),
            next_slab: 0,
            total_bytes: 0,
        }
    }

    /// Bytes held from the memory backend.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Bytes bound to buffers.
    pub fn bound_bytes(&self) -> usize {
        self.slabs
            .values()
            .flat_map(|slab| slab.segments.iter())
            .filter(|s| s.owner.is_some())
            .map(|s| s.len)
            .sum()
    }

    pub fn add_slab(&mut self, allocation: SlabAllocation) -> u32 {
        let id = self.next_slab;
        self.next_slab += 1;
        self.total_bytes += allocation.size;
        self.slabs.insert(id, Slab::new(allocation));
        id
    }

    /// Bind the smallest free segment of at least `len` bytes to `owner`.
    pub fn allocate_best_fit(&mut self, len: usize, owner: ChunkKey) -> Option<Extent> {
        let (slab_id, idx) = self
            .slabs
            .iter()
            .flat_map(|(id, slab)| {
                slab.segments
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.owner.is_none() && s.len >= len)
                    .map(move |(idx, s)| (s.len, *id, idx))
            })
            .min()
            .map(|(_, id, idx)| (id, idx))?;

        let slab = self.slabs.get_mut(&slab_id)?;
        let segment = &mut slab.segments[idx];
        let offset = segment.offset;
        let remainder = segment.len - len;
        segment.len = len;
        segment.owner = Some(owner);
        if remainder > 0 {
            slab.segments.insert(
                idx + 1,
                Segment {
                    offset: offset + len,
                    len: remainder,
                    owner: None,
                },
            );
        }

        Some(Extent {
            slab: slab_id,
            allocation: slab.allocation,
            offset,
            len,
        })
    }

    /// Grow `extent` in place to `new_len` by absorbing the following free
    /// segment. Returns the grown extent, or `None` if there is no room.
    pub fn try_grow(&mut self, extent: &Extent, new_len: usize) -> Option<Extent> {
        let slab = self.slabs.get_mut(&extent.slab)?;
        let idx = slab.find(extent.offset)?;
        let extra = new_len.checked_sub(slab.segments[idx].len)?;
        let next = slab.segments.get(idx + 1)?;
        if next.owner.is_some() || next.len < extra {
            return None;
        }

        if next.len == extra {
            slab.segments.remove(idx + 1);
        } else {
            let next = &mut slab.segments[idx + 1];
            next.offset += extra;
            next.len -= extra;
        }
        slab.segments[idx].len = new_len;
        Some(Extent {
            len: new_len,
            ..*extent
        })
    }

    /// Return `extent` to its slab's free list.
    pub fn release(&mut self, extent: &Extent) {
        if let Some(slab) = self.slabs.get_mut(&extent.slab) {
            if let Some(idx) = slab.find(extent.offset) {
                slab.segments[idx].owner = None;
                slab.coalesce(idx);
            }
        }
    }

    /// Remove every slab with no bound segment and return their allocations.
    pub fn take_empty_slabs(&mut self) -> Vec<SlabAllocation> {
        let empty: Vec<u32> = self
            .slabs
            .iter()
            .filter(|(_, slab)| slab.is_empty())
            .map(|(id, _)| *id)
            .collect();
        empty
            .into_iter()
            .filter_map(|id| self.slabs.remove(&id))
            .map(|slab| {
                self.total_bytes -= slab.allocation.size;
                slab.allocation
            })
            .collect()
    }

    pub fn slabs(&self) -> impl Iterator<Item = (&u32, &Slab)> {
        self.slabs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fragment: u32) -> ChunkKey {
        ChunkKey::new(1, 1, 1, fragment)
    }

    fn slab_set(sizes: &[usize]) -> SlabSet {
        let mut set = SlabSet::new();
        for (i, size) in sizes.iter().enumerate() {
            set.add_slab(SlabAllocation {
                id: i as u64,
                size: *size,
            });
        }
        set
    }

    #[test]
    fn test_allocate_splits_segment() {
        let mut set = slab_set(&[1024]);
        let a = set.allocate_best_fit(256, key(0)).unwrap();
        let b = set.allocate_best_fit(256, key(1)).unwrap();

        assert_eq!((a.offset, a.len), (0, 256));
        assert_eq!((b.offset, b.len), (256, 256));
        assert_eq!(set.bound_bytes(), 512);
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let mut set = slab_set(&[1024]);
        let a = set.allocate_best_fit(512, key(0)).unwrap();
        let _b = set.allocate_best_fit(128, key(1)).unwrap();
        set.release(&a);
        // Free: [0, 512) and [640, 1024) of 384 bytes.
        let c = set.allocate_best_fit(300, key(2)).unwrap();
        assert_eq!(c.offset, 640);
    }

    #[test]
    fn test_release_coalesces() {
        let mut set = slab_set(&[768]);
        let a = set.allocate_best_fit(256, key(0)).unwrap();
        let b = set.allocate_best_fit(256, key(1)).unwrap();
        let c = set.allocate_best_fit(256, key(2)).unwrap();
        assert!(set.allocate_best_fit(512, key(3)).is_none());

        set.release(&a);
        set.release(&c);
        set.release(&b);
        let whole = set.allocate_best_fit(768, key(3)).unwrap();
        assert_eq!(whole.offset, 0);
    }

    #[test]
    fn test_grow_in_place() {
        let mut set = slab_set(&[1024]);
        let a = set.allocate_best_fit(256, key(0)).unwrap();
        let grown = set.try_grow(&a, 512).unwrap();
        assert_eq!(grown.len, 512);

        let _b = set.allocate_best_fit(512, key(1)).unwrap();
        assert!(set.try_grow(&grown, 768).is_none());
    }

    #[test]
    fn test_take_empty_slabs() {
        let mut set = slab_set(&[512, 512]);
        let a = set.allocate_best_fit(512, key(0)).unwrap();
        assert_eq!(set.take_empty_slabs().len(), 1);
        assert_eq!(set.total_bytes(), 512);

        set.release(&a);
        assert_eq!(set.take_empty_slabs().len(), 1);
        assert_eq!(set.total_bytes(), 0);
    }
}
