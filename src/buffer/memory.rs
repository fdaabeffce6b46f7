//! Tier memory backends.
//!
//! A [`MemoryBackend`] hands out raw slabs to a tier's slab allocator and
//! moves bytes in and out of them. [`HostMemory`] backs the CPU tier;
//! [`SimulatedDeviceMemory`] stands in for a GPU runtime with a hard device
//! memory limit. A real device runtime plugs in behind the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{Error, Result, TierId};

/// A slab obtained from a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabAllocation {
    pub id: u64,
    pub size: usize,
}

/// Raw allocate/free/copy primitives of one memory tier.
pub trait MemoryBackend: Send + Sync {
    /// Tier this memory belongs to.
    fn tier(&self) -> TierId;

    fn allocate(&self, size: usize) -> Result<SlabAllocation>;

    fn deallocate(&self, allocation: &SlabAllocation) -> Result<()>;

    /// Copy `out.len()` bytes at `offset` of the slab into `out`.
    fn read(&self, allocation: &SlabAllocation, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Copy `data` into the slab at `offset`.
    fn write(&self, allocation: &SlabAllocation, offset: usize, data: &[u8]) -> Result<()>;

    /// Bytes currently allocated across live slabs.
    fn allocated_bytes(&self) -> usize;

    /// Hard limit of the underlying memory, if any.
    fn capacity(&self) -> Option<usize>;
}

// -- Shared slab arena ---------------------------------------------------------

type SlabBytes = Arc<RwLock<Box<[u8]>>>;

struct Arena {
    tier: TierId,
    limit: Option<usize>,
    next_id: AtomicU64,
    slabs: RwLock<HashMap<u64, SlabBytes>>,
}

impl Arena {
    fn new(tier: TierId, limit: Option<usize>) -> Self {
        Self {
            tier,
            limit,
            next_id: AtomicU64::new(1),
            slabs: RwLock::new(HashMap::new()),
        }
    }

    fn allocated(&self) -> usize {
        self.slabs.read().values().map(|s| s.read().len()).sum()
    }

    fn allocate(&self, size: usize) -> Result<SlabAllocation> {
        let mut slabs = self.slabs.write();
        if let Some(limit) = self.limit {
            let total: usize = slabs.values().map(|s| s.read().len()).sum();
            if total + size > limit {
                return Err(Error::Allocation {
                    tier: self.tier,
                    requested: size,
                    reason: format!("device memory exhausted ({} of {} bytes in use)", total, limit),
                });
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slabs.insert(id, Arc::new(RwLock::new(vec![0u8; size].into_boxed_slice())));
        Ok(SlabAllocation { id, size })
    }

    fn deallocate(&self, allocation: &SlabAllocation) -> Result<()> {
        match self.slabs.write().remove(&allocation.id) {
            Some(_) => Ok(()),
            None => Err(Error::Allocation {
                tier: self.tier,
                requested: allocation.size,
                reason: format!("double free or unknown slab id={}", allocation.id),
            }),
        }
    }

    fn slab(&self, allocation: &SlabAllocation, offset: usize, len: usize) -> Result<SlabBytes> {
        if offset.checked_add(len).map_or(true, |end| end > allocation.size) {
            return Err(Error::OutOfBounds {
                offset,
                len,
                limit: allocation.size,
            });
        }
        self.slabs
            .read()
            .get(&allocation.id)
            .cloned()
            .ok_or_else(|| Error::Allocation {
                tier: self.tier,
                requested: len,
                reason: format!("access to released slab id={}", allocation.id),
            })
    }

    fn read(&self, allocation: &SlabAllocation, offset: usize, out: &mut [u8]) -> Result<()> {
        let slab = self.slab(allocation, offset, out.len())?;
        let bytes = slab.read();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, allocation: &SlabAllocation, offset: usize, data: &[u8]) -> Result<()> {
        let slab = self.slab(allocation, offset, data.len())?;
        let mut bytes = slab.write();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

// -- Host memory -----------------------------------------------------------------

/// Host RAM for the CPU tier. The tier's configured capacity is the only limit.
pub struct HostMemory {
    arena: Arena,
}

impl HostMemory {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(TierId::Cpu, None),
        }
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for HostMemory {
    fn tier(&self) -> TierId {
        TierId::Cpu
    }

    fn allocate(&self, size: usize) -> Result<SlabAllocation> {
        self.arena.allocate(size)
    }

    fn deallocate(&self, allocation: &SlabAllocation) -> Result<()> {
        self.arena.deallocate(allocation)
    }

    fn read(&self, allocation: &SlabAllocation, offset: usize, out: &mut [u8]) -> Result<()> {
        self.arena.read(allocation, offset, out)
    }

    fn write(&self, allocation: &SlabAllocation, offset: usize, data: &[u8]) -> Result<()> {
        self.arena.write(allocation, offset, data)
    }

    fn allocated_bytes(&self) -> usize {
        self.arena.allocated()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

// -- Simulated device memory -------------------------------------------------------

/// GPU device memory with a hard byte limit, held in host RAM.
pub struct SimulatedDeviceMemory {
    device: u16,
    arena: Arena,
}

impl SimulatedDeviceMemory {
    pub fn new(device: u16, device_bytes: usize) -> Self {
        Self {
            device,
            arena: Arena::new(TierId::Gpu(device), Some(device_bytes)),
        }
    }

    /// Number of live slabs; zero after a tier releases everything.
    pub fn live_slabs(&self) -> usize {
        self.arena.slabs.read().len()
    }
}

impl MemoryBackend for SimulatedDeviceMemory {
    fn tier(&self) -> TierId {
        TierId::Gpu(self.device)
    }

    fn allocate(&self, size: usize) -> Result<SlabAllocation> {
        self.arena.allocate(size)
    }

    fn deallocate(&self, allocation: &SlabAllocation) -> Result<()> {
        self.arena.deallocate(allocation)
    }

    fn read(&self, allocation: &SlabAllocation, offset: usize, out: &mut [u8]) -> Result<()> {
        self.arena.read(allocation, offset, out)
    }

    fn write(&self, allocation: &SlabAllocation, offset: usize, data: &[u8]) -> Result<()> {
        self.arena.write(allocation, offset, data)
    }

    fn allocated_bytes(&self) -> usize {
        self.arena.allocated()
    }

    fn capacity(&self) -> Option<usize> {
        self.arena.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_read_write() {
        let memory = HostMemory::new();
        let slab = memory.allocate(64).unwrap();
        memory.write(&slab, 10, b"hello").unwrap();

        let mut out = [0u8; 5];
        memory.read(&slab, 10, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(memory.allocated_bytes(), 64);
    }

    #[test]
    fn test_out_of_slab_access() {
        let memory = HostMemory::new();
        let slab = memory.allocate(16).unwrap();
        assert!(matches!(
            memory.write(&slab, 12, b"too long"),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_device_limit_enforced() {
        let memory = SimulatedDeviceMemory::new(1, 100);
        let a = memory.allocate(60).unwrap();
        assert!(matches!(memory.allocate(50), Err(Error::Allocation { .. })));

        memory.deallocate(&a).unwrap();
        assert!(memory.allocate(100).is_ok());
        assert_eq!(memory.capacity(), Some(100));
        assert_eq!(memory.tier(), TierId::Gpu(1));
    }

    #[test]
    fn test_double_free() {
        let memory = SimulatedDeviceMemory::new(0, 100);
        let a = memory.allocate(10).unwrap();
        memory.deallocate(&a).unwrap();
        assert!(memory.deallocate(&a).is_err());
        assert_eq!(memory.live_slabs(), 0);
    }
}
