//! Buffer - one chunk's bytes resident in one tier.
//!
//! A [`Buffer`] tracks, next to the bytes themselves:
//! - Logical size and reserved (allocated) size
//! - Pin count for reference counting
//! - Dirty flag for write-back tracking
//! - Encoding metadata carried through copies and flushes

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{ChunkKey, EncodingMetadata, Error, Result, TierId};

use super::memory::MemoryBackend;
use super::slab::Extent;

/// Population state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferStatus {
    /// Placeholder registered; its creator is filling it.
    Populating,
    Populated,
    /// Evicted or freed; the extent went back to the slab.
    Detached,
}

struct BufferMeta {
    extent: Option<Extent>,
    size: usize,
    appendable: bool,
    encoding: EncodingMetadata,
    status: BufferStatus,
}

/// A chunk buffer owned by a tier manager.
///
/// Consumers reach a buffer only through a pinned
/// [`BufferHandle`](super::BufferHandle). Mutations are visible at once to
/// every holder of a handle to the same buffer.
///
/// # Thread Safety
/// - `meta`: `RwLock` for extent, size and encoding
/// - `pin_count`: `AtomicU32` for lock-free reference counting
/// - `is_dirty`: `AtomicBool`, set while holding the `meta` write lock
pub struct Buffer {
    key: ChunkKey,
    tier: TierId,
    memory: Arc<dyn MemoryBackend>,
    meta: RwLock<BufferMeta>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Buffer {
    pub(crate) fn new(
        key: ChunkKey,
        tier: TierId,
        memory: Arc<dyn MemoryBackend>,
        extent: Extent,
        status: BufferStatus,
    ) -> Self {
        Self {
            key,
            tier,
            memory,
            meta: RwLock::new(BufferMeta {
                extent: Some(extent),
                size: 0,
                appendable: false,
                encoding: EncodingMetadata::default(),
                status,
            }),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn key(&self) -> ChunkKey {
        self.key
    }

    #[inline]
    pub fn tier(&self) -> TierId {
        self.tier
    }

    /// Bytes logically populated.
    pub fn size(&self) -> usize {
        self.meta.read().size
    }

    /// Bytes allocated in tier memory.
    pub fn reserved_size(&self) -> usize {
        self.meta.read().extent.map_or(0, |e| e.len)
    }

    pub fn encoding(&self) -> EncodingMetadata {
        self.meta.read().encoding
    }

    pub fn set_encoding(&self, encoding: EncodingMetadata) {
        self.meta.write().encoding = encoding;
    }

    pub fn is_appendable(&self) -> bool {
        self.meta.read().appendable
    }

    /// Appendable buffers grow on writes past their reserved size.
    pub fn set_appendable(&self, appendable: bool) {
        self.meta.write().appendable = appendable;
    }

    // ========================================================================
    // Content access
    // ========================================================================

    /// Read `len` bytes at `offset`.
    ///
    /// # Errors
    /// `Error::OutOfBounds` if the range extends past `size`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let size = self.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::OutOfBounds { offset, len, limit: size });
        }
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Read the whole populated contents.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let meta = self.meta.read();
        let mut out = vec![0u8; meta.size];
        self.copy_out(&meta, 0, &mut out)?;
        Ok(out)
    }

    pub fn read_into(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let meta = self.meta.read();
        if offset.checked_add(out.len()).map_or(true, |end| end > meta.size) {
            return Err(Error::OutOfBounds {
                offset,
                len: out.len(),
                limit: meta.size,
            });
        }
        self.copy_out(&meta, offset, out)
    }

    /// Write `data` at `offset` within the reserved extent.
    ///
    /// Writes may start at most at `size`; the populated region never has holes.
    pub(crate) fn write_within(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut meta = self.meta.write();
        let extent = self.live_extent(&meta)?;
        let end = offset.checked_add(data.len());
        if offset > meta.size || end.map_or(true, |end| end > extent.len) {
            return Err(Error::OutOfBounds {
                offset,
                len: data.len(),
                limit: if offset > meta.size { meta.size } else { extent.len },
            });
        }
        self.memory
            .write(&extent.allocation, extent.offset + offset, data)?;
        meta.size = meta.size.max(offset + data.len());
        self.is_dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Replace the contents with `data`, truncating `size` to its length.
    pub(crate) fn replace(&self, data: &[u8]) -> Result<()> {
        let mut meta = self.meta.write();
        let extent = self.live_extent(&meta)?;
        if data.len() > extent.len {
            return Err(Error::OutOfBounds {
                offset: 0,
                len: data.len(),
                limit: extent.len,
            });
        }
        self.memory.write(&extent.allocation, extent.offset, data)?;
        meta.size = data.len();
        self.is_dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn copy_out(&self, meta: &BufferMeta, offset: usize, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let extent = self.live_extent(meta)?;
        self.memory
            .read(&extent.allocation, extent.offset + offset, out)
    }

    fn live_extent(&self, meta: &BufferMeta) -> Result<Extent> {
        meta.extent.ok_or(Error::BufferNotFound {
            key: self.key,
            tier: self.tier,
        })
    }

    // ========================================================================
    // Pin count operations (Atomic)
    // ========================================================================

    /// Increment the pin count. Returns the new pin count.
    #[inline]
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the pin count. Returns the new pin count.
    ///
    /// # Panics
    /// Panics if pin count is already 0.
    #[inline]
    pub(crate) fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "pin count underflow");
        old - 1
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    // ========================================================================
    // Dirty flag operations (Atomic)
    // ========================================================================

    #[inline]
    pub fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, e.g. after the caller persisted the contents.
    #[inline]
    pub fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    // ========================================================================
    // Tier manager bookkeeping
    // ========================================================================

    pub(crate) fn status(&self) -> BufferStatus {
        self.meta.read().status
    }

    pub(crate) fn mark_populated(&self) {
        self.meta.write().status = BufferStatus::Populated;
    }

    /// Unpinned, populated, and either clean or flushable.
    pub(crate) fn is_evictable(&self, can_flush: bool) -> bool {
        !self.is_pinned()
            && self.status() == BufferStatus::Populated
            && (can_flush || !self.is_dirty())
    }

    pub(crate) fn extent(&self) -> Option<Extent> {
        self.meta.read().extent
    }

    pub(crate) fn set_extent(&self, extent: Extent) {
        self.meta.write().extent = Some(extent);
    }

    /// Move the populated bytes into `target` and return the old extent.
    pub(crate) fn relocate(&self, target: Extent) -> Result<Option<Extent>> {
        let mut meta = self.meta.write();
        if let Some(old) = meta.extent {
            if meta.size > 0 {
                let mut bytes = vec![0u8; meta.size];
                self.memory
                    .read(&old.allocation, old.offset, &mut bytes)?;
                self.memory
                    .write(&target.allocation, target.offset, &bytes)?;
            }
        }
        Ok(meta.extent.replace(target))
    }

    /// Detach from tier memory, returning the extent to release.
    pub(crate) fn detach(&self) -> Option<Extent> {
        let mut meta = self.meta.write();
        meta.status = BufferStatus::Detached;
        meta.size = 0;
        meta.extent.take()
    }

    /// Hand the contents to `flush` if dirty, then clear the dirty flag.
    ///
    /// Holds the `meta` write lock throughout so no write interleaves.
    /// Returns whether anything was flushed.
    pub(crate) fn flush_with<F>(&self, flush: F) -> Result<bool>
    where
        F: FnOnce(&ChunkKey, &[u8], EncodingMetadata) -> Result<()>,
    {
        let meta = self.meta.write();
        if !self.is_dirty() {
            return Ok(false);
        }
        let mut data = vec![0u8; meta.size];
        self.copy_out(&meta, 0, &mut data)?;
        flush(&self.key, &data, meta.encoding)?;
        self.is_dirty.store(false, Ordering::Release);
        Ok(true)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.read();
        f.debug_struct("Buffer")
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("size", &meta.size)
            .field("reserved", &meta.extent.map_or(0, |e| e.len))
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("status", &meta.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::memory::HostMemory;

    fn test_buffer(reserved: usize) -> Buffer {
        let memory: Arc<dyn MemoryBackend> = Arc::new(HostMemory::new());
        let allocation = memory.allocate(reserved).unwrap();
        let extent = Extent {
            slab: 0,
            allocation,
            offset: 0,
            len: reserved,
        };
        Buffer::new(
            ChunkKey::new(1, 2, 3, 4),
            TierId::Cpu,
            memory,
            extent,
            BufferStatus::Populated,
        )
    }

    #[test]
    fn test_buffer_new() {
        let buffer = test_buffer(64);
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.reserved_size(), 64);
        assert!(!buffer.is_pinned());
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn test_write_and_read() {
        let buffer = test_buffer(64);
        buffer.write_within(0, b"abcdef").unwrap();
        buffer.write_within(6, b"gh").unwrap();

        assert_eq!(buffer.size(), 8);
        assert!(buffer.is_dirty());
        assert_eq!(buffer.read(2, 3).unwrap(), b"cde");
        assert_eq!(buffer.read_all().unwrap(), b"abcdefgh");
    }

    #[test]
    fn test_read_past_size() {
        let buffer = test_buffer(64);
        buffer.write_within(0, b"abc").unwrap();
        assert!(matches!(
            buffer.read(2, 2),
            Err(Error::OutOfBounds { limit: 3, .. })
        ));
    }

    #[test]
    fn test_write_bounds() {
        let buffer = test_buffer(8);
        // Past reserved size.
        assert!(buffer.write_within(0, &[0u8; 9]).is_err());
        // Leaves a hole after size.
        assert!(buffer.write_within(1, b"x").is_err());
    }

    #[test]
    fn test_huge_offsets_are_out_of_bounds() {
        let buffer = test_buffer(8);
        buffer.write_within(0, b"abcd").unwrap();
        assert!(matches!(
            buffer.read(usize::MAX, 2),
            Err(Error::OutOfBounds { offset: usize::MAX, limit: 4, .. })
        ));
        assert!(matches!(
            buffer.read(1, usize::MAX),
            Err(Error::OutOfBounds { limit: 4, .. })
        ));
        let mut out = [0u8; 2];
        assert!(buffer.read_into(usize::MAX, &mut out).is_err());
        assert!(matches!(
            buffer.write_within(usize::MAX, b"xy"),
            Err(Error::OutOfBounds { limit: 4, .. })
        ));
        assert_eq!(buffer.read_all().unwrap(), b"abcd");
    }

    #[test]
    fn test_replace_truncates() {
        let buffer = test_buffer(16);
        buffer.write_within(0, b"0123456789").unwrap();
        buffer.replace(b"xy").unwrap();
        assert_eq!(buffer.read_all().unwrap(), b"xy");
    }

    #[test]
    fn test_buffer_pin_unpin() {
        let buffer = test_buffer(8);
        assert_eq!(buffer.pin(), 1);
        assert_eq!(buffer.pin(), 2);
        assert_eq!(buffer.unpin(), 1);
        assert_eq!(buffer.unpin(), 0);
        assert!(!buffer.is_pinned());
    }

    #[test]
    #[should_panic(expected = "pin count underflow")]
    fn test_buffer_unpin_underflow() {
        let buffer = test_buffer(8);
        buffer.unpin();
    }

    #[test]
    fn test_evictable() {
        let buffer = test_buffer(8);
        assert!(buffer.is_evictable(false));

        buffer.pin();
        assert!(!buffer.is_evictable(true));
        buffer.unpin();

        buffer.mark_dirty();
        assert!(!buffer.is_evictable(false));
        assert!(buffer.is_evictable(true));
    }

    #[test]
    fn test_flush_with_clears_dirty() {
        let buffer = test_buffer(8);
        buffer.write_within(0, b"data").unwrap();

        let mut seen = Vec::new();
        let flushed = buffer
            .flush_with(|_, data, _| {
                seen.extend_from_slice(data);
                Ok(())
            })
            .unwrap();
        assert!(flushed);
        assert_eq!(seen, b"data");
        assert!(!buffer.is_dirty());
        assert!(!buffer.flush_with(|_, _, _| Ok(())).unwrap());
    }

    #[test]
    fn test_failed_flush_keeps_dirty() {
        let buffer = test_buffer(8);
        buffer.write_within(0, b"data").unwrap();
        let result = buffer.flush_with(|key, _, _| Err(Error::ChunkNotFound(*key)));
        assert!(result.is_err());
        assert!(buffer.is_dirty());
    }

    #[test]
    fn test_detached_buffer_rejects_access() {
        let buffer = test_buffer(8);
        buffer.write_within(0, b"x").unwrap();
        assert!(buffer.detach().is_some());
        assert_eq!(buffer.status(), BufferStatus::Detached);
        assert!(buffer.write_within(0, b"y").is_err());
    }

    #[test]
    fn test_concurrent_pin() {
        use std::thread;

        let buffer = Arc::new(test_buffer(8));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for _ in 0..100 {
                        buffer.pin();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buffer.pin_count(), 1000);
    }
}
