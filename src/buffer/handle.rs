//! RAII pin handle for buffer access.
//!
//! A [`BufferHandle`] holds one pin on a buffer. Cloning takes another pin;
//! dropping releases it. Drop is the only place a consumer's pin is released.

use std::ops::Deref;
use std::sync::Arc;

use crate::common::{Error, Result};

use super::buffer::Buffer;
use super::tier_manager::TierManager;

/// Pinned access to a buffer in one tier.
///
/// Derefs to [`Buffer`] for reads and metadata. Writes that may need more
/// tier memory go through the handle, which can reach the tier manager.
///
/// # Example
/// ```ignore
/// let handle = tier.get_or_create(key, 4096)?;
/// handle.append(b"column bytes")?;
/// // handle drops here, buffer unpinned
/// ```
pub struct BufferHandle<'a> {
    /// Reference back to the tier for unpin on drop.
    tier: &'a TierManager,
    buffer: Arc<Buffer>,
}

impl<'a> BufferHandle<'a> {
    /// Wrap a buffer the tier has already pinned on our behalf.
    pub(crate) fn new(tier: &'a TierManager, buffer: Arc<Buffer>) -> Self {
        Self { tier, buffer }
    }

    /// Tier manager that owns the buffer.
    #[inline]
    pub fn tier_manager(&self) -> &'a TierManager {
        self.tier
    }

    pub(crate) fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Grow the reserved size to at least `n` bytes.
    ///
    /// May relocate the buffer inside the tier, evicting other buffers.
    pub fn reserve(&self, n: usize) -> Result<()> {
        self.tier.reserve(&self.buffer, n)
    }

    /// Write `data` at `offset` and mark the buffer dirty.
    ///
    /// # Errors
    /// `Error::OutOfBounds` if `offset` is past `size`, or the write exceeds
    /// the reserved size of a buffer that is not appendable.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let size = self.buffer.size();
        let reserved = self.buffer.reserved_size();
        if offset > size {
            return Err(Error::OutOfBounds {
                offset,
                len: data.len(),
                limit: size,
            });
        }
        let end = offset.checked_add(data.len()).ok_or(Error::OutOfBounds {
            offset,
            len: data.len(),
            limit: reserved,
        })?;
        if end > reserved {
            if !self.buffer.is_appendable() {
                return Err(Error::OutOfBounds {
                    offset,
                    len: data.len(),
                    limit: reserved,
                });
            }
            self.reserve(end)?;
        }
        self.buffer.write_within(offset, data)
    }

    /// Append `data` after the populated bytes.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.write(self.buffer.size(), data)
    }

    /// Replace the whole contents, reserving more memory if needed.
    pub fn overwrite(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.buffer.reserved_size() {
            self.reserve(data.len())?;
        }
        self.buffer.replace(data)
    }
}

impl Clone for BufferHandle<'_> {
    fn clone(&self) -> Self {
        self.buffer.pin();
        Self {
            tier: self.tier,
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl Deref for BufferHandle<'_> {
    type Target = Buffer;

    #[inline]
    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for BufferHandle<'_> {
    fn drop(&mut self) {
        self.tier.unpin(&self.buffer);
    }
}

impl std::fmt::Debug for BufferHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BufferHandle").field(&*self.buffer).finish()
    }
}
