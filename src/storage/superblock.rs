//! File header of a page file.
//!
//! Two superblock slots (pages 0 and 1) alternate between checkpoints. A
//! checkpoint writes the slot not holding the current epoch, so a crash
//! mid-write leaves the previous superblock intact.

use crate::common::config::{FORMAT_VERSION, PAGE_SIZE, SUPERBLOCK_MAGIC};
use crate::common::{Error, PageId, Result};
use crate::storage::page::{Page, PageType};

/// Decoded superblock.
///
/// # Payload Layout (32 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     magic
/// 8       4     format version
/// 12      4     page size
/// 16      4     file id
/// 20      4     directory root page
/// 24      4     free-list root page
/// 28      4     page count
/// ```
/// The committed epoch lives in the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub epoch: u64,
    pub file_id: u32,
    pub page_size: u32,
    pub directory_root: PageId,
    pub free_list_root: PageId,
    pub page_count: u32,
}

impl Superblock {
    const PAYLOAD_SIZE: usize = 32;

    /// Superblock of a freshly created file.
    pub fn empty(file_id: u32) -> Self {
        Self {
            epoch: 0,
            file_id,
            page_size: PAGE_SIZE as u32,
            directory_root: PageId::INVALID,
            free_list_root: PageId::INVALID,
            page_count: PageId::FIRST_DATA.0,
        }
    }

    /// Slot that holds the superblock of `epoch`.
    #[inline]
    pub fn slot_for(epoch: u64) -> PageId {
        PageId::new((epoch % 2) as u32)
    }

    pub fn to_page(&self) -> Page {
        let mut payload = [0u8; Self::PAYLOAD_SIZE];
        payload[0..8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        payload[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        payload[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        payload[16..20].copy_from_slice(&self.file_id.to_le_bytes());
        payload[20..24].copy_from_slice(&self.directory_root.0.to_le_bytes());
        payload[24..28].copy_from_slice(&self.free_list_root.0.to_le_bytes());
        payload[28..32].copy_from_slice(&self.page_count.to_le_bytes());

        let mut page = Page::with_type(PageType::Superblock);
        page.set_payload(&payload);
        page.seal(self.epoch);
        page
    }

    /// Decode and validate a superblock slot.
    ///
    /// # Errors
    /// `Error::Corruption` on checksum, magic, version or page size mismatch.
    pub fn from_page(slot: PageId, page: &Page) -> Result<Self> {
        let corrupt = |reason: String| Error::Corruption {
            page: slot.0,
            reason,
        };

        let header = page.header();
        if header.page_type != PageType::Superblock || !page.verify_checksum() {
            return Err(corrupt("superblock checksum or type mismatch".into()));
        }
        let payload = page.payload();
        if payload.len() < Self::PAYLOAD_SIZE {
            return Err(corrupt("superblock payload truncated".into()));
        }

        let u32_at = |at: usize| u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]]);
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&payload[0..8]);

        if u64::from_le_bytes(magic) != SUPERBLOCK_MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let version = u32_at(8);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let page_size = u32_at(12);
        if page_size as usize != PAGE_SIZE {
            return Err(corrupt(format!("page size {} does not match {}", page_size, PAGE_SIZE)));
        }

        Ok(Self {
            epoch: header.epoch,
            file_id: u32_at(16),
            page_size,
            directory_root: PageId(u32_at(20)),
            free_list_root: PageId(u32_at(24)),
            page_count: u32_at(28),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock {
            epoch: 9,
            file_id: 4,
            page_size: PAGE_SIZE as u32,
            directory_root: PageId::new(12),
            free_list_root: PageId::new(13),
            page_count: 40,
        };
        let page = sb.to_page();
        assert_eq!(Superblock::from_page(PageId::new(1), &page).unwrap(), sb);
    }

    #[test]
    fn test_slots_alternate() {
        assert_eq!(Superblock::slot_for(0), PageId::new(0));
        assert_eq!(Superblock::slot_for(1), PageId::new(1));
        assert_eq!(Superblock::slot_for(2), PageId::new(0));
    }

    #[test]
    fn test_torn_superblock_rejected() {
        let mut page = Superblock::empty(0).to_page();
        page.as_mut_slice()[40] ^= 0xFF;
        assert!(Superblock::from_page(PageId::new(0), &page).is_err());
    }

    #[test]
    fn test_zero_page_rejected() {
        assert!(Superblock::from_page(PageId::new(0), &Page::new()).is_err());
    }
}
