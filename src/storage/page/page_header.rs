//! Page header and type definitions.
//!
//! Every page starts with a [`PageHeader`] containing metadata:
//! - [`PageType`] discriminator
//! - CRC32 checksum for integrity
//! - Epoch in which the page was written
//! - Link to the next page of its chain
//! - Number of payload bytes in use

use crate::common::PageId;

/// Type of page stored on disk.
///
/// Uses `#[repr(u8)]` to guarantee a 1-byte representation for serialization.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Uninitialized, free, or corrupted page.
    #[default]
    Invalid = 0,
    /// One of the two file header slots.
    Superblock = 1,
    /// Chunk size, encoding and page chain.
    ChunkHeader = 2,
    /// Chunk payload bytes.
    ChunkData = 3,
    /// Key to chunk-header mapping of a committed epoch.
    Directory = 4,
    /// Free page ids of a committed epoch.
    FreeList = 5,
}

impl PageType {
    /// Convert from u8, returning Invalid for unknown values.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Superblock,
            2 => PageType::ChunkHeader,
            3 => PageType::ChunkData,
            4 => PageType::Directory,
            5 => PageType::FreeList,
            _ => PageType::Invalid,
        }
    }
}

/// Metadata stored at the beginning of every page.
///
/// # Layout (21 bytes, payload starts at 24)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       1     page_type (PageType as u8)
/// 1       4     checksum (CRC32, little-endian)
/// 5       8     epoch (little-endian)
/// 13      4     next page id (u32::MAX terminates the chain)
/// 17      4     payload_len
/// ```
///
/// # Checksum
/// The checksum is computed over the entire page with the checksum field
/// itself set to zero. This allows verification without special handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub checksum: u32,
    /// Epoch that commits this page.
    pub epoch: u64,
    pub next: PageId,
    pub payload_len: u32,
}

impl Default for PageHeader {
    fn default() -> Self {
        Self::new(PageType::Invalid)
    }
}

impl PageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 21;

    /// Offset of each field within the header.
    pub const OFFSET_PAGE_TYPE: usize = 0;
    pub const OFFSET_CHECKSUM: usize = 1;
    pub const OFFSET_EPOCH: usize = 5;
    pub const OFFSET_NEXT: usize = 13;
    pub const OFFSET_PAYLOAD_LEN: usize = 17;

    /// Payload is 8-byte aligned after the header.
    pub const PAYLOAD_OFFSET: usize = 24;

    /// Create a new header with the given page type and no successor.
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            checksum: 0,
            epoch: 0,
            next: PageId::INVALID,
            payload_len: 0,
        }
    }

    /// Read a header from the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let mut epoch = [0u8; 8];
        epoch.copy_from_slice(&data[Self::OFFSET_EPOCH..Self::OFFSET_EPOCH + 8]);

        Self {
            page_type: PageType::from_u8(data[Self::OFFSET_PAGE_TYPE]),
            checksum: u32_at(Self::OFFSET_CHECKSUM),
            epoch: u64::from_le_bytes(epoch),
            next: PageId(u32_at(Self::OFFSET_NEXT)),
            payload_len: u32_at(Self::OFFSET_PAYLOAD_LEN),
        }
    }

    /// Write this header to the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        data[Self::OFFSET_PAGE_TYPE] = self.page_type as u8;
        data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&self.checksum.to_le_bytes());
        data[Self::OFFSET_EPOCH..Self::OFFSET_EPOCH + 8].copy_from_slice(&self.epoch.to_le_bytes());
        data[Self::OFFSET_NEXT..Self::OFFSET_NEXT + 4].copy_from_slice(&self.next.0.to_le_bytes());
        data[Self::OFFSET_PAYLOAD_LEN..Self::OFFSET_PAYLOAD_LEN + 4]
            .copy_from_slice(&self.payload_len.to_le_bytes());
    }

    /// Compute CRC32 checksum of a page.
    ///
    /// The checksum is computed with the checksum field (bytes 1-4) zeroed out,
    /// so the checksum doesn't include itself.
    pub fn compute_checksum(page_data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page_data[..Self::OFFSET_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page_data[Self::OFFSET_CHECKSUM + 4..]);
        hasher.finalize()
    }

    /// Verify that the stored checksum matches the computed checksum.
    pub fn verify_checksum(&self, page_data: &[u8]) -> bool {
        self.checksum == Self::compute_checksum(page_data)
    }
}
