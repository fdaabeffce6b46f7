//! Page - the fundamental 4KB unit of durable storage.
//!
//! A [`Page`] is a raw 4KB byte array that serves as the unit of I/O
//! between the page store and its backing file.

use crate::common::config::PAGE_SIZE;

use super::page_header::{PageHeader, PageType};

/// A page of data (4KB, 4KB-aligned).
///
/// The first [`PageHeader::PAYLOAD_OFFSET`] bytes hold the header; the rest
/// is payload whose meaning depends on the [`PageType`].
///
/// `Page` does NOT implement `Clone` outside tests; copying 4KB should be
/// explicit.
///
/// # Example
/// ```
/// use tiercache::storage::page::{Page, PageType};
///
/// let mut page = Page::with_type(PageType::ChunkData);
/// page.set_payload(b"hello");
/// page.seal(1);
/// assert!(page.verify_checksum());
/// assert_eq!(page.payload(), b"hello");
/// ```
#[repr(align(4096))]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    /// Bytes available for payload in every page.
    pub const PAYLOAD_CAPACITY: usize = PAGE_SIZE - PageHeader::PAYLOAD_OFFSET;

    /// Create a new zeroed page.
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Create a zeroed page whose header carries `page_type`.
    pub fn with_type(page_type: PageType) -> Self {
        let mut page = Self::new();
        page.set_header(&PageHeader::new(page_type));
        page
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero out the entire page.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    /// Read the page header.
    pub fn header(&self) -> PageHeader {
        PageHeader::from_bytes(&self.data)
    }

    /// Write a page header.
    pub fn set_header(&mut self, header: &PageHeader) {
        header.write_to(&mut self.data);
    }

    /// The payload bytes in use (`payload_len` of the header, clamped).
    pub fn payload(&self) -> &[u8] {
        let len = (self.header().payload_len as usize).min(Self::PAYLOAD_CAPACITY);
        &self.data[PageHeader::PAYLOAD_OFFSET..PageHeader::PAYLOAD_OFFSET + len]
    }

    /// The whole payload area regardless of `payload_len`.
    pub fn payload_area_mut(&mut self) -> &mut [u8] {
        &mut self.data[PageHeader::PAYLOAD_OFFSET..]
    }

    /// Copy `bytes` into the payload area and record its length.
    ///
    /// # Panics
    /// Panics if `bytes` exceeds [`Page::PAYLOAD_CAPACITY`].
    pub fn set_payload(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= Self::PAYLOAD_CAPACITY, "payload exceeds page");
        self.payload_area_mut()[..bytes.len()].copy_from_slice(bytes);
        self.set_payload_len(bytes.len());
    }

    pub fn set_payload_len(&mut self, len: usize) {
        let mut header = self.header();
        header.payload_len = len as u32;
        self.set_header(&header);
    }

    pub fn set_next(&mut self, next: crate::common::PageId) {
        let mut header = self.header();
        header.next = next;
        self.set_header(&header);
    }

    /// Stamp the epoch and store the checksum.
    ///
    /// Call this after all modifications to the page are complete.
    pub fn seal(&mut self, epoch: u64) {
        let mut header = self.header();
        header.epoch = epoch;
        self.set_header(&header);
        self.update_checksum();
    }

    /// Compute and store checksum in the header.
    pub fn update_checksum(&mut self) {
        let checksum = PageHeader::compute_checksum(&self.data);
        self.data[PageHeader::OFFSET_CHECKSUM..PageHeader::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&checksum.to_le_bytes());
    }

    /// Verify the page checksum is valid.
    pub fn verify_checksum(&self) -> bool {
        self.header().verify_checksum(&self.data)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

// Clone only available in tests - forces explicit copying in production
#[cfg(test)]
impl Clone for Page {
    fn clone(&self) -> Self {
        let mut new_page = Page::new();
        new_page.data.copy_from_slice(&self.data);
        new_page
    }
}
