//! Disk Manager - low-level file I/O for the page file.
//!
//! The [`DiskManager`] handles all direct file operations:
//! - Reading and writing pages
//! - Growing the file when pages are allocated
//! - Checksum and page-type verification on read
//! - Syncing at checkpoint boundaries

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::config::PAGE_SIZE;
use crate::common::{Error, PageId, Result};
use crate::storage::page::{Page, PageType};

/// Manages disk I/O for a single page file.
///
/// # File Layout
/// ```text
/// ┌──────────┬──────────┬─────────┬─────────┬─────────┐
/// │ Super 0  │ Super 1  │ Page 2  │  ...    │ Page N  │
/// │ (4KB)    │ (4KB)    │ (4KB)   │         │ (4KB)   │
/// └──────────┴──────────┴─────────┴─────────┴─────────┘
/// Offset:  0      4096      8192     ...    N×4096
/// ```
///
/// # Thread Safety
/// `DiskManager` is single-threaded. The [`PageStore`](super::PageStore)
/// serializes access behind its mutex.
///
/// # Durability
/// Writes are not synced individually. The page store calls [`sync`](Self::sync)
/// before and after publishing a superblock, which is the durability boundary.
pub struct DiskManager {
    file: File,
    /// Number of pages in the file, including not-yet-written allocations.
    page_count: u32,
    /// Syncs to let through before one fails.
    #[cfg(test)]
    sync_failure: Option<usize>,
}

impl DiskManager {
    /// Create a new page file with the two superblock slots reserved.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            file,
            page_count: PageId::FIRST_DATA.0,
            #[cfg(test)]
            sync_failure: None,
        })
    }

    /// Open an existing page file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let file_size = file.metadata()?.len();
        let page_count = ((file_size / PAGE_SIZE as u64) as u32).max(PageId::FIRST_DATA.0);

        Ok(Self {
            file,
            page_count,
            #[cfg(test)]
            sync_failure: None,
        })
    }

    /// Read a page from disk without verification.
    ///
    /// # Errors
    /// Returns `Error::PageNotFound` if the page is beyond the file.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        if page_id.0 >= self.page_count {
            return Err(Error::PageNotFound(page_id.0));
        }

        self.file.seek(SeekFrom::Start(page_id.file_offset()))?;

        let mut page = Page::new();
        match self.file.read_exact(page.as_mut_slice()) {
            Ok(()) => Ok(page),
            // Allocated but never written past EOF reads as zeroes.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(Page::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a page and verify its checksum and type.
    ///
    /// # Errors
    /// `Error::Corruption` on checksum or page type mismatch.
    pub fn read_verified(&mut self, page_id: PageId, expected: PageType) -> Result<Page> {
        let page = self.read_page(page_id)?;
        if !page.verify_checksum() {
            return Err(Error::Corruption {
                page: page_id.0,
                reason: "checksum mismatch".into(),
            });
        }
        let found = page.header().page_type;
        if found != expected {
            return Err(Error::Corruption {
                page: page_id.0,
                reason: format!("expected {:?} page, found {:?}", expected, found),
            });
        }
        Ok(page)
    }

    /// Write a page to disk. The page must be sealed by the caller.
    ///
    /// # Errors
    /// Returns `Error::PageNotFound` if the page hasn't been allocated.
    pub fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        if page_id.0 >= self.page_count {
            return Err(Error::PageNotFound(page_id.0));
        }

        self.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        self.file.write_all(page.as_slice())?;

        Ok(())
    }

    /// Allocate a new page at the end of the file.
    ///
    /// The file grows when the page is first written.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        if self.page_count == u32::MAX {
            return Err(Error::Allocation {
                tier: crate::common::TierId::Cpu,
                requested: PAGE_SIZE,
                reason: "page file is at its maximum page count".into(),
            });
        }
        let page_id = PageId::new(self.page_count);
        self.page_count += 1;
        Ok(page_id)
    }

    /// Flush file contents and metadata to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        #[cfg(test)]
        if let Some(remaining) = self.sync_failure {
            if remaining == 0 {
                self.sync_failure = None;
                return Err(std::io::Error::other("sync failed").into());
            }
            self.sync_failure = Some(remaining - 1);
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Fail the sync that follows the next `skip` successful ones.
    #[cfg(test)]
    pub(crate) fn fail_sync_after(&mut self, skip: usize) {
        self.sync_failure = Some(skip);
    }

    /// Get the number of pages in the file.
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Get the total size of the page file in bytes.
    #[inline]
    pub fn file_size(&self) -> u64 {
        (self.page_count as u64) * (PAGE_SIZE as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sealed(page_type: PageType, byte: u8) -> Page {
        let mut page = Page::with_type(page_type);
        page.set_payload(&[byte; 16]);
        page.seal(1);
        page
    }

    #[test]
    fn test_create_reserves_superblocks() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        assert_eq!(dm.page_count(), 2);
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        DiskManager::create(&path).unwrap();
        assert!(DiskManager::create(&path).is_err());
    }

    #[test]
    fn test_write_and_read_verified() {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(dir.path().join("test.db")).unwrap();

        let page_id = dm.allocate_page().unwrap();
        assert_eq!(page_id, PageId::new(2));
        dm.write_page(page_id, &sealed(PageType::ChunkData, 0xAB)).unwrap();

        let page = dm.read_verified(page_id, PageType::ChunkData).unwrap();
        assert_eq!(page.payload(), &[0xAB; 16][..]);
    }

    #[test]
    fn test_read_verified_wrong_type() {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(dir.path().join("test.db")).unwrap();

        let page_id = dm.allocate_page().unwrap();
        dm.write_page(page_id, &sealed(PageType::Directory, 1)).unwrap();

        let result = dm.read_verified(page_id, PageType::ChunkData);
        assert!(matches!(result, Err(Error::Corruption { page: 2, .. })));
    }

    #[test]
    fn test_unwritten_page_fails_verification() {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        let page_id = dm.allocate_page().unwrap();

        let page = dm.read_page(page_id).unwrap();
        assert_eq!(page.as_slice()[0], 0);
        assert!(dm.read_verified(page_id, PageType::ChunkData).is_err());
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut dm = DiskManager::create(&path).unwrap();
            let page_id = dm.allocate_page().unwrap();
            dm.write_page(page_id, &sealed(PageType::ChunkData, 0x42)).unwrap();
            dm.sync().unwrap();
        }

        {
            let mut dm = DiskManager::open(&path).unwrap();
            assert_eq!(dm.page_count(), 3);
            let page = dm.read_verified(PageId::new(2), PageType::ChunkData).unwrap();
            assert_eq!(page.payload()[0], 0x42);
        }
    }

    #[test]
    fn test_read_invalid_page() {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(dir.path().join("test.db")).unwrap();

        let result = dm.read_page(PageId::new(10));
        assert!(matches!(result, Err(Error::PageNotFound(10))));
    }

    #[test]
    fn test_write_unallocated_page() {
        let dir = tempdir().unwrap();
        let mut dm = DiskManager::create(dir.path().join("test.db")).unwrap();

        let page = Page::new();
        assert!(dm.write_page(PageId::new(5), &page).is_err());
    }
}
