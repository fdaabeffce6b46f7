//! Chunk header pages: size, encoding and the ordered data page chain.

use crate::common::{ChunkKey, EncodingMetadata, Error, PageId, Result};
use crate::storage::disk_manager::DiskManager;
use crate::storage::page::{Page, PageType};

/// Durable description of one chunk version.
///
/// # Header Page Payload
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       17    chunk key
/// 17      16    encoding metadata
/// 33      8     logical byte length
/// 41      4     total data pages
/// 45      4     data page ids in this header page (n)
/// 49      4*n   data page ids
/// ```
/// Chunks with more data pages than one header page can list continue in
/// further header pages linked through the page header's `next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub key: ChunkKey,
    pub size: u64,
    pub encoding: EncodingMetadata,
    /// Epoch whose checkpoint commits this version.
    pub epoch: u64,
    pub header_pages: Vec<PageId>,
    pub data_pages: Vec<PageId>,
}

const OFFSET_KEY: usize = 0;
const OFFSET_ENCODING: usize = 17;
const OFFSET_SIZE: usize = 33;
const OFFSET_TOTAL: usize = 41;
const OFFSET_COUNT: usize = 45;
const OFFSET_IDS: usize = 49;

impl ChunkHeader {
    /// Data page ids that fit in one header page.
    pub const IDS_PER_PAGE: usize = (Page::PAYLOAD_CAPACITY - OFFSET_IDS) / 4;

    /// Header pages needed to list `data_pages` ids (at least one).
    pub fn pages_needed(data_pages: usize) -> usize {
        data_pages.div_ceil(Self::IDS_PER_PAGE).max(1)
    }

    /// First header page; the chunk's entry in the directory.
    #[inline]
    pub fn root(&self) -> PageId {
        self.header_pages[0]
    }

    /// Every page owned by this version.
    pub fn owned_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.header_pages.iter().chain(self.data_pages.iter()).copied()
    }

    /// Serialize into sealed header pages, one per entry of `header_pages`.
    pub fn to_pages(&self) -> Vec<Page> {
        let chunks: Vec<&[PageId]> = if self.data_pages.is_empty() {
            vec![&[]]
        } else {
            self.data_pages.chunks(Self::IDS_PER_PAGE).collect()
        };
        debug_assert_eq!(chunks.len(), self.header_pages.len());

        chunks
            .iter()
            .enumerate()
            .map(|(i, ids)| {
                let mut page = Page::with_type(PageType::ChunkHeader);
                let area = page.payload_area_mut();
                area[OFFSET_KEY..OFFSET_KEY + ChunkKey::ENCODED_SIZE]
                    .copy_from_slice(&self.key.to_bytes());
                area[OFFSET_ENCODING..OFFSET_ENCODING + EncodingMetadata::ENCODED_SIZE]
                    .copy_from_slice(&self.encoding.to_bytes());
                area[OFFSET_SIZE..OFFSET_SIZE + 8].copy_from_slice(&self.size.to_le_bytes());
                area[OFFSET_TOTAL..OFFSET_TOTAL + 4]
                    .copy_from_slice(&(self.data_pages.len() as u32).to_le_bytes());
                area[OFFSET_COUNT..OFFSET_COUNT + 4].copy_from_slice(&(ids.len() as u32).to_le_bytes());
                for (slot, id) in ids.iter().enumerate() {
                    let at = OFFSET_IDS + slot * 4;
                    area[at..at + 4].copy_from_slice(&id.0.to_le_bytes());
                }
                page.set_payload_len(OFFSET_IDS + ids.len() * 4);
                let next = self.header_pages.get(i + 1).copied().unwrap_or(PageId::INVALID);
                page.set_next(next);
                page.seal(self.epoch);
                page
            })
            .collect()
    }

    /// Read a header chain starting at `root`, verifying every page.
    ///
    /// # Errors
    /// `Error::Corruption` if pages disagree about the key or counts, or the
    /// chain lists a different number of ids than recorded.
    pub fn load(disk: &mut DiskManager, root: PageId) -> Result<Self> {
        let mut header: Option<ChunkHeader> = None;
        let mut expected_total = 0usize;
        let mut current = root;

        while current.is_valid() {
            let page = disk.read_verified(current, PageType::ChunkHeader)?;
            let payload = page.payload();
            let corrupt = |reason: &str| Error::Corruption {
                page: current.0,
                reason: reason.to_string(),
            };
            if payload.len() < OFFSET_IDS {
                return Err(corrupt("chunk header payload truncated"));
            }

            let key = ChunkKey::from_bytes(&payload[OFFSET_KEY..])
                .ok_or_else(|| corrupt("undecodable chunk key"))?;
            let encoding = EncodingMetadata::from_bytes(&payload[OFFSET_ENCODING..])
                .ok_or_else(|| corrupt("undecodable encoding metadata"))?;
            let mut size = [0u8; 8];
            size.copy_from_slice(&payload[OFFSET_SIZE..OFFSET_SIZE + 8]);
            let size = u64::from_le_bytes(size);
            let u32_at = |at: usize| u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]]);
            let total = u32_at(OFFSET_TOTAL) as usize;
            let count = u32_at(OFFSET_COUNT) as usize;
            if payload.len() < OFFSET_IDS + count * 4 {
                return Err(corrupt("chunk header id list truncated"));
            }

            let state = header.get_or_insert_with(|| {
                expected_total = total;
                ChunkHeader {
                    key,
                    size,
                    encoding,
                    epoch: page.header().epoch,
                    header_pages: Vec::new(),
                    data_pages: Vec::with_capacity(total),
                }
            });
            if state.key != key || state.size != size || expected_total != total {
                return Err(corrupt("header continuation disagrees with root"));
            }
            state.header_pages.push(current);
            state
                .data_pages
                .extend((0..count).map(|slot| PageId(u32_at(OFFSET_IDS + slot * 4))));

            if state.header_pages.len() > expected_total.div_ceil(Self::IDS_PER_PAGE).max(1) {
                return Err(corrupt("chunk header chain is longer than its id count"));
            }
            current = page.header().next;
        }

        let header = header.ok_or_else(|| Error::Corruption {
            page: root.0,
            reason: "empty chunk header chain".into(),
        })?;
        if header.data_pages.len() != expected_total {
            return Err(Error::Corruption {
                page: root.0,
                reason: format!(
                    "chunk header lists {} data pages, expected {}",
                    header.data_pages.len(),
                    expected_total
                ),
            });
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Compression;
    use tempfile::tempdir;

    fn header_with(data_pages: usize, disk: &mut DiskManager) -> ChunkHeader {
        let header_pages = (0..ChunkHeader::pages_needed(data_pages))
            .map(|_| disk.allocate_page().unwrap())
            .collect();
        ChunkHeader {
            key: ChunkKey::new(1, 2, 3, 4),
            size: 12345,
            encoding: EncodingMetadata::new(4, Compression::Fixed),
            epoch: 5,
            header_pages,
            data_pages: (100..100 + data_pages as u32).map(PageId).collect(),
        }
    }

    #[test]
    fn test_pages_needed() {
        assert_eq!(ChunkHeader::pages_needed(0), 1);
        assert_eq!(ChunkHeader::pages_needed(ChunkHeader::IDS_PER_PAGE), 1);
        assert_eq!(ChunkHeader::pages_needed(ChunkHeader::IDS_PER_PAGE + 1), 2);
    }

    #[test]
    fn test_multi_page_header_chain() {
        let dir = tempdir().unwrap();
        let mut disk = DiskManager::create(dir.path().join("h.db")).unwrap();
        let header = header_with(ChunkHeader::IDS_PER_PAGE * 2 + 3, &mut disk);
        assert_eq!(header.header_pages.len(), 3);

        for (id, page) in header.header_pages.iter().zip(header.to_pages()) {
            disk.write_page(*id, &page).unwrap();
        }

        let loaded = ChunkHeader::load(&mut disk, header.root()).unwrap();
        assert_eq!(loaded, header);
    }

    #[test]
    fn test_empty_chunk_header() {
        let dir = tempdir().unwrap();
        let mut disk = DiskManager::create(dir.path().join("h.db")).unwrap();
        let header = header_with(0, &mut disk);
        let pages = header.to_pages();
        assert_eq!(pages.len(), 1);
        disk.write_page(header.root(), &pages[0]).unwrap();

        let loaded = ChunkHeader::load(&mut disk, header.root()).unwrap();
        assert!(loaded.data_pages.is_empty());
        assert_eq!(loaded.size, 12345);
    }
}
