//! Page Store - durable, epoch-versioned chunk storage.
//!
//! The [`PageStore`] provides:
//! - Chunk writes into pages the committed epoch does not reference
//! - Atomic checkpoints through alternating superblocks
//! - Recovery to the last checkpoint on open
//! - Free page reclamation once no live version references a page

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::FlushTarget;
use crate::common::config::PageStoreConfig;
use crate::common::{ChunkKey, EncodingMetadata, Error, PageId, Result};
use crate::storage::chunk_header::ChunkHeader;
use crate::storage::disk_manager::DiskManager;
use crate::storage::page::{Page, PageType};
use crate::storage::stats::PageStoreStats;
use crate::storage::superblock::Superblock;

/// Lifecycle state of one chunk in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Never written, or deleted and checkpointed before this session.
    Absent,
    /// Has a version written since the last checkpoint.
    Writing,
    /// Latest version was committed by the given epoch.
    Committed(u64),
    /// Deleted; the key may only come back as a fresh write.
    Deleted,
}

/// A chunk read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub data: Vec<u8>,
    pub encoding: EncodingMetadata,
}

/// Uncommitted change to one key.
#[derive(Debug, Clone)]
enum Pending {
    Written(ChunkHeader),
    Deleted,
}

/// Durable chunk storage on a single page file.
///
/// # Versioning
/// ```text
///   committed (epoch N)         pending (epoch N+1)
///   key → header chain    +     key → Written(header) | Deleted
///            │                             │
///            └──────── checkpoint() ───────┘
///                            ↓
///              directory + free list pages, fsync,
///              superblock slot (N+1) % 2, fsync
/// ```
/// Pages referenced by epoch N are never overwritten before epoch N+1 is
/// published. Pages it stops referencing join the free list afterwards.
///
/// # Thread Safety
/// All state sits behind one `Mutex`; page I/O for a call happens under it,
/// so readers never observe a half-written version of a chunk.
pub struct PageStore {
    inner: Mutex<StoreInner>,
    stats: PageStoreStats,
    sync_on_checkpoint: bool,
}

struct StoreInner {
    disk: DiskManager,
    superblock: Superblock,
    committed: BTreeMap<ChunkKey, ChunkHeader>,
    pending: BTreeMap<ChunkKey, Pending>,
    /// Keys deleted during this session and already checkpointed.
    tombstones: HashSet<ChunkKey>,
    /// Committed directory entries whose header chain failed to load.
    corrupt: BTreeMap<ChunkKey, Error>,
    /// Pages no version references; safe to reuse now.
    free: BTreeSet<u32>,
    /// Directory and free-list pages of the committed epoch.
    meta_pages: Vec<PageId>,
}

impl PageStore {
    /// Create a new page file.
    ///
    /// # Errors
    /// Returns an error if the file already exists.
    pub fn create(config: &PageStoreConfig) -> Result<Self> {
        let mut disk = DiskManager::create(&config.path)?;
        let superblock = Superblock::empty(config.file_id);
        disk.write_page(Superblock::slot_for(0), &superblock.to_page())?;
        disk.sync()?;

        info!(path = %config.path.display(), file_id = config.file_id, "created page file");

        Ok(Self::from_parts(
            StoreInner {
                disk,
                superblock,
                committed: BTreeMap::new(),
                pending: BTreeMap::new(),
                tombstones: HashSet::new(),
                corrupt: BTreeMap::new(),
                free: BTreeSet::new(),
                meta_pages: Vec::new(),
            },
            config,
        ))
    }

    /// Open an existing page file and recover the last committed epoch.
    ///
    /// Pages written after that checkpoint are unreachable and return to
    /// the free list.
    pub fn open(config: &PageStoreConfig) -> Result<Self> {
        let mut disk = DiskManager::open(&config.path)?;

        // Newest superblock whose catalog chains verify.
        let mut loaded = None;
        let mut last_error = None;
        for superblock in Self::superblocks_newest_first(&mut disk)? {
            if superblock.file_id != config.file_id {
                return Err(Error::InvalidConfig(format!(
                    "page file has id {}, expected {}",
                    superblock.file_id, config.file_id
                )));
            }
            let mut meta_pages = Vec::new();
            let catalog = read_directory(&mut disk, superblock.directory_root, &mut meta_pages)
                .and_then(|directory| {
                    let free = read_free_list(&mut disk, superblock.free_list_root, &mut meta_pages)?;
                    Ok((directory, free))
                });
            match catalog {
                Ok((directory, free)) => {
                    loaded = Some((superblock, directory, free, meta_pages));
                    break;
                }
                Err(e) => {
                    warn!(epoch = superblock.epoch, error = %e, "catalog failed verification, trying previous superblock");
                    last_error = Some(e);
                }
            }
        }
        let Some((superblock, directory, persisted_free, meta_pages)) = loaded else {
            return Err(last_error.unwrap_or(Error::Corruption {
                page: 0,
                reason: "no valid superblock".into(),
            }));
        };

        let mut committed = BTreeMap::new();
        let mut corrupt = BTreeMap::new();
        for (key, root) in directory {
            match ChunkHeader::load(&mut disk, root) {
                Ok(header) if header.key == key => {
                    committed.insert(key, header);
                }
                Ok(header) => {
                    corrupt.insert(
                        key,
                        Error::Corruption {
                            page: root.0,
                            reason: format!("directory entry points at header of {}", header.key),
                        },
                    );
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "chunk header failed verification");
                    corrupt.insert(key, e);
                }
            }
        }

        let free = if corrupt.is_empty() {
            // Reachability: everything the committed epoch does not use is free.
            let mut reachable: HashSet<u32> = meta_pages.iter().map(|p| p.0).collect();
            for header in committed.values() {
                reachable.extend(header.owned_pages().map(|p| p.0));
            }
            if let Some(page) = persisted_free.iter().find(|p| reachable.contains(p)) {
                return Err(Error::Corruption {
                    page: *page,
                    reason: "page is both free and referenced".into(),
                });
            }
            let free: BTreeSet<u32> = (PageId::FIRST_DATA.0..disk.page_count())
                .filter(|p| !reachable.contains(p))
                .collect();
            let orphans = free.len().saturating_sub(persisted_free.len());
            if orphans > 0 {
                debug!(orphans, "reclaimed pages written after the last checkpoint");
            }
            free
        } else {
            // Unknown page chains may still be referenced; trust only the free list.
            persisted_free.into_iter().collect()
        };

        info!(
            path = %config.path.display(),
            epoch = superblock.epoch,
            chunks = committed.len(),
            corrupt = corrupt.len(),
            free_pages = free.len(),
            "opened page file"
        );

        Ok(Self::from_parts(
            StoreInner {
                disk,
                superblock,
                committed,
                pending: BTreeMap::new(),
                tombstones: HashSet::new(),
                corrupt,
                free,
                meta_pages,
            },
            config,
        ))
    }

    /// Open the page file if it exists, otherwise create it.
    pub fn open_or_create(config: &PageStoreConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else {
            Self::create(config)
        }
    }

    fn from_parts(inner: StoreInner, config: &PageStoreConfig) -> Self {
        Self {
            inner: Mutex::new(inner),
            stats: PageStoreStats::new(),
            sync_on_checkpoint: config.sync_on_checkpoint,
        }
    }

    /// Valid superblocks, highest epoch first.
    fn superblocks_newest_first(disk: &mut DiskManager) -> Result<Vec<Superblock>> {
        let mut valid = Vec::with_capacity(2);
        let mut last_error = None;
        for slot in [PageId::new(0), PageId::new(1)] {
            let decoded = disk
                .read_page(slot)
                .and_then(|page| Superblock::from_page(slot, &page));
            match decoded {
                Ok(sb) => valid.push(sb),
                Err(e) => {
                    debug!(slot = slot.0, error = %e, "superblock slot rejected");
                    last_error = Some(e);
                }
            }
        }
        if valid.is_empty() {
            return Err(last_error.unwrap_or(Error::Corruption {
                page: 0,
                reason: "no valid superblock".into(),
            }));
        }
        valid.sort_by(|a, b| b.epoch.cmp(&a.epoch));
        Ok(valid)
    }

    // ========================================================================
    // Public API: chunks
    // ========================================================================

    /// Write a new version of `key` and return its header.
    ///
    /// The version becomes durable at the next [`checkpoint`](Self::checkpoint).
    /// An earlier uncommitted version of the same key is released at once.
    pub fn write_chunk(
        &self,
        key: ChunkKey,
        data: &[u8],
        encoding: EncodingMetadata,
    ) -> Result<ChunkHeader> {
        let mut inner = self.inner.lock();
        let epoch = inner.superblock.epoch + 1;

        let data_count = data.len().div_ceil(Page::PAYLOAD_CAPACITY);
        let header_count = ChunkHeader::pages_needed(data_count);
        let mut allocated = Vec::with_capacity(data_count + header_count);
        for _ in 0..data_count + header_count {
            match inner.allocate_page() {
                Ok(page) => allocated.push(page),
                Err(e) => {
                    inner.release(allocated);
                    return Err(e);
                }
            }
        }

        let header = ChunkHeader {
            key,
            size: data.len() as u64,
            encoding,
            epoch,
            header_pages: allocated[..header_count].to_vec(),
            data_pages: allocated[header_count..].to_vec(),
        };

        if let Err(e) = inner.write_version(&header, data) {
            inner.release(allocated);
            return Err(e);
        }
        self.stats
            .pages_written
            .fetch_add(allocated.len() as u64, Ordering::Relaxed);
        self.stats.chunks_written.fetch_add(1, Ordering::Relaxed);

        inner.tombstones.remove(&key);
        inner.corrupt.remove(&key);
        let replaced = inner.pending.insert(key, Pending::Written(header.clone()));
        if let Some(Pending::Written(previous)) = replaced {
            let pages: Vec<PageId> = previous.owned_pages().collect();
            inner.release(pages);
        }

        debug!(key = %key, bytes = data.len(), pages = data_count, epoch, "wrote chunk");
        Ok(header)
    }

    /// Read the latest version of `key` visible to this process: an
    /// uncommitted write if there is one, else the committed version.
    ///
    /// # Errors
    /// - `Error::ChunkNotFound` if the chunk is absent or deleted
    /// - `Error::Corruption` if any page fails verification
    pub fn read_chunk(&self, key: &ChunkKey) -> Result<StoredChunk> {
        let mut inner = self.inner.lock();
        let header = match inner.pending.get(key) {
            Some(Pending::Written(header)) => header.clone(),
            Some(Pending::Deleted) => return Err(Error::ChunkNotFound(*key)),
            None => inner.committed_header(key)?,
        };
        self.read_version(&mut inner, &header)
    }

    /// Read strictly the version committed by the last checkpoint.
    pub fn read_committed_chunk(&self, key: &ChunkKey) -> Result<StoredChunk> {
        let mut inner = self.inner.lock();
        let header = inner.committed_header(key)?;
        self.read_version(&mut inner, &header)
    }

    /// Delete `key`. Its committed pages are reclaimed after the next checkpoint.
    ///
    /// # Errors
    /// `Error::ChunkNotFound` if there is nothing to delete.
    pub fn delete_chunk(&self, key: &ChunkKey) -> Result<()> {
        let mut inner = self.inner.lock();
        let in_committed = inner.committed.contains_key(key) || inner.corrupt.contains_key(key);
        let previous = inner.pending.remove(key);
        match previous {
            Some(Pending::Written(header)) => {
                let pages: Vec<PageId> = header.owned_pages().collect();
                inner.release(pages);
            }
            Some(Pending::Deleted) => {
                inner.pending.insert(*key, Pending::Deleted);
                return Err(Error::ChunkNotFound(*key));
            }
            None if !in_committed => return Err(Error::ChunkNotFound(*key)),
            None => {}
        }
        if in_committed {
            inner.pending.insert(*key, Pending::Deleted);
        } else {
            inner.tombstones.insert(*key);
        }
        debug!(key = %key, "deleted chunk");
        Ok(())
    }

    /// Publish all writes and deletes since the last checkpoint.
    ///
    /// Returns the committed epoch. With nothing pending this is a no-op
    /// returning the current epoch.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            return Ok(inner.superblock.epoch);
        }
        let epoch = inner.superblock.epoch + 1;

        let mut next_committed = inner.committed.clone();
        let mut released: Vec<u32> = inner.meta_pages.iter().map(|p| p.0).collect();
        let mut deleted = Vec::new();
        for (key, change) in &inner.pending {
            let superseded = match change {
                Pending::Written(header) => next_committed.insert(*key, header.clone()),
                Pending::Deleted => {
                    deleted.push(*key);
                    next_committed.remove(key)
                }
            };
            if let Some(old) = superseded {
                released.extend(old.owned_pages().map(|p| p.0));
            }
        }

        let (meta_pages, written) =
            match inner.write_catalog(&next_committed, &released, epoch, self.sync_on_checkpoint) {
                Ok(result) => result,
                Err(e) => {
                    warn!(epoch, error = %e, "checkpoint failed, previous epoch stays current");
                    return Err(e);
                }
            };

        inner.free.extend(released.iter().copied());
        inner.committed = next_committed;
        inner.pending.clear();
        for key in &deleted {
            inner.corrupt.remove(key);
        }
        inner.tombstones.extend(deleted);
        inner.meta_pages = meta_pages;

        self.stats.pages_written.fetch_add(written, Ordering::Relaxed);
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(
            epoch,
            chunks = inner.committed.len(),
            free_pages = inner.free.len(),
            "checkpoint committed"
        );
        Ok(epoch)
    }

    // ========================================================================
    // Public API: introspection
    // ========================================================================

    pub fn chunk_state(&self, key: &ChunkKey) -> ChunkState {
        let inner = self.inner.lock();
        match inner.pending.get(key) {
            Some(Pending::Written(_)) => ChunkState::Writing,
            Some(Pending::Deleted) => ChunkState::Deleted,
            None => match inner.committed.get(key) {
                Some(header) => ChunkState::Committed(header.epoch),
                None if inner.tombstones.contains(key) => ChunkState::Deleted,
                None => ChunkState::Absent,
            },
        }
    }

    /// Logical size of the latest visible version.
    pub fn chunk_size(&self, key: &ChunkKey) -> Option<u64> {
        let inner = self.inner.lock();
        match inner.pending.get(key) {
            Some(Pending::Written(header)) => Some(header.size),
            Some(Pending::Deleted) => None,
            None => inner.committed.get(key).map(|h| h.size),
        }
    }

    /// Keys with a visible version, in key order.
    pub fn chunk_keys(&self) -> Vec<ChunkKey> {
        let inner = self.inner.lock();
        let mut keys: BTreeSet<ChunkKey> = inner.committed.keys().copied().collect();
        for (key, change) in &inner.pending {
            match change {
                Pending::Written(_) => keys.insert(*key),
                Pending::Deleted => keys.remove(key),
            };
        }
        keys.into_iter().collect()
    }

    /// Last committed epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().superblock.epoch
    }

    pub fn page_count(&self) -> u32 {
        self.inner.lock().disk.page_count()
    }

    pub fn free_page_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    pub fn stats(&self) -> &PageStoreStats {
        &self.stats
    }

    fn read_version(&self, inner: &mut StoreInner, header: &ChunkHeader) -> Result<StoredChunk> {
        let mut data = Vec::with_capacity(header.size as usize);
        for (i, page_id) in header.data_pages.iter().enumerate() {
            let page = inner.disk.read_verified(*page_id, PageType::ChunkData)?;
            let expected_next = header
                .data_pages
                .get(i + 1)
                .copied()
                .unwrap_or(PageId::INVALID);
            if page.header().next != expected_next {
                return Err(Error::Corruption {
                    page: page_id.0,
                    reason: format!("chain link {} should be {}", page.header().next, expected_next),
                });
            }
            data.extend_from_slice(page.payload());
        }
        self.stats
            .pages_read
            .fetch_add(header.data_pages.len() as u64, Ordering::Relaxed);

        if data.len() as u64 != header.size {
            return Err(Error::Corruption {
                page: header.root().0,
                reason: format!("chain holds {} bytes, header says {}", data.len(), header.size),
            });
        }
        Ok(StoredChunk {
            data,
            encoding: header.encoding,
        })
    }
}

impl StoreInner {
    fn committed_header(&self, key: &ChunkKey) -> Result<ChunkHeader> {
        if let Some(e) = self.corrupt.get(key) {
            return Err(match e {
                Error::Corruption { page, reason } => Error::Corruption {
                    page: *page,
                    reason: reason.clone(),
                },
                other => Error::Corruption {
                    page: 0,
                    reason: other.to_string(),
                },
            });
        }
        self.committed
            .get(key)
            .cloned()
            .ok_or(Error::ChunkNotFound(*key))
    }

    fn allocate_page(&mut self) -> Result<PageId> {
        match self.free.pop_first() {
            Some(page) => Ok(PageId(page)),
            None => self.disk.allocate_page(),
        }
    }

    /// Return pages that no version references.
    fn release(&mut self, pages: impl IntoIterator<Item = PageId>) {
        self.free.extend(pages.into_iter().map(|p| p.0));
    }

    fn write_version(&mut self, header: &ChunkHeader, data: &[u8]) -> Result<()> {
        let chunks = data.chunks(Page::PAYLOAD_CAPACITY);
        for (i, (page_id, bytes)) in header.data_pages.iter().zip(chunks).enumerate() {
            let mut page = Page::with_type(PageType::ChunkData);
            page.set_payload(bytes);
            page.set_next(header.data_pages.get(i + 1).copied().unwrap_or(PageId::INVALID));
            page.seal(header.epoch);
            self.disk.write_page(*page_id, &page)?;
        }
        for (page_id, page) in header.header_pages.iter().zip(header.to_pages()) {
            self.disk.write_page(*page_id, &page)?;
        }
        Ok(())
    }

    /// Write directory and free list for `committed`, then the superblock.
    ///
    /// `released` pages are still referenced by the current epoch and are
    /// recorded as free without being reused here. On an error before the
    /// superblock write every page allocated by this call goes back to the
    /// free set; after it the new superblock may be durable, so they stay
    /// allocated until the next open reclaims them.
    fn write_catalog(
        &mut self,
        committed: &BTreeMap<ChunkKey, ChunkHeader>,
        released: &[u32],
        epoch: u64,
        sync: bool,
    ) -> Result<(Vec<PageId>, u64)> {
        let entries: Vec<(ChunkKey, PageId)> =
            committed.iter().map(|(k, h)| (*k, h.root())).collect();

        let mut allocated = Vec::new();
        let mut superblock_written = false;
        let result = (|| -> Result<(Vec<PageId>, u64)> {
            let dir_count = entries.len().div_ceil(DIR_ENTRIES_PER_PAGE);
            let dir_pages = self.allocate_many(dir_count, &mut allocated)?;

            // Upper bound: the free set only shrinks while we allocate from it.
            let fl_count = (self.free.len() + released.len()).div_ceil(FREE_IDS_PER_PAGE);
            let fl_pages = self.allocate_many(fl_count, &mut allocated)?;

            let mut future_free: Vec<u32> = self.free.iter().copied().collect();
            future_free.extend_from_slice(released);
            future_free.sort_unstable();

            let mut written = 0u64;
            for (page_id, page) in dir_pages
                .iter()
                .zip(directory_pages(&entries, &dir_pages, epoch))
            {
                self.disk.write_page(*page_id, &page)?;
                written += 1;
            }
            for (page_id, page) in fl_pages
                .iter()
                .zip(free_list_pages(&future_free, &fl_pages, epoch))
            {
                self.disk.write_page(*page_id, &page)?;
                written += 1;
            }
            if sync {
                self.disk.sync()?;
            }

            let superblock = Superblock {
                epoch,
                file_id: self.superblock.file_id,
                page_size: self.superblock.page_size,
                directory_root: dir_pages.first().copied().unwrap_or(PageId::INVALID),
                free_list_root: fl_pages.first().copied().unwrap_or(PageId::INVALID),
                page_count: self.disk.page_count(),
            };
            self.disk
                .write_page(Superblock::slot_for(epoch), &superblock.to_page())?;
            superblock_written = true;
            if sync {
                self.disk.sync()?;
            }
            self.superblock = superblock;

            let mut meta = dir_pages;
            meta.extend(fl_pages);
            Ok((meta, written + 1))
        })();

        match &result {
            Err(_) if superblock_written => {
                warn!(epoch, pages = allocated.len(), "superblock written but not synced, keeping catalog pages");
            }
            Err(_) => self.release(allocated),
            Ok(_) => {}
        }
        result
    }

    fn allocate_many(&mut self, count: usize, allocated: &mut Vec<PageId>) -> Result<Vec<PageId>> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let page = self.allocate_page()?;
            allocated.push(page);
            pages.push(page);
        }
        Ok(pages)
    }
}

impl FlushTarget for PageStore {
    fn flush_chunk(&self, key: &ChunkKey, data: &[u8], encoding: EncodingMetadata) -> Result<()> {
        self.write_chunk(*key, data, encoding).map(|_| ())
    }
}

// ============================================================================
// Directory and free-list page codecs
// ============================================================================

/// Directory entry: key (17) + header root (4).
const DIR_ENTRY_SIZE: usize = ChunkKey::ENCODED_SIZE + 4;
const DIR_ENTRIES_PER_PAGE: usize = (Page::PAYLOAD_CAPACITY - 4) / DIR_ENTRY_SIZE;
const FREE_IDS_PER_PAGE: usize = (Page::PAYLOAD_CAPACITY - 4) / 4;

fn directory_pages(entries: &[(ChunkKey, PageId)], pages: &[PageId], epoch: u64) -> Vec<Page> {
    entries
        .chunks(DIR_ENTRIES_PER_PAGE)
        .enumerate()
        .map(|(i, batch)| {
            let mut payload = Vec::with_capacity(4 + batch.len() * DIR_ENTRY_SIZE);
            payload.extend_from_slice(&(batch.len() as u32).to_le_bytes());
            for (key, root) in batch {
                payload.extend_from_slice(&key.to_bytes());
                payload.extend_from_slice(&root.0.to_le_bytes());
            }
            chained_page(PageType::Directory, &payload, pages.get(i + 1), epoch)
        })
        .collect()
}

fn free_list_pages(free: &[u32], pages: &[PageId], epoch: u64) -> Vec<Page> {
    (0..pages.len())
        .map(|i| {
            let start = (i * FREE_IDS_PER_PAGE).min(free.len());
            let end = ((i + 1) * FREE_IDS_PER_PAGE).min(free.len());
            let batch = &free[start..end];
            let mut payload = Vec::with_capacity(4 + batch.len() * 4);
            payload.extend_from_slice(&(batch.len() as u32).to_le_bytes());
            for id in batch {
                payload.extend_from_slice(&id.to_le_bytes());
            }
            chained_page(PageType::FreeList, &payload, pages.get(i + 1), epoch)
        })
        .collect()
}

fn chained_page(page_type: PageType, payload: &[u8], next: Option<&PageId>, epoch: u64) -> Page {
    let mut page = Page::with_type(page_type);
    page.set_payload(payload);
    page.set_next(next.copied().unwrap_or(PageId::INVALID));
    page.seal(epoch);
    page
}

/// Walk a chain of `page_type` pages, returning each payload after its count.
fn read_chain(
    disk: &mut DiskManager,
    root: PageId,
    page_type: PageType,
    entry_size: usize,
    visited: &mut Vec<PageId>,
) -> Result<Vec<(PageId, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut current = root;
    while current.is_valid() {
        if visited.contains(&current) {
            return Err(Error::Corruption {
                page: current.0,
                reason: "cycle in metadata chain".into(),
            });
        }
        let page = disk.read_verified(current, page_type)?;
        let payload = page.payload();
        let count = if payload.len() >= 4 {
            u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize
        } else {
            usize::MAX
        };
        if count == usize::MAX || payload.len() < 4 + count * entry_size {
            return Err(Error::Corruption {
                page: current.0,
                reason: format!("{:?} page payload truncated", page_type),
            });
        }
        visited.push(current);
        out.push((current, payload[4..4 + count * entry_size].to_vec()));
        current = page.header().next;
    }
    Ok(out)
}

fn read_directory(
    disk: &mut DiskManager,
    root: PageId,
    visited: &mut Vec<PageId>,
) -> Result<Vec<(ChunkKey, PageId)>> {
    let mut entries = Vec::new();
    for (page, payload) in read_chain(disk, root, PageType::Directory, DIR_ENTRY_SIZE, visited)? {
        for raw in payload.chunks_exact(DIR_ENTRY_SIZE) {
            let key = ChunkKey::from_bytes(raw).ok_or_else(|| Error::Corruption {
                page: page.0,
                reason: "undecodable directory key".into(),
            })?;
            let at = ChunkKey::ENCODED_SIZE;
            let root = PageId(u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]));
            entries.push((key, root));
        }
    }
    Ok(entries)
}

fn read_free_list(disk: &mut DiskManager, root: PageId, visited: &mut Vec<PageId>) -> Result<Vec<u32>> {
    let mut free = Vec::new();
    for (_, payload) in read_chain(disk, root, PageType::FreeList, 4, visited)? {
        free.extend(
            payload
                .chunks_exact(4)
                .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        );
    }
    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::PAGE_SIZE;
    use crate::common::Compression;
    use tempfile::{tempdir, TempDir};

    fn create_store() -> (PageStore, PageStoreConfig, TempDir) {
        let dir = tempdir().unwrap();
        let config = PageStoreConfig::new(dir.path().join("chunks.db"));
        (PageStore::create(&config).unwrap(), config, dir)
    }

    fn key(fragment: u32) -> ChunkKey {
        ChunkKey::new(1, 10, 2, fragment)
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_write_read_uncommitted() {
        let (store, _config, _dir) = create_store();
        let data = payload(10_000, 1);
        let header = store
            .write_chunk(key(0), &data, EncodingMetadata::new(8, Compression::None))
            .unwrap();

        assert_eq!(header.data_pages.len(), 3);
        assert_eq!(header.epoch, 1);
        assert_eq!(store.chunk_state(&key(0)), ChunkState::Writing);

        let chunk = store.read_chunk(&key(0)).unwrap();
        assert_eq!(chunk.data, data);
        assert_eq!(chunk.encoding.element_width, 8);
        assert!(matches!(
            store.read_committed_chunk(&key(0)),
            Err(Error::ChunkNotFound(_))
        ));
    }

    #[test]
    fn test_checkpoint_and_reopen() {
        let (store, config, _dir) = create_store();
        let data = payload(9000, 7);
        store.write_chunk(key(0), &data, EncodingMetadata::default()).unwrap();
        assert_eq!(store.checkpoint().unwrap(), 1);
        assert_eq!(store.chunk_state(&key(0)), ChunkState::Committed(1));
        drop(store);

        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.epoch(), 1);
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, data);
    }

    #[test]
    fn test_uncommitted_write_lost_on_restart() {
        let (store, config, _dir) = create_store();
        store.write_chunk(key(0), b"first", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        store.write_chunk(key(0), b"second", EncodingMetadata::default()).unwrap();
        store.write_chunk(key(1), b"never committed", EncodingMetadata::default()).unwrap();
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, b"second");
        drop(store);

        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, b"first");
        assert_eq!(store.chunk_state(&key(1)), ChunkState::Absent);
        // The orphaned pages of both uncommitted versions are reusable.
        assert!(store.free_page_count() >= 4);
    }

    #[test]
    fn test_empty_chunk() {
        let (store, config, _dir) = create_store();
        store.write_chunk(key(3), &[], EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        drop(store);

        let store = PageStore::open(&config).unwrap();
        assert!(store.read_chunk(&key(3)).unwrap().data.is_empty());
        assert_eq!(store.chunk_size(&key(3)), Some(0));
    }

    #[test]
    fn test_rewrite_in_same_epoch_frees_pages() {
        let (store, _config, _dir) = create_store();
        store.write_chunk(key(0), &payload(5000, 1), EncodingMetadata::default()).unwrap();
        let pages_after_first = store.page_count();
        store.write_chunk(key(0), &payload(5000, 2), EncodingMetadata::default()).unwrap();
        store.write_chunk(key(0), &payload(5000, 3), EncodingMetadata::default()).unwrap();
        // Third write reuses the pages the first write released.
        assert_eq!(store.page_count(), pages_after_first + 3);
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, payload(5000, 3));
    }

    #[test]
    fn test_committed_pages_not_reused_before_checkpoint() {
        let (store, _config, _dir) = create_store();
        let first = store.write_chunk(key(0), &payload(100, 1), EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        let second = store.write_chunk(key(0), &payload(100, 2), EncodingMetadata::default()).unwrap();

        let old: HashSet<PageId> = first.owned_pages().collect();
        assert!(second.owned_pages().all(|p| !old.contains(&p)));
        assert_eq!(store.read_committed_chunk(&key(0)).unwrap().data, payload(100, 1));
    }

    #[test]
    fn test_delete_lifecycle() {
        let (store, config, _dir) = create_store();
        store.write_chunk(key(0), b"doomed", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();

        store.delete_chunk(&key(0)).unwrap();
        assert_eq!(store.chunk_state(&key(0)), ChunkState::Deleted);
        assert!(matches!(store.read_chunk(&key(0)), Err(Error::ChunkNotFound(_))));
        // Still readable from the committed epoch until the next checkpoint.
        assert_eq!(store.read_committed_chunk(&key(0)).unwrap().data, b"doomed");

        store.checkpoint().unwrap();
        assert_eq!(store.chunk_state(&key(0)), ChunkState::Deleted);
        assert!(store.delete_chunk(&key(0)).is_err());
        drop(store);

        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.chunk_state(&key(0)), ChunkState::Absent);
    }

    #[test]
    fn test_recreate_after_delete() {
        let (store, _config, _dir) = create_store();
        store.write_chunk(key(0), b"v1", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        store.delete_chunk(&key(0)).unwrap();
        store.checkpoint().unwrap();

        store.write_chunk(key(0), b"v2", EncodingMetadata::default()).unwrap();
        assert_eq!(store.chunk_state(&key(0)), ChunkState::Writing);
        store.checkpoint().unwrap();
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, b"v2");
    }

    #[test]
    fn test_delete_missing_chunk() {
        let (store, _config, _dir) = create_store();
        assert!(matches!(store.delete_chunk(&key(9)), Err(Error::ChunkNotFound(_))));
    }

    #[test]
    fn test_checkpoint_without_changes_is_noop() {
        let (store, _config, _dir) = create_store();
        assert_eq!(store.checkpoint().unwrap(), 0);
        store.write_chunk(key(0), b"x", EncodingMetadata::default()).unwrap();
        assert_eq!(store.checkpoint().unwrap(), 1);
        assert_eq!(store.checkpoint().unwrap(), 1);
    }

    #[test]
    fn test_free_pages_recycled_across_checkpoints() {
        let (store, _config, _dir) = create_store();
        for round in 0..5u8 {
            store.write_chunk(key(0), &payload(20_000, round), EncodingMetadata::default()).unwrap();
            store.checkpoint().unwrap();
        }
        let stable = store.page_count();
        for round in 5..10u8 {
            store.write_chunk(key(0), &payload(20_000, round), EncodingMetadata::default()).unwrap();
            store.checkpoint().unwrap();
        }
        assert_eq!(store.page_count(), stable);
    }

    #[test]
    fn test_many_chunks_span_directory_pages() {
        let (store, config, _dir) = create_store();
        let count = DIR_ENTRIES_PER_PAGE as u32 + 20;
        for fragment in 0..count {
            store
                .write_chunk(key(fragment), &fragment.to_le_bytes(), EncodingMetadata::default())
                .unwrap();
        }
        store.checkpoint().unwrap();
        drop(store);

        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.chunk_keys().len(), count as usize);
        assert_eq!(store.read_chunk(&key(count - 1)).unwrap().data, (count - 1).to_le_bytes());
    }

    #[test]
    fn test_corrupt_data_page_reported_for_that_chunk_only() {
        use std::io::{Seek, SeekFrom, Write};

        let (store, config, _dir) = create_store();
        let header = store.write_chunk(key(0), &payload(3000, 1), EncodingMetadata::default()).unwrap();
        store.write_chunk(key(1), b"healthy", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        drop(store);

        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&config.path).unwrap();
            file.seek(SeekFrom::Start(header.data_pages[0].file_offset() + 100)).unwrap();
            file.write_all(&[0xEE; 8]).unwrap();
        }

        let store = PageStore::open(&config).unwrap();
        assert!(matches!(store.read_chunk(&key(0)), Err(Error::Corruption { .. })));
        assert_eq!(store.read_chunk(&key(1)).unwrap().data, b"healthy");
    }

    #[test]
    fn test_torn_superblock_falls_back_to_previous_epoch() {
        use std::io::{Seek, SeekFrom, Write};

        let (store, config, _dir) = create_store();
        store.write_chunk(key(0), b"epoch one", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        store.write_chunk(key(0), b"epoch two", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        drop(store);

        // Epoch 2 lives in slot 0; tear it.
        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&config.path).unwrap();
            file.seek(SeekFrom::Start(30)).unwrap();
            file.write_all(&[0xAB; 4]).unwrap();
        }

        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.epoch(), 1);
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, b"epoch one");
    }

    #[test]
    fn test_unreadable_directory_falls_back_to_previous_epoch() {
        use std::io::{Seek, SeekFrom, Write};

        let (store, config, _dir) = create_store();
        store.write_chunk(key(0), b"epoch one", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        store.write_chunk(key(0), b"epoch two", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        let directory_root = store.inner.lock().superblock.directory_root;
        drop(store);

        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&config.path).unwrap();
            file.seek(SeekFrom::Start(directory_root.file_offset() + 64)).unwrap();
            file.write_all(b"garbage!").unwrap();
        }

        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.epoch(), 1);
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, b"epoch one");
        store.write_chunk(key(0), b"epoch two again", EncodingMetadata::default()).unwrap();
        assert_eq!(store.checkpoint().unwrap(), 2);
    }

    #[test]
    fn test_unsynced_superblock_keeps_catalog_pages() {
        let (store, config, _dir) = create_store();
        store.write_chunk(key(0), b"one", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        store.write_chunk(key(1), b"two", EncodingMetadata::default()).unwrap();

        // Catalog sync passes, superblock sync fails.
        store.inner.lock().disk.fail_sync_after(1);
        assert!(matches!(store.checkpoint(), Err(Error::Io(_))));
        assert_eq!(store.epoch(), 1);

        let written = {
            let mut inner = store.inner.lock();
            let slot = Superblock::slot_for(2);
            let page = inner.disk.read_page(slot).unwrap();
            Superblock::from_page(slot, &page).unwrap()
        };
        assert_eq!(written.epoch, 2);
        {
            let inner = store.inner.lock();
            assert!(!inner.free.contains(&written.directory_root.0));
            assert!(!inner.free.contains(&written.free_list_root.0));
        }

        // Reuse free pages, then crash.
        store
            .write_chunk(key(2), &payload(6 * PAGE_SIZE, 5), EncodingMetadata::default())
            .unwrap();
        drop(store);

        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.epoch(), 2);
        assert_eq!(store.read_chunk(&key(0)).unwrap().data, b"one");
        assert_eq!(store.read_chunk(&key(1)).unwrap().data, b"two");
        assert!(matches!(store.read_chunk(&key(2)), Err(Error::ChunkNotFound(_))));
    }

    #[test]
    fn test_open_with_wrong_file_id() {
        let (store, config, _dir) = create_store();
        drop(store);
        let other = config.clone().with_file_id(9);
        assert!(matches!(PageStore::open(&other), Err(Error::InvalidConfig(_))));
    }
}
