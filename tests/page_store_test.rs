//! Integration tests for the durable page store.
//!
//! Each test reopens the page file to check what survives a restart.

use tiercache::storage::ChunkHeader;
use tiercache::{ChunkKey, ChunkState, Compression, EncodingMetadata, Error, PageStore, PageStoreConfig, PAGE_SIZE};
use tempfile::tempdir;

fn config(dir: &tempfile::TempDir) -> PageStoreConfig {
    PageStoreConfig::new(dir.path().join("chunks.db"))
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Chunks of every size class survive a restart byte for byte.
#[test]
fn test_round_trip_across_restart() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let encoding = EncodingMetadata::new(2, Compression::Diff).with_nulls(u16::MAX as u64);
    // One header page lists IDS_PER_PAGE data pages; go past it.
    let spans_headers = (ChunkHeader::IDS_PER_PAGE + 3) * PAGE_SIZE;
    let sizes = [0, 1, PAGE_SIZE - 1, PAGE_SIZE * 3 + 17, spans_headers];

    {
        let store = PageStore::create(&config).unwrap();
        for (i, size) in sizes.iter().enumerate() {
            store
                .write_chunk(ChunkKey::new(1, 1, 0, i as u32), &payload(*size, i as u8), encoding)
                .unwrap();
        }
        assert_eq!(store.checkpoint().unwrap(), 1);
    }

    let store = PageStore::open(&config).unwrap();
    assert_eq!(store.epoch(), 1);
    for (i, size) in sizes.iter().enumerate() {
        let key = ChunkKey::new(1, 1, 0, i as u32);
        let chunk = store.read_chunk(&key).unwrap();
        assert_eq!(chunk.data, payload(*size, i as u8), "chunk {} differs", key);
        assert_eq!(chunk.encoding, encoding);
        assert_eq!(store.chunk_state(&key), ChunkState::Committed(1));
    }
}

/// Writes after the last checkpoint are gone after a crash; earlier
/// versions are intact.
#[test]
fn test_crash_keeps_last_checkpoint() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let key = ChunkKey::new(4, 2, 1, 0);

    {
        let store = PageStore::create(&config).unwrap();
        store.write_chunk(key, b"committed", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();

        store.write_chunk(key, b"lost in the crash", EncodingMetadata::default()).unwrap();
        store
            .write_chunk(ChunkKey::new(4, 2, 1, 1), b"never committed", EncodingMetadata::default())
            .unwrap();
        assert_eq!(store.read_chunk(&key).unwrap().data, b"lost in the crash");
        assert_eq!(store.read_committed_chunk(&key).unwrap().data, b"committed");
        // Dropped without a checkpoint.
    }

    let store = PageStore::open(&config).unwrap();
    assert_eq!(store.read_chunk(&key).unwrap().data, b"committed");
    assert!(matches!(
        store.read_chunk(&ChunkKey::new(4, 2, 1, 1)),
        Err(Error::ChunkNotFound(_))
    ));
}

/// Pages written by a crashed session are reclaimed, so repeated crashes
/// do not grow the file.
#[test]
fn test_orphan_pages_reclaimed_after_crash() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let key = ChunkKey::new(1, 1, 1, 1);

    {
        let store = PageStore::create(&config).unwrap();
        store.write_chunk(key, &payload(8 * PAGE_SIZE, 0), EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
    }

    let mut page_counts = Vec::new();
    for round in 0..4u8 {
        let store = PageStore::open(&config).unwrap();
        store
            .write_chunk(key, &payload(8 * PAGE_SIZE, round + 1), EncodingMetadata::default())
            .unwrap();
        page_counts.push(store.page_count());
    }
    assert!(
        page_counts.windows(2).all(|w| w[0] == w[1]),
        "page count grew across crashes: {:?}",
        page_counts
    );

    let store = PageStore::open(&config).unwrap();
    assert_eq!(store.read_chunk(&key).unwrap().data, payload(8 * PAGE_SIZE, 0));
}

/// A delete is durable only once checkpointed.
#[test]
fn test_delete_durability() {
    let dir = tempdir().unwrap();
    let config = config(&dir);
    let key = ChunkKey::new(9, 9, 9, 9);

    {
        let store = PageStore::create(&config).unwrap();
        store.write_chunk(key, b"doomed", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        store.delete_chunk(&key).unwrap();
        assert_eq!(store.chunk_state(&key), ChunkState::Deleted);
    }
    {
        let store = PageStore::open(&config).unwrap();
        assert_eq!(store.read_chunk(&key).unwrap().data, b"doomed");
        store.delete_chunk(&key).unwrap();
        store.checkpoint().unwrap();
    }

    let store = PageStore::open(&config).unwrap();
    assert!(matches!(store.read_chunk(&key), Err(Error::ChunkNotFound(_))));
    assert!(store.chunk_keys().is_empty());
    assert!(store.free_page_count() > 0);
}

/// Flipped bytes in a committed data page surface as corruption for that
/// chunk alone.
#[test]
fn test_corruption_is_reported() {
    use std::io::{Seek, SeekFrom, Write};

    let dir = tempdir().unwrap();
    let config = config(&dir);
    let damaged = ChunkKey::new(1, 1, 0, 0);
    let healthy = ChunkKey::new(1, 1, 0, 1);

    let header = {
        let store = PageStore::create(&config).unwrap();
        let header = store
            .write_chunk(damaged, &payload(2 * PAGE_SIZE, 3), EncodingMetadata::default())
            .unwrap();
        store.write_chunk(healthy, b"fine", EncodingMetadata::default()).unwrap();
        store.checkpoint().unwrap();
        header
    };

    {
        let mut file = std::fs::OpenOptions::new().write(true).open(&config.path).unwrap();
        file.seek(SeekFrom::Start(header.data_pages[1].file_offset() + 64)).unwrap();
        file.write_all(b"garbage!").unwrap();
    }

    let store = PageStore::open(&config).unwrap();
    assert!(matches!(store.read_chunk(&damaged), Err(Error::Corruption { .. })));
    assert_eq!(store.read_chunk(&healthy).unwrap().data, b"fine");
}

/// Statistics count pages and checkpoints.
#[test]
fn test_stats() {
    let dir = tempdir().unwrap();
    let store = PageStore::create(&config(&dir)).unwrap();
    store
        .write_chunk(ChunkKey::new(1, 1, 1, 1), &payload(PAGE_SIZE * 2, 0), EncodingMetadata::default())
        .unwrap();
    store.checkpoint().unwrap();
    store.read_chunk(&ChunkKey::new(1, 1, 1, 1)).unwrap();

    let stats = store.stats().snapshot();
    assert_eq!(stats.chunks_written, 1);
    assert_eq!(stats.checkpoints, 1);
    assert!(stats.pages_written >= 4);
    assert!(stats.pages_read >= 3);
}
