//! Disk spill store for entries evicted from the foreign cache's memory.
//!
//! Each entry is one file, `<dir>/<db>_<table>_<column>_<fragment>_<part>.chunk`.
//! The store has its own byte budget and LRU order. Files left by an
//! earlier process are removed on open.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::buffer::replacer::{EvictionPolicy, LruPolicy};
use crate::common::config::SpillConfig;
use crate::common::{ChunkKey, EncodingMetadata, Result};

use super::entry::{ChunkProvenance, ForeignChunk};

const SPILL_MAGIC: u32 = 0x4653_4354;
const SPILL_EXTENSION: &str = "chunk";

/// Spill file layout.
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic
/// 4       4     CRC32 of everything after this field
/// 8       8     payload length
/// 16      17    chunk key
/// 33      16    encoding metadata
/// 49      4     row group
/// 53      8     byte range start
/// 61      8     byte range end
/// 69      8     source modification stamp
/// 77      2     source path length (n)
/// 79      n     source path (UTF-8)
/// 79+n    ...   payload
/// ```
const FIXED_HEADER: usize = 79;

struct SpillEntry {
    file_bytes: u64,
    source_path: String,
}

pub(crate) struct SpillStore {
    dir: PathBuf,
    max_bytes: u64,
    used_bytes: u64,
    entries: HashMap<ChunkKey, SpillEntry>,
    order: LruPolicy,
}

impl SpillStore {
    pub fn open(config: &SpillConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let mut stale = 0;
        for entry in fs::read_dir(&config.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SPILL_EXTENSION) {
                fs::remove_file(&path)?;
                stale += 1;
            }
        }
        if stale > 0 {
            debug!(dir = %config.dir.display(), files = stale, "removed stale spill files");
        }
        Ok(Self {
            dir: config.dir.clone(),
            max_bytes: config.max_bytes,
            used_bytes: 0,
            entries: HashMap::new(),
            order: LruPolicy::new(),
        })
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Write `chunk` to its spill file, evicting older files to stay within
    /// budget. Returns `false` if the file alone would exceed the budget.
    pub fn store(&mut self, key: ChunkKey, chunk: &ForeignChunk) -> Result<bool> {
        let encoded = encode(&key, chunk);
        let file_bytes = encoded.len() as u64;
        if file_bytes > self.max_bytes {
            return Ok(false);
        }

        self.remove(&key)?;
        while self.used_bytes + file_bytes > self.max_bytes {
            let Some(victim) = self.order.choose_victim(&|_: &ChunkKey| true) else {
                break;
            };
            self.remove(&victim)?;
            debug!(key = %victim, "dropped spill file over budget");
        }

        let path = self.path_for(&key);
        let staging = path.with_extension("tmp");
        fs::write(&staging, &encoded)?;
        fs::rename(&staging, &path)?;

        self.used_bytes += file_bytes;
        self.entries.insert(
            key,
            SpillEntry {
                file_bytes,
                source_path: chunk.provenance.source_path.clone(),
            },
        );
        self.order.record_access(key);
        debug!(key = %key, bytes = file_bytes, "spilled chunk");
        Ok(true)
    }

    /// Read back a spilled chunk. A file that fails verification is removed
    /// and reported as a miss.
    pub fn load(&mut self, key: &ChunkKey) -> Result<Option<ForeignChunk>> {
        if !self.entries.contains_key(key) {
            return Ok(None);
        }
        let raw = match fs::read(self.path_for(key)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key = %key, "spill file disappeared");
                self.forget(key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match decode(key, &raw) {
            Ok(chunk) => {
                self.order.record_access(*key);
                Ok(Some(chunk))
            }
            Err(reason) => {
                warn!(key = %key, reason, "discarding corrupt spill file");
                self.remove(key)?;
                Ok(None)
            }
        }
    }

    /// Delete the spill file for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &ChunkKey) -> Result<bool> {
        if !self.entries.contains_key(key) {
            return Ok(false);
        }
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.forget(key);
        Ok(true)
    }

    /// Keys whose spill entry matches `pred` on (key, source path).
    pub fn keys_where(&self, pred: impl Fn(&ChunkKey, &str) -> bool) -> Vec<ChunkKey> {
        self.entries
            .iter()
            .filter(|(key, entry)| pred(*key, entry.source_path.as_str()))
            .map(|(key, _)| *key)
            .collect()
    }

    fn forget(&mut self, key: &ChunkKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.used_bytes -= entry.file_bytes;
        }
        self.order.remove(key);
    }

    fn path_for(&self, key: &ChunkKey) -> PathBuf {
        self.dir
            .join(key.file_stem())
            .with_extension(SPILL_EXTENSION)
    }
}

fn encode(key: &ChunkKey, chunk: &ForeignChunk) -> Vec<u8> {
    let path = chunk.provenance.source_path.as_bytes();
    let path_len = path.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(FIXED_HEADER + path_len + chunk.len());

    out.extend_from_slice(&SPILL_MAGIC.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(chunk.len() as u64).to_le_bytes());
    out.extend_from_slice(&key.to_bytes());
    out.extend_from_slice(&chunk.encoding.to_bytes());
    out.extend_from_slice(&chunk.provenance.row_group.to_le_bytes());
    out.extend_from_slice(&chunk.provenance.byte_range.start.to_le_bytes());
    out.extend_from_slice(&chunk.provenance.byte_range.end.to_le_bytes());
    out.extend_from_slice(&chunk.provenance.modified.to_le_bytes());
    out.extend_from_slice(&(path_len as u16).to_le_bytes());
    out.extend_from_slice(&path[..path_len]);
    out.extend_from_slice(&chunk.data);

    let crc = crc32fast::hash(&out[8..]);
    out[4..8].copy_from_slice(&crc.to_le_bytes());
    out
}

fn decode(key: &ChunkKey, raw: &[u8]) -> std::result::Result<ForeignChunk, &'static str> {
    if raw.len() < FIXED_HEADER {
        return Err("truncated header");
    }
    let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
    let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    if u32_at(0) != SPILL_MAGIC {
        return Err("bad magic");
    }
    if crc32fast::hash(&raw[8..]) != u32_at(4) {
        return Err("checksum mismatch");
    }
    if ChunkKey::from_bytes(&raw[16..33]) != Some(*key) {
        return Err("key mismatch");
    }
    let encoding = EncodingMetadata::from_bytes(&raw[33..49]).ok_or("bad encoding")?;
    let path_len = u16_at(77) as usize;
    let payload_start = FIXED_HEADER + path_len;
    let payload_len = u64_at(8) as usize;
    if raw.len() != payload_start + payload_len {
        return Err("length mismatch");
    }
    let source_path = std::str::from_utf8(&raw[FIXED_HEADER..payload_start])
        .map_err(|_| "source path is not UTF-8")?;

    let provenance = ChunkProvenance {
        source_path: source_path.to_string(),
        row_group: u32_at(49),
        byte_range: u64_at(53)..u64_at(61),
        modified: u64_at(69),
    };
    Ok(ForeignChunk::new(
        raw[payload_start..].to_vec(),
        encoding,
        provenance,
    ))
}
