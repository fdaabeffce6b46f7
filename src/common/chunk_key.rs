//! Chunk identifier type.

use std::fmt;

/// Which part of a chunk a key addresses.
///
/// Fixed-width columns have a single `Whole` chunk per fragment. Variable
/// length columns store their payload and their offset index as two chunks.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ChunkPart {
    #[default]
    Whole = 0,
    VarlenData = 1,
    VarlenIndex = 2,
}

impl ChunkPart {
    /// Convert from u8, returning `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChunkPart::Whole),
            1 => Some(ChunkPart::VarlenData),
            2 => Some(ChunkPart::VarlenIndex),
            _ => None,
        }
    }
}

/// Identifies one chunk: one column of one fragment of one table.
///
/// Keys are totally ordered field by field, which groups all chunks of a
/// table (and of a column within it) together in ordered maps.
///
/// # Example
/// ```
/// use tiercache::{ChunkKey, ChunkPart};
///
/// let key = ChunkKey::new(1, 7, 2, 0);
/// assert!(key.belongs_to_table(1, 7));
/// assert_eq!(key.with_part(ChunkPart::VarlenIndex).part, ChunkPart::VarlenIndex);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub db_id: u32,
    pub table_id: u32,
    pub column_id: u32,
    pub fragment_id: u32,
    pub part: ChunkPart,
}

impl ChunkKey {
    /// Size of the fixed on-disk encoding.
    pub const ENCODED_SIZE: usize = 17;

    pub fn new(db_id: u32, table_id: u32, column_id: u32, fragment_id: u32) -> Self {
        Self {
            db_id,
            table_id,
            column_id,
            fragment_id,
            part: ChunkPart::Whole,
        }
    }

    pub fn with_part(mut self, part: ChunkPart) -> Self {
        self.part = part;
        self
    }

    /// `(db_id, table_id)` of the owning table.
    #[inline]
    pub fn table_prefix(&self) -> (u32, u32) {
        (self.db_id, self.table_id)
    }

    #[inline]
    pub fn belongs_to_table(&self, db_id: u32, table_id: u32) -> bool {
        self.db_id == db_id && self.table_id == table_id
    }

    /// Little-endian fixed-width encoding used in page headers and spill files.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[0..4].copy_from_slice(&self.db_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.table_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.column_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.fragment_id.to_le_bytes());
        out[16] = self.part as u8;
        out
    }

    /// Decode a key; `None` if the slice is short or the part is unknown.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        Some(Self {
            db_id: word(0),
            table_id: word(4),
            column_id: word(8),
            fragment_id: word(12),
            part: ChunkPart::from_u8(data[16])?,
        })
    }

    /// File-name friendly rendering, used by the spill store.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.db_id, self.table_id, self.column_id, self.fragment_id, self.part as u8
        )
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk({},{},{},{}",
            self.db_id, self.table_id, self.column_id, self.fragment_id
        )?;
        match self.part {
            ChunkPart::Whole => write!(f, ")"),
            ChunkPart::VarlenData => write!(f, ",data)"),
            ChunkPart::VarlenIndex => write!(f, ",index)"),
        }
    }
}
