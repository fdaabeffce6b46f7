//! Encoding metadata carried alongside chunk bytes.
//!
//! The cache never interprets column payloads. It only moves this metadata
//! with the bytes so that consumers on any tier can decode them.

/// Compression scheme identifier of a chunk.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    None = 0,
    Fixed = 1,
    RunLength = 2,
    Diff = 3,
    Dictionary = 4,
    Sparse = 5,
}

impl Compression {
    /// Convert from u8, returning `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Fixed),
            2 => Some(Compression::RunLength),
            3 => Some(Compression::Diff),
            4 => Some(Compression::Dictionary),
            5 => Some(Compression::Sparse),
            _ => None,
        }
    }
}

/// Per-chunk encoding description.
///
/// # Layout (16 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       2     element_width
/// 2       1     compression
/// 3       1     has_nulls
/// 4       4     comp_param
/// 8       8     null_sentinel
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingMetadata {
    /// Width of one element in bytes (0 for variable length payloads).
    pub element_width: u16,
    pub compression: Compression,
    /// Scheme parameter, e.g. bit width for fixed encoding.
    pub comp_param: u32,
    pub has_nulls: bool,
    /// Raw bit pattern used to mark nulls.
    pub null_sentinel: u64,
}

impl EncodingMetadata {
    pub const ENCODED_SIZE: usize = 16;

    pub fn new(element_width: u16, compression: Compression) -> Self {
        Self {
            element_width,
            compression,
            ..Self::default()
        }
    }

    pub fn with_nulls(mut self, null_sentinel: u64) -> Self {
        self.has_nulls = true;
        self.null_sentinel = null_sentinel;
        self
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[0..2].copy_from_slice(&self.element_width.to_le_bytes());
        out[2] = self.compression as u8;
        out[3] = self.has_nulls as u8;
        out[4..8].copy_from_slice(&self.comp_param.to_le_bytes());
        out[8..16].copy_from_slice(&self.null_sentinel.to_le_bytes());
        out
    }

    /// Decode; `None` on a short slice or unknown compression id.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return None;
        }
        let mut sentinel = [0u8; 8];
        sentinel.copy_from_slice(&data[8..16]);
        Some(Self {
            element_width: u16::from_le_bytes([data[0], data[1]]),
            compression: Compression::from_u8(data[2])?,
            has_nulls: data[3] != 0,
            comp_param: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            null_sentinel: u64::from_le_bytes(sentinel),
        })
    }
}
