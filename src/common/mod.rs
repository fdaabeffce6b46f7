//! Common types and utilities shared across tiercache.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration constants and config structs
//! - Error types
//! - Identifiers (ChunkKey, PageId, TierId)
//! - Encoding metadata carried with chunk bytes

mod chunk_key;
pub mod config;
mod encoding;
pub mod error;
mod page_id;
mod tier_id;

pub use chunk_key::{ChunkKey, ChunkPart};
pub use encoding::{Compression, EncodingMetadata};
pub use error::{Error, Result};
pub use page_id::PageId;
pub use tier_id::TierId;
