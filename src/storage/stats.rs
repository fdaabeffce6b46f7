//! Page store I/O counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the [`PageStore`](super::PageStore).
///
/// Relaxed atomics; counters are independent of each other.
#[derive(Debug, Default)]
pub struct PageStoreStats {
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    /// Chunk versions written, committed or not.
    pub chunks_written: AtomicU64,
    pub checkpoints: AtomicU64,
}

impl PageStoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PageStoreSnapshot {
        PageStoreSnapshot {
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PageStoreStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageStoreSnapshot {
    pub pages_read: u64,
    pub pages_written: u64,
    pub chunks_written: u64,
    pub checkpoints: u64,
}

impl fmt::Display for PageStoreSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageStore {{ read: {}, written: {}, chunks: {}, checkpoints: {} }}",
            self.pages_read, self.pages_written, self.chunks_written, self.checkpoints
        )
    }
}
