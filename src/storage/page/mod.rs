//! On-disk page format.
//!
//! - [`Page`] - 4KB aligned buffer with header and payload accessors
//! - [`PageHeader`] - type, checksum, epoch, chain link and payload length
//! - [`PageType`] - superblock, chunk header/data, directory, free list

#[allow(clippy::module_inception)]
mod page;
mod page_header;

pub use page::Page;
pub use page_header::{PageHeader, PageType};
