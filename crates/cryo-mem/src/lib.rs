//! Page-frame bookkeeping for the hibernation engine.
//!
//! This crate is deliberately dependency-free. It provides the sparse
//! per-page-frame bit set every other layer is built on, plus the
//! arena-backed restore list the atomic-restore path walks.

mod bitmap;
mod restore;

pub use bitmap::PageBitmap;
pub use restore::{RestoreEntry, RestoreList};

/// Size of one page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel returned by [`PageBitmap::next_pfn`] when iteration is done.
pub const PFN_END: u64 = u64::MAX;

/// A physical page frame number. The valid PFN space is sparse.
pub type Pfn = u64;
