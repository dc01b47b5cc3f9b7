//! Backing-store plumbing for the hibernation engine: block-device
//! abstraction, run-length extent chains, the swap-slot reservation
//! machinery, and the on-disk signature codec.

mod backend;
mod extent;
mod signature;
mod swap;

pub use backend::{page_io, FileBackend, IoDir, MemBackend, StorageBackend};
pub use extent::{Extent, ExtentChain};
pub use signature::{
    parse_signature, read_signature, restore_swap_signature, set_resume_attempted,
    write_image_signature, ImageSignature, SignatureKind, SIGNATURE_LEN,
};
pub use swap::{SectorMap, SectorRun, SlotSource, SwapAllocator, SwapSlot, SwapSpace};

use thiserror::Error;

/// Bytes per device sector.
pub const SECTOR_SIZE: usize = 512;
/// Bytes per page; the unit the image stream is reserved and accounted in.
pub const PAGE_SIZE: usize = 4096;
/// Sectors per page.
pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE / SECTOR_SIZE) as u64;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of bounds: offset {offset} + len {len} exceeds device length {device_len}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        device_len: u64,
    },

    #[error("offset arithmetic overflow")]
    OffsetOverflow,

    #[error("corrupt data: {0}")]
    Corrupt(&'static str),

    #[error("backing store exhausted")]
    NoSpace,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;
