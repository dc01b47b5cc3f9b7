//! The hibernation engine core: page classification, the module pipeline,
//! the atomic copy controller and the hibernate/resume cycle state
//! machine.
//!
//! The host kernel's services are reached through two trait seams,
//! [`MemoryHost`] for physical memory and [`Platform`] for the freezer,
//! device power management and the architecture snapshot hooks, so the
//! whole cycle can be driven single-threaded against in-memory
//! implementations.

mod atomic;
mod classify;
mod config;
mod engine;
mod error;
mod filters;
mod header;
mod host;
mod maps;
mod module;
mod pipeline;
mod platform;
mod result;
mod stats;
pub mod test_util;
mod writer;

pub use atomic::{copy_pageset1, copyback, end_atomic, go_atomic, AtomicStage};
pub use classify::{Classifier, PrepareStats, SHRINK_RETRIES};
pub use config::{EngineConfig, IMAGE_SIZE_NONE, IMAGE_SIZE_UNLIMITED};
pub use engine::Engine;
pub use error::{Result, SnapshotError};
pub use filters::{ChecksumFilter, CompressionFilter};
pub use header::{
    bitmap_to_chain, chain_to_bitmap, ImageHeader, ImageInfo, FIXED_RECORD_LEN, HEADER_MAGIC,
};
pub use host::{MemoryHost, PageKind, Zone, ZoneKind};
pub use maps::PageMaps;
pub use module::{
    Filter, ImagePresence, Module, ModuleKind, ModuleRegistry, PageSink, PageSource, StreamKind,
    Writer,
};
pub use pipeline::Pipeline;
pub use platform::{Platform, SnapshotSide, SuspendPhase};
pub use result::{AbortFlag, CycleResult, CycleState};
pub use stats::IoStats;
pub use writer::SwapWriter;

pub use cryo_mem::{Pfn, RestoreEntry, RestoreList, PAGE_SIZE, PFN_END};
