use cryo_mem::Pfn;
use tracing::{debug, info};

use crate::config::{EngineConfig, IMAGE_SIZE_NONE, IMAGE_SIZE_UNLIMITED};
use crate::host::{MemoryHost, PageKind};
use crate::maps::PageMaps;
use crate::{Result, SnapshotError};

/// How many times `shrink_memory` is retried before a shortage aborts the
/// cycle.
pub const SHRINK_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareStats {
    pub pageset1: u64,
    pub pageset2: u64,
    pub free: u64,
}

enum Class {
    Pageset1,
    Pageset2,
    Free,
    Nosave,
    Skip,
}

fn classify(kind: PageKind, config: &EngineConfig) -> Class {
    match kind {
        PageKind::Nosave => Class::Nosave,
        PageKind::Unused => Class::Free,
        PageKind::KernelText => Class::Skip,
        PageKind::KernelData => Class::Pageset1,
        PageKind::PageCache => {
            if config.no_pageset2 {
                Class::Pageset1
            } else {
                Class::Pageset2
            }
        }
        PageKind::UserAnon => {
            if !config.no_pageset2 && config.full_pageset2 {
                Class::Pageset2
            } else {
                Class::Pageset1
            }
        }
    }
}

/// The page classifier: walks the online zones, partitions every valid
/// frame, and reserves the copy pages the atomic snapshot will use.
#[derive(Default)]
pub struct Classifier {
    /// Copy pages held back for pageset-1 growth caught by
    /// [`recalculate`](Self::recalculate).
    allowance_pool: Vec<Pfn>,
    initial_pageset1: u64,
    extra_used: u64,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn walk<H: MemoryHost>(host: &H, config: &EngineConfig, maps: &mut PageMaps) {
        maps.clear_all();
        for zone in host.zones() {
            for pfn in zone.start_pfn..zone.end_pfn {
                if !host.pfn_valid(pfn) {
                    continue;
                }
                match classify(host.page_kind(pfn), config) {
                    Class::Pageset1 => maps.pageset1.set(pfn),
                    Class::Pageset2 => maps.pageset2.set(pfn),
                    Class::Free => maps.free.set(pfn),
                    Class::Nosave => maps.nosave.set(pfn),
                    Class::Skip => {}
                }
            }
        }
    }

    /// Classify every frame and reserve `|pageset1|` copy pages plus the
    /// extra-pages allowance, shrinking memory and retrying on shortage.
    pub fn prepare_image<H: MemoryHost>(
        &mut self,
        host: &mut H,
        config: &EngineConfig,
        maps: &mut PageMaps,
    ) -> Result<PrepareStats> {
        if config.image_size_limit == IMAGE_SIZE_NONE {
            return Err(SnapshotError::Unsupported("image disabled by image_size_limit"));
        }

        self.allowance_pool.clear();

        let mut attempt = 0u32;
        loop {
            Self::walk(host, config, maps);

            let ps1 = maps.pageset1.count();
            let ps2 = maps.pageset2.count();
            let free = maps.free.count();

            let over_limit = config.image_size_limit != IMAGE_SIZE_UNLIMITED
                && ps1 + ps2 > config.image_size_limit as u64;
            let needed = ps1 + config.extra_pages_allowance;
            let short = free < needed;

            if !over_limit && !short {
                self.reserve(config, maps);
                self.initial_pageset1 = ps1;
                self.extra_used = 0;
                let stats = PrepareStats {
                    pageset1: ps1,
                    pageset2: ps2,
                    free: maps.free.count(),
                };
                info!(
                    pageset1 = stats.pageset1,
                    pageset2 = stats.pageset2,
                    free = stats.free,
                    "image prepared"
                );
                return Ok(stats);
            }

            if attempt >= SHRINK_RETRIES || host.shrink_memory() == 0 {
                debug!(
                    ps1,
                    ps2,
                    free,
                    needed,
                    over_limit,
                    "classification cannot satisfy reserve or size limit"
                );
                return Err(SnapshotError::NoSpace);
            }
            attempt += 1;
        }
    }

    fn reserve(&mut self, config: &EngineConfig, maps: &mut PageMaps) {
        let ps1 = maps.pageset1.count();
        let mut taken = 0u64;
        maps.free.seek(0);
        while taken < ps1 {
            let pfn = maps.free.next_pfn();
            debug_assert_ne!(pfn, cryo_mem::PFN_END);
            maps.pageset1_copy.set(pfn);
            maps.free.clear(pfn);
            taken += 1;
        }
        while (self.allowance_pool.len() as u64) < config.extra_pages_allowance {
            let pfn = maps.free.next_pfn();
            debug_assert_ne!(pfn, cryo_mem::PFN_END);
            // Touch the copy map now so promoting an allowance page later
            // needs no block allocation under atomic conditions.
            maps.pageset1_copy.set(pfn);
            maps.pageset1_copy.clear(pfn);
            maps.free.clear(pfn);
            self.allowance_pool.push(pfn);
        }
    }

    /// Re-run the pageset decisions without a zone walk, catching pages
    /// dirtied since classification. Runs once under atomic conditions
    /// (`tight`), where promoted pages draw on the pre-reserved allowance.
    pub fn recalculate<H: MemoryHost>(
        &mut self,
        host: &H,
        config: &EngineConfig,
        maps: &mut PageMaps,
        tight: bool,
    ) -> Result<()> {
        let moved: Vec<Pfn> = maps
            .pageset2
            .iter()
            .filter(|&pfn| !matches!(classify(host.page_kind(pfn), config), Class::Pageset2))
            .collect();

        for &pfn in &moved {
            maps.pageset2.clear(pfn);
            maps.pageset1.set(pfn);
            maps.resave.set(pfn);
            match self.allowance_pool.pop() {
                Some(copy) => maps.pageset1_copy.set(copy),
                None => {
                    return Err(SnapshotError::NoSpace);
                }
            }
        }

        self.extra_used = maps.pageset1.count().saturating_sub(self.initial_pageset1);
        if !tight && !moved.is_empty() {
            debug!(moved = moved.len(), "pages dirtied since classification");
        }

        if self.extra_used > config.extra_pages_allowance {
            return Err(SnapshotError::NoSpace);
        }
        Ok(())
    }

    /// Pageset-1 growth between the initial classification and the last
    /// recalculation.
    pub fn extra_pages_used(&self) -> u64 {
        self.extra_used
    }
}
