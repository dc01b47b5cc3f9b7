use tracing::debug;

use crate::{
    ExtentChain, Result, StorageBackend, StorageError, PAGE_SIZE, SECTORS_PER_PAGE,
};
use crate::extent::{take_u32, take_u64};

/// One page-sized slot on one swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot {
    pub dev: usize,
    pub slot: u64,
}

/// The host's swap-slot interface: hand out free page slots one at a time,
/// take them back, and translate a slot to its starting sector.
///
/// Slots handed out for a given device must be ascending until the device's
/// slots are released again; that is the platform allocator's behavior and
/// the run-length chains rely on it.
pub trait SlotSource {
    fn device_count(&self) -> usize;

    /// Stable device id (`dev_t`) for signature and header use.
    fn device_id(&self, dev: usize) -> u32;

    fn get_slot(&mut self) -> Option<SwapSlot>;

    fn free_slot(&mut self, slot: SwapSlot);

    /// First sector of `slot` on device `dev`.
    fn slot_sector(&self, dev: usize, slot: u64) -> u64;
}

struct SwapDeviceState {
    id: u32,
    backend: Box<dyn StorageBackend>,
    used: Vec<bool>,
    scan_hint: u64,
}

/// In-memory model of the host's registered swap devices. Slot 0 of every
/// device holds the swap header (and our signature) and is never handed
/// out.
pub struct SwapSpace {
    devices: Vec<SwapDeviceState>,
    round_robin: bool,
    next_dev: usize,
}

impl SwapSpace {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            round_robin: false,
            next_dev: 0,
        }
    }

    /// Rotate slot handouts across devices, the way a host balances swap
    /// devices of equal priority.
    pub fn with_round_robin() -> Self {
        Self {
            round_robin: true,
            ..Self::new()
        }
    }

    pub fn add_device(&mut self, id: u32, backend: Box<dyn StorageBackend>) -> Result<usize> {
        let slots = backend.len()? / PAGE_SIZE as u64;
        if slots < 2 {
            return Err(StorageError::Unsupported("swap device smaller than two pages"));
        }
        let mut used = vec![false; slots as usize];
        used[0] = true; // signature page
        self.devices.push(SwapDeviceState {
            id,
            backend,
            used,
            scan_hint: 1,
        });
        Ok(self.devices.len() - 1)
    }

    pub fn backend_mut(&mut self, dev: usize) -> &mut dyn StorageBackend {
        &mut *self.devices[dev].backend
    }

    pub fn device_index_by_id(&self, id: u32) -> Option<usize> {
        self.devices.iter().position(|d| d.id == id)
    }

    pub fn free_slots(&self) -> u64 {
        self.devices
            .iter()
            .map(|d| d.used.iter().filter(|&&u| !u).count() as u64)
            .sum()
    }

    /// Mark a specific slot in use, e.g. when an existing image's
    /// reservation is adopted on resume.
    pub fn reserve_slot(&mut self, slot: SwapSlot) {
        let state = &mut self.devices[slot.dev];
        state.used[slot.slot as usize] = true;
    }

    fn take_from(&mut self, dev: usize) -> Option<SwapSlot> {
        let state = &mut self.devices[dev];
        let start = state.scan_hint as usize;
        for slot in start..state.used.len() {
            if !state.used[slot] {
                state.used[slot] = true;
                state.scan_hint = slot as u64 + 1;
                return Some(SwapSlot {
                    dev,
                    slot: slot as u64,
                });
            }
        }
        None
    }
}

impl Default for SwapSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotSource for SwapSpace {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_id(&self, dev: usize) -> u32 {
        self.devices[dev].id
    }

    fn get_slot(&mut self) -> Option<SwapSlot> {
        let count = self.devices.len();
        if count == 0 {
            return None;
        }
        if self.round_robin {
            for i in 0..count {
                let dev = (self.next_dev + i) % count;
                if let Some(slot) = self.take_from(dev) {
                    self.next_dev = (dev + 1) % count;
                    return Some(slot);
                }
            }
            None
        } else {
            (0..count).find_map(|dev| self.take_from(dev))
        }
    }

    fn free_slot(&mut self, slot: SwapSlot) {
        let state = &mut self.devices[slot.dev];
        state.used[slot.slot as usize] = false;
        state.scan_hint = state.scan_hint.min(slot.slot);
    }

    fn slot_sector(&self, dev: usize, slot: u64) -> u64 {
        let _ = dev;
        slot * SECTORS_PER_PAGE
    }
}

/// A contiguous run of pages on one device, in image-stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRun {
    pub dev: usize,
    pub start_sector: u64,
    pub pages: u64,
}

/// The physical layout of the logical image stream: an ordered list of
/// sector runs. Page `0` of the stream is the first page of the first run.
#[derive(Debug, Clone, Default)]
pub struct SectorMap {
    runs: Vec<SectorRun>,
}

impl SectorMap {
    pub fn runs(&self) -> &[SectorRun] {
        &self.runs
    }

    pub fn total_pages(&self) -> u64 {
        self.runs.iter().map(|r| r.pages).sum()
    }

    /// Device index and starting sector of stream page `page_index`.
    pub fn page_location(&self, page_index: u64) -> Result<(usize, u64)> {
        let mut base = 0u64;
        for run in &self.runs {
            if page_index < base + run.pages {
                let sector = run.start_sector + (page_index - base) * SECTORS_PER_PAGE;
                return Ok((run.dev, sector));
            }
            base += run.pages;
        }
        Err(StorageError::OutOfBounds {
            offset: page_index,
            len: 1,
            device_len: base,
        })
    }
}

/// Per-page metadata bytes the header stream carries for every image page:
/// an index (`u64`) plus a size (`u32`).
const PAGE_METADATA_BYTES: u64 = 12;

/// The swap-backed storage reservation: one slot chain per device plus the
/// header-page count, convertible to a [`SectorMap`] for I/O and
/// serializable into the image header for resume.
pub struct SwapAllocator {
    header_pages: u64,
    slot_chains: Vec<ExtentChain>,
}

impl SwapAllocator {
    pub fn new(device_count: usize) -> Self {
        Self {
            header_pages: 0,
            slot_chains: vec![ExtentChain::new(); device_count],
        }
    }

    /// Record how many pages at the head of the stream belong to the
    /// header. The slots themselves come from [`allocate`](Self::allocate).
    pub fn reserve_header(&mut self, pages: u64) {
        self.header_pages = pages;
    }

    pub fn header_pages(&self) -> u64 {
        self.header_pages
    }

    /// Pages of header metadata needed to describe `requested` image pages.
    pub fn metadata_overhead(requested: u64) -> u64 {
        (requested * PAGE_METADATA_BYTES).div_ceil(PAGE_SIZE as u64)
    }

    /// Pages currently reserved, header included.
    pub fn allocated(&self) -> u64 {
        self.slot_chains.iter().map(ExtentChain::size).sum()
    }

    pub fn slot_chains(&self) -> &[ExtentChain] {
        &self.slot_chains
    }

    /// Reserve enough slots to hold `requested` image pages plus their
    /// per-page metadata plus the header. Already-held reservation counts
    /// toward the target.
    ///
    /// On exhaustion the extent being accumulated is rolled back (its slots
    /// freed) and `NoSpace` is returned; everything reserved before it
    /// stays reserved for the caller to release or retry with.
    pub fn allocate(&mut self, swap: &mut dyn SlotSource, requested: u64) -> Result<()> {
        let extra = Self::metadata_overhead(requested);
        let target = requested + extra + self.header_pages;
        let mut last_dev = None;
        while self.allocated() < target {
            match swap.get_slot() {
                Some(SwapSlot { dev, slot }) => {
                    self.slot_chains[dev].append_value(slot)?;
                    last_dev = Some(dev);
                }
                None => {
                    if let Some(dev) = last_dev {
                        if let Some(partial) = self.slot_chains[dev].pop() {
                            for slot in partial.start..=partial.end {
                                swap.free_slot(SwapSlot { dev, slot });
                            }
                        }
                    }
                    debug!(
                        requested,
                        extra,
                        header = self.header_pages,
                        held = self.allocated(),
                        "swap exhausted before reservation target"
                    );
                    return Err(StorageError::NoSpace);
                }
            }
        }
        debug!(target, "storage reserved");
        Ok(())
    }

    /// Free every reserved slot.
    pub fn release(&mut self, swap: &mut dyn SlotSource) {
        for (dev, chain) in self.slot_chains.iter_mut().enumerate() {
            for slot in chain.iter() {
                swap.free_slot(SwapSlot { dev, slot });
            }
            chain.clear();
        }
    }

    /// Translate the reservation into sector runs, walking the per-device
    /// chains in device order and re-merging sectors that end up adjacent
    /// (slot numbers may jump while the underlying sectors do not).
    pub fn sector_map(&self, swap: &dyn SlotSource) -> SectorMap {
        let mut runs: Vec<SectorRun> = Vec::new();
        for (dev, chain) in self.slot_chains.iter().enumerate() {
            for extent in chain.extents() {
                for slot in extent.start..=extent.end {
                    let sector = swap.slot_sector(dev, slot);
                    match runs.last_mut() {
                        Some(run)
                            if run.dev == dev
                                && sector
                                    == run.start_sector + run.pages * SECTORS_PER_PAGE =>
                        {
                            run.pages += 1;
                        }
                        _ => runs.push(SectorRun {
                            dev,
                            start_sector: sector,
                            pages: 1,
                        }),
                    }
                }
            }
        }
        SectorMap { runs }
    }

    /// Device and sector of the first header page. The header must sit in
    /// one contiguous run so resume can find it from the signature alone.
    pub fn header_location(&self, swap: &dyn SlotSource) -> Result<(u32, u64)> {
        if self.header_pages == 0 {
            return Err(StorageError::Unsupported("no header space reserved"));
        }
        let map = self.sector_map(swap);
        let first = map
            .runs()
            .first()
            .ok_or(StorageError::Unsupported("no storage reserved"))?;
        if first.pages < self.header_pages {
            return Err(StorageError::Unsupported(
                "header space not contiguous on one device",
            ));
        }
        Ok((swap.device_id(first.dev), first.start_sector))
    }

    /// Serialize header-page count and the per-device chains.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(self.slot_chains.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.header_pages.to_le_bytes());
        for chain in &self.slot_chains {
            chain.write_to(out)?;
        }
        Ok(())
    }

    pub fn read_from(input: &mut &[u8]) -> Result<Self> {
        let devices = take_u32(input)? as usize;
        if devices > 256 {
            return Err(StorageError::Corrupt("implausible swap device count"));
        }
        let header_pages = take_u64(input)?;
        let mut slot_chains = Vec::with_capacity(devices);
        for _ in 0..devices {
            slot_chains.push(ExtentChain::read_from(input)?);
        }
        Ok(Self {
            header_pages,
            slot_chains,
        })
    }
}
