//! In-memory hosts for driving the engine in tests: a zone-structured
//! physical memory and a call-recording, failure-injectable platform.

use std::collections::{HashMap, HashSet};

use cryo_mem::{Pfn, PAGE_SIZE};

use crate::host::{MemoryHost, PageKind, Zone, ZoneKind};
use crate::platform::{Platform, SnapshotSide, SuspendPhase};
use crate::{Result, SnapshotError};

struct PageState {
    kind: PageKind,
    data: Box<[u8; PAGE_SIZE]>,
}

/// Zone-structured emulated physical memory.
pub struct TestHost {
    zones: Vec<Zone>,
    pages: HashMap<Pfn, PageState>,
    invalid: HashSet<Pfn>,
    /// Page-cache pages converted to `Unused` per `shrink_memory` call.
    shrink_yield: u64,
}

impl TestHost {
    /// Build a host from `(start_pfn, end_pfn, kind)` zone triples. Every
    /// valid frame starts as `Unused` and zero-filled.
    pub fn new(zones: &[(u64, u64, ZoneKind)]) -> Self {
        let zones: Vec<Zone> = zones
            .iter()
            .map(|&(start_pfn, end_pfn, kind)| Zone {
                start_pfn,
                end_pfn,
                kind,
            })
            .collect();
        let mut pages = HashMap::new();
        for zone in &zones {
            for pfn in zone.start_pfn..zone.end_pfn {
                pages.insert(
                    pfn,
                    PageState {
                        kind: PageKind::Unused,
                        data: Box::new([0u8; PAGE_SIZE]),
                    },
                );
            }
        }
        Self {
            zones,
            pages,
            invalid: HashSet::new(),
            shrink_yield: 0,
        }
    }

    /// A single normal zone `[0, pages)`.
    pub fn flat(pages: u64) -> Self {
        Self::new(&[(0, pages, ZoneKind::Normal)])
    }

    pub fn set_kind(&mut self, pfn: Pfn, kind: PageKind) {
        self.pages
            .get_mut(&pfn)
            .unwrap_or_else(|| panic!("pfn {pfn} outside zones"))
            .kind = kind;
    }

    pub fn set_kind_range(&mut self, start: Pfn, end: Pfn, kind: PageKind) {
        for pfn in start..end {
            self.set_kind(pfn, kind);
        }
    }

    pub fn kind(&self, pfn: Pfn) -> PageKind {
        self.pages[&pfn].kind
    }

    /// Punch an MMIO-style hole: the frame stays inside its zone but
    /// `pfn_valid` is false.
    pub fn mark_invalid(&mut self, pfn: Pfn) {
        self.invalid.insert(pfn);
        self.pages.remove(&pfn);
    }

    pub fn fill_page(&mut self, pfn: Pfn, fill: impl Fn(usize) -> u8) {
        let page = self
            .pages
            .get_mut(&pfn)
            .unwrap_or_else(|| panic!("pfn {pfn} outside zones"));
        for (i, b) in page.data.iter_mut().enumerate() {
            *b = fill(i);
        }
    }

    pub fn page(&self, pfn: Pfn) -> &[u8; PAGE_SIZE] {
        &self.pages[&pfn].data
    }

    pub fn set_shrink_yield(&mut self, pages_per_call: u64) {
        self.shrink_yield = pages_per_call;
    }
}

impl MemoryHost for TestHost {
    fn zones(&self) -> Vec<Zone> {
        self.zones.clone()
    }

    fn pfn_valid(&self, pfn: Pfn) -> bool {
        self.pages.contains_key(&pfn)
    }

    fn page_kind(&self, pfn: Pfn) -> PageKind {
        self.pages[&pfn].kind
    }

    fn read_page(&self, pfn: Pfn, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let page = self
            .pages
            .get(&pfn)
            .ok_or(SnapshotError::Corrupt("read of invalid pfn"))?;
        buf.copy_from_slice(&page.data[..]);
        Ok(())
    }

    fn write_page(&mut self, pfn: Pfn, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let page = self
            .pages
            .get_mut(&pfn)
            .ok_or(SnapshotError::Corrupt("write of invalid pfn"))?;
        page.data.copy_from_slice(buf);
        Ok(())
    }

    fn shrink_memory(&mut self) -> u64 {
        let mut freed = 0u64;
        if self.shrink_yield == 0 {
            return 0;
        }
        let candidates: Vec<Pfn> = self
            .pages
            .iter()
            .filter(|(_, p)| p.kind == PageKind::PageCache)
            .map(|(&pfn, _)| pfn)
            .take(self.shrink_yield as usize)
            .collect();
        for pfn in candidates {
            self.set_kind(pfn, PageKind::Unused);
            freed += 1;
        }
        freed
    }
}

/// Call-recording platform with injectable refusals.
///
/// Every hook appends its name (device phases suffixed `:1`/`:2`) to the
/// call log; a name in the failure set makes that hook refuse.
#[derive(Default)]
pub struct TestPlatform {
    calls: Vec<String>,
    fail_on: HashSet<String>,
    pm_busy: bool,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named hook refuse from now on.
    pub fn fail_on(&mut self, call: &str) {
        self.fail_on.insert(call.to_owned());
    }

    /// Simulate another PM operation holding the mutex.
    pub fn set_pm_busy(&mut self, busy: bool) {
        self.pm_busy = busy;
    }

    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.iter().any(|c| c == name)
    }

    /// The slice of calls recorded after the last occurrence of `marker`.
    pub fn calls_after(&self, marker: &str) -> &[String] {
        match self.calls.iter().rposition(|c| c == marker) {
            Some(at) => &self.calls[at + 1..],
            None => &self.calls[..],
        }
    }

    fn hook(&mut self, name: &str) -> Result<()> {
        self.calls.push(name.to_owned());
        if self.fail_on.contains(name) {
            return Err(SnapshotError::Refused { step: "platform" });
        }
        Ok(())
    }

    fn note(&mut self, name: &str) {
        self.calls.push(name.to_owned());
    }
}

impl Platform for TestPlatform {
    fn try_pm_mutex(&mut self) -> bool {
        self.note("try_pm_mutex");
        !self.pm_busy
    }

    fn release_pm_mutex(&mut self) {
        self.note("release_pm_mutex");
    }

    fn freeze_tasks(&mut self) -> Result<()> {
        self.hook("freeze_tasks")
    }

    fn thaw_tasks(&mut self) {
        self.note("thaw_tasks");
    }

    fn platform_begin(&mut self) -> Result<()> {
        self.hook("platform_begin")
    }

    fn platform_end(&mut self) {
        self.note("platform_end");
    }

    fn suspend_console(&mut self) -> Result<()> {
        self.hook("suspend_console")
    }

    fn resume_console(&mut self) {
        self.note("resume_console");
    }

    fn suspend_devices(&mut self, phase: SuspendPhase) -> Result<()> {
        match phase {
            SuspendPhase::One => self.hook("suspend_devices:1"),
            SuspendPhase::Two => self.hook("suspend_devices:2"),
        }
    }

    fn resume_devices(&mut self, phase: SuspendPhase) {
        match phase {
            SuspendPhase::One => self.note("resume_devices:1"),
            SuspendPhase::Two => self.note("resume_devices:2"),
        }
    }

    fn arch_prepare(&mut self) -> Result<()> {
        self.hook("arch_prepare")
    }

    fn arch_cleanup(&mut self) {
        self.note("arch_cleanup");
    }

    fn pm_lock(&mut self) -> Result<()> {
        self.hook("pm_lock")
    }

    fn pm_unlock(&mut self) {
        self.note("pm_unlock");
    }

    fn disable_nonboot_cpus(&mut self) -> Result<()> {
        self.hook("disable_nonboot_cpus")
    }

    fn enable_nonboot_cpus(&mut self) {
        self.note("enable_nonboot_cpus");
    }

    fn irq_disable(&mut self) {
        self.note("irq_disable");
    }

    fn irq_enable(&mut self) {
        self.note("irq_enable");
    }

    fn power_down_devices(&mut self) -> Result<()> {
        self.hook("power_down_devices")
    }

    fn power_up_devices(&mut self) {
        self.note("power_up_devices");
    }

    fn save_cpu_context(&mut self) -> Result<()> {
        self.hook("save_cpu_context")
    }

    fn snapshot_jump(
        &mut self,
        post_context_save: &mut dyn FnMut() -> Result<()>,
    ) -> Result<SnapshotSide> {
        self.hook("snapshot_jump")?;
        post_context_save()?;
        Ok(SnapshotSide::Snapshotting)
    }

    fn restore_jump(&mut self, copyback: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.hook("restore_jump")?;
        copyback()
    }

    fn power_off(&mut self) -> Result<()> {
        self.hook("power_off")
    }

    fn reboot(&mut self) -> Result<()> {
        self.hook("reboot")
    }

    fn cpu_count(&self) -> u32 {
        4
    }

    fn os_version(&self) -> &str {
        "6.1.0-cryo"
    }

    fn root_device(&self) -> u32 {
        0x0801
    }
}
