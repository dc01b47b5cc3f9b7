use std::sync::Arc;
use std::time::Instant;

use cryo_mem::{Pfn, RestoreList, PAGE_SIZE};
use cryo_storage::IoDir;
use tracing::{debug, info, warn};

use crate::atomic::{self, AtomicStage};
use crate::classify::Classifier;
use crate::config::EngineConfig;
use crate::header::{
    self, ImageHeader, ImageInfo, FIXED_RECORD_LEN,
};
use crate::host::{MemoryHost, PageKind, ZoneKind};
use crate::maps::PageMaps;
use crate::module::{ImagePresence, ModuleRegistry, StreamKind, Writer as _};
use crate::pipeline::Pipeline;
use crate::platform::{Platform, SnapshotSide};
use crate::result::{AbortFlag, CycleResult, CycleState};
use crate::stats::IoStats;
use crate::{Result, SnapshotError};

/// Slack added to the computed header size before reserving header pages;
/// covers extent-count drift from the header reservation itself and from
/// pages the in-atomic recalculation promotes into pageset-1.
const HEADER_SLACK_BYTES: usize = PAGE_SIZE;

/// The hibernate/resume cycle controller. All engine state lives here;
/// [`hibernate`](Engine::hibernate) and [`resume`](Engine::resume) are the
/// only external entry points.
pub struct Engine<H: MemoryHost, P: Platform> {
    host: H,
    platform: P,
    registry: ModuleRegistry,
    config: EngineConfig,
    maps: PageMaps,
    classifier: Classifier,
    state: CycleState,
    result: CycleResult,
    abort: Arc<AbortFlag>,
    restore_list: RestoreList,
    stats: IoStats,
    /// Which side of the snapshot jump we are on; gates the powerdown
    /// step.
    in_hibernate: bool,
    /// Non-boot CPUs were taken down outside the atomic region and need
    /// re-enabling at cleanup.
    cpus_down: bool,
    /// Pageset-2 has been written this cycle; a later save failure must
    /// reload it.
    pageset2_written: bool,
    /// Pageset-2 membership at stream-write time, in stream order. The
    /// in-atomic recalculation may promote members into pageset-1
    /// afterwards; the stream and header keep describing this list, and
    /// the pageset-1 copyback overwrites any page promoted late.
    ps2_targets: Vec<Pfn>,
    /// Per-page CRCs of pageset-1 taken just before the atomic region.
    ps1_crcs: Vec<(Pfn, u32)>,
}

impl<H: MemoryHost, P: Platform> Engine<H, P> {
    pub fn new(host: H, platform: P, config: EngineConfig) -> Self {
        Self {
            host,
            platform,
            registry: ModuleRegistry::new(),
            config,
            maps: PageMaps::new(),
            classifier: Classifier::new(),
            state: CycleState::empty(),
            result: CycleResult::empty(),
            abort: Arc::new(AbortFlag::new()),
            restore_list: RestoreList::new(),
            stats: IoStats::default(),
            in_hibernate: false,
            cpus_down: false,
            pageset2_written: false,
            ps2_targets: Vec::new(),
            ps1_crcs: Vec::new(),
        }
    }

    pub fn registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn maps(&self) -> &PageMaps {
        &self.maps
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn result(&self) -> CycleResult {
        self.result
    }

    pub fn io_stats(&self) -> IoStats {
        self.stats
    }

    /// Handle modules and outside observers use to abort the cycle.
    pub fn abort_handle(&self) -> Arc<AbortFlag> {
        Arc::clone(&self.abort)
    }

    /// Per-module diagnostic lines (compression ratios, reservations).
    pub fn debug_info(&self) -> String {
        self.registry.print_debug_info()
    }

    fn fail(&mut self, bits: CycleResult) -> SnapshotError {
        self.result |= bits | CycleResult::ABORTED;
        SnapshotError::Aborted
    }

    fn check_abort(&mut self) -> Result<()> {
        if self.abort.is_set() {
            self.result |= self.abort.get();
            return Err(SnapshotError::Aborted);
        }
        Ok(())
    }

    // ----- hibernate ----------------------------------------------------

    /// Run a full hibernation cycle. Returns the accumulated result bits;
    /// an empty set (or `KEPT_IMAGE` alone) is success.
    pub fn hibernate(&mut self) -> CycleResult {
        self.begin_cycle();
        if !self.platform.try_pm_mutex() {
            self.result = CycleResult::PM_SEM | CycleResult::ABORTED;
            return self.result;
        }
        let outcome = self.hibernate_inner();
        self.finish_cycle(outcome);
        self.platform.release_pm_mutex();
        self.result
    }

    fn begin_cycle(&mut self) {
        self.result = CycleResult::empty();
        self.state = CycleState::empty();
        self.abort.clear();
        self.stats = IoStats::default();
        self.in_hibernate = false;
        self.pageset2_written = false;
        self.ps2_targets.clear();
        self.ps1_crcs.clear();
        self.restore_list.clear();
    }

    fn finish_cycle(&mut self, outcome: Result<()>) {
        if let Err(e) = outcome {
            if !self.result.is_failure() {
                self.result |= CycleResult::ABORTED;
            }
            warn!(error = %e, "cycle unwound early");
        }
        self.result |= self.abort.get();

        // do_cleanup: torn down regardless of outcome.
        self.registry.cleanup_all(true);
        self.maps.clear_all();
        self.restore_list.clear();
        self.classifier = Classifier::new();
        if self.state.contains(CycleState::FROZEN) {
            self.platform.thaw_tasks();
            self.state -= CycleState::FROZEN;
        }
        if self.cpus_down {
            self.platform.enable_nonboot_cpus();
            self.cpus_down = false;
        }
    }

    fn can_hibernate(&mut self) -> Result<String> {
        let spec = self
            .config
            .resume
            .clone()
            .ok_or_else(|| self.fail(CycleResult::CANT_SUSPEND))?;
        if self
            .registry
            .activate_writer_for(&spec, false)
            .is_err()
        {
            return Err(self.fail(CycleResult::CANT_SUSPEND));
        }
        Ok(spec)
    }

    fn hibernate_inner(&mut self) -> Result<()> {
        self.can_hibernate()?;

        if !self.config.late_cpu_hotplug {
            if self.platform.disable_nonboot_cpus().is_err() {
                return Err(self.fail(CycleResult::CPU_HOTPLUG_FAILED));
            }
            self.cpus_down = true;
        }

        if self.platform.freeze_tasks().is_err() {
            return Err(self.fail(CycleResult::CANT_SUSPEND));
        }
        self.state |= CycleState::FROZEN;
        info!("tasks frozen");

        self.registry.initialise_all(true)?;
        self.state |= CycleState::INITIALISED;

        // An image the user chose to keep bypasses reclassification and
        // goes straight to powerdown.
        if self.config.keep_image {
            let writer = self.registry.active_writer_mut()?;
            if matches!(writer.image_exists()?, ImagePresence::Ours(_)) {
                info!("keeping stored image, skipping straight to powerdown");
                self.result |= CycleResult::KEPT_IMAGE;
                self.in_hibernate = true;
                return self.do_powerdown();
            }
        }

        // Prepare the image: classify and reserve.
        self.prepare_image()?;
        self.check_abort()?;

        if self.config.freezer_test {
            info!("freezer test passed, skipping image write");
            return Ok(());
        }
        if self.config.test_bio || self.config.test_filter_speed {
            info!("benchmark mode, skipping image write");
            return Ok(());
        }

        // Save the image.
        if let Err(e) = self.save_image() {
            if self.pageset2_written {
                self.reload_pageset2_or_panic();
            }
            if !self.result.is_failure() {
                self.result |= CycleResult::FAILED_IO | CycleResult::ABORTED;
            }
            return Err(e);
        }

        // Powerdown happens on the hibernate side only; the resume side's return
        // from the snapshot jump goes straight to post-copyback unwinding.
        if self.in_hibernate {
            self.do_powerdown()?;
        }
        Ok(())
    }

    fn prepare_image(&mut self) -> Result<()> {
        let stats = match self
            .classifier
            .prepare_image(&mut self.host, &self.config, &mut self.maps)
        {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "image preparation failed");
                return Err(self.fail(CycleResult::CANT_SUSPEND));
            }
        };

        if self.config.freezer_test || self.config.test_filter_speed {
            // Nothing will be written; no reservation needed.
            return Ok(());
        }

        let payload = stats.pageset1 + stats.pageset2;
        // Filters may grow a record by a small trailer (checksums); budget
        // sixteen bytes per page on top of the allocator's own metadata.
        let framing = (payload * 16).div_ceil(PAGE_SIZE as u64);
        let ask = (payload * self.registry.expected_compression() as u64).div_ceil(100)
            + self.registry.storage_needed()
            + framing;

        let reserve = |engine: &mut Self, header_pages: u64, ask: u64| -> Result<()> {
            let writer = engine.registry.active_writer_mut()?;
            if header_pages > 0 {
                writer.allocate_header_space(header_pages)?;
            }
            writer.allocate_storage(ask)
        };

        if let Err(e) = reserve(self, 0, ask) {
            warn!(error = %e, "storage reservation failed");
            return Err(self.fail(CycleResult::CANT_SUSPEND));
        }

        // Header sizing needs the final pagedir shapes and the writer's
        // chains, so it follows the main reservation; the top-up below is
        // small.
        let header_pages = self.estimate_header_pages()?;
        if let Err(e) = reserve(self, header_pages, ask) {
            warn!(error = %e, "header reservation failed");
            return Err(self.fail(CycleResult::CANT_SUSPEND));
        }
        debug!(
            payload,
            ask,
            header_pages,
            "storage reserved for image"
        );
        Ok(())
    }

    fn estimate_header_pages(&mut self) -> Result<u64> {
        let chain1 = header::bitmap_to_chain(&self.maps.pageset1)?;
        let chain2 = header::bitmap_to_chain(&self.maps.pageset2)?;
        let mut area = Vec::new();
        self.registry.save_all_config(&mut area)?;
        let bytes = FIXED_RECORD_LEN
            + chain1.serialized_len()
            + chain2.serialized_len()
            + area.len()
            + HEADER_SLACK_BYTES;
        Ok((bytes as u64).div_ceil(PAGE_SIZE as u64))
    }

    fn save_image(&mut self) -> Result<()> {
        // Pageset-2 first: those pages are quiescent already and must be
        // on disk before the atomic region constrains us.
        self.write_stream(StreamKind::Pageset2)?;
        self.pageset2_written = true;
        self.check_abort()?;

        self.compute_ps1_crcs()?;

        self.state |= CycleState::ATOMIC;
        let late = self.config.late_cpu_hotplug;
        if let Err(bits) = atomic::go_atomic(&mut self.platform, true, late) {
            self.state -= CycleState::ATOMIC;
            return Err(self.fail(bits));
        }

        if self.platform.save_cpu_context().is_err() {
            atomic::end_atomic(&mut self.platform, AtomicStage::DevicePowerUp, true, late);
            self.state -= CycleState::ATOMIC;
            return Err(self.fail(CycleResult::PRE_SNAPSHOT_FAILED));
        }

        let side = {
            let host = &mut self.host;
            let maps = &mut self.maps;
            let classifier = &mut self.classifier;
            let config = &self.config;
            let crcs = &self.ps1_crcs;
            let mut post_context_save = || -> Result<()> {
                // Catch pages dirtied since classification, then copy.
                classifier
                    .recalculate(host, config, maps, true)
                    .map_err(|_| SnapshotError::NoSpace)?;
                atomic::copy_pageset1(host, maps)?;
                verify_copies(host, maps, crcs)
            };
            self.platform.snapshot_jump(&mut post_context_save)
        };
        self.state -= CycleState::ATOMIC;

        let side = match side {
            Ok(side) => side,
            Err(e) => {
                atomic::end_atomic(&mut self.platform, AtomicStage::DevicePowerUp, true, late);
                let bits = match e {
                    SnapshotError::NoSpace => CycleResult::EXTRA_PAGES_ALLOW_TOO_SMALL,
                    _ => CycleResult::PRE_SNAPSHOT_FAILED,
                };
                return Err(self.fail(bits));
            }
        };

        match side {
            SnapshotSide::Snapshotting => {
                self.in_hibernate = true;
                atomic::end_atomic(&mut self.platform, AtomicStage::DevicePowerUp, true, late);
                info!(
                    extra_pages = self.classifier.extra_pages_used(),
                    "snapshot taken"
                );
                self.write_stream(StreamKind::Pageset1)?;
                self.write_header()?;
                self.state |= CycleState::IMAGE_WRITTEN;
                Ok(())
            }
            SnapshotSide::Resuming => {
                // We are the restored kernel, re-entering just past the
                // snapshot jump. Unwind and let cleanup thaw everything.
                self.in_hibernate = false;
                atomic::end_atomic(&mut self.platform, AtomicStage::DevicePowerUp, true, late);
                info!("execution resumed inside restored kernel");
                Ok(())
            }
        }
    }

    /// Stream one pageset through the pipeline. Pageset-2 streams the
    /// pages themselves; pageset-1 streams the atomic copies.
    fn write_stream(&mut self, stream: StreamKind) -> Result<u64> {
        let started = Instant::now();
        let source: Vec<Pfn> = match stream {
            StreamKind::Pageset2 => {
                self.ps2_targets = self.maps.pageset2.iter().collect();
                self.ps2_targets.clone()
            }
            StreamKind::Pageset1 => self.maps.pageset1_copy.iter().collect(),
        };

        let (filters, writer) = self.registry.pipeline_parts()?;
        let mut pipeline = Pipeline::new(filters, writer);
        pipeline.rw_init(IoDir::Write, stream)?;

        let mut buf = [0u8; PAGE_SIZE];
        let mut index = 0u64;
        for pfn in source {
            self.maps.io.set(pfn);
            self.host.read_page(pfn, &mut buf)?;
            pipeline.write_page(index, &buf)?;
            self.maps.io.clear(pfn);
            index += 1;
            if self.abort.is_set() {
                return Err(SnapshotError::Aborted);
            }
        }
        pipeline.rw_cleanup(IoDir::Write, stream)?;
        self.stats.account_write(index, started);
        debug!(?stream, pages = index, "pageset written");
        Ok(index)
    }

    fn write_header(&mut self) -> Result<()> {
        let chain1 = header::bitmap_to_chain(&self.maps.pageset1)?;
        // The pageset-2 descriptor matches the stream as written, not the
        // post-recalculation classification.
        let mut chain2 = cryo_storage::ExtentChain::new();
        for &pfn in &self.ps2_targets {
            chain2.append_value(pfn).map_err(SnapshotError::Storage)?;
        }

        let record = ImageHeader {
            os_version: self.platform.os_version().to_owned(),
            page_count: self.total_valid_pages(),
            cpu_count: self.platform.cpu_count(),
            page_size: PAGE_SIZE as u32,
            pageset2_size: self.ps2_targets.len() as u64,
            policy: [
                self.config.image_size_limit,
                self.config.extra_pages_allowance as i64,
                self.registry.expected_compression() as i64,
                self.config.no_pageset2 as i64,
                self.config.full_pageset2 as i64,
                0,
            ],
            io_stats: self.stats.as_header_fields(),
            pagedir1_size: self.maps.pageset1.count(),
            root_dev: self.platform.root_device(),
        };
        let mut fixed = Vec::with_capacity(FIXED_RECORD_LEN);
        record.write_to(&mut fixed)?;

        let mut area = Vec::new();
        self.registry.save_all_config(&mut area)?;

        let writer = self.registry.active_writer_mut()?;
        writer.write_header_init()?;
        writer.header_write(&fixed)?;
        header::write_chain(writer, &chain1)?;
        header::write_chain(writer, &chain2)?;
        writer.header_write(&area)?;
        writer.write_header_cleanup()?;
        Ok(())
    }

    fn total_valid_pages(&self) -> u64 {
        self.host
            .zones()
            .iter()
            .map(|z| (z.start_pfn..z.end_pfn).filter(|&p| self.host.pfn_valid(p)).count() as u64)
            .sum()
    }

    fn compute_ps1_crcs(&mut self) -> Result<()> {
        self.ps1_crcs.clear();
        let mut buf = [0u8; PAGE_SIZE];
        for pfn in self.maps.pageset1.iter() {
            self.host.read_page(pfn, &mut buf)?;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf);
            self.ps1_crcs.push((pfn, hasher.finalize()));
        }
        Ok(())
    }

    fn reload_pageset2_or_panic(&mut self) {
        info!("reloading pageset-2 after failed save");
        let targets = self.ps2_targets.clone();
        if let Err(e) = self.read_stream(StreamKind::Pageset2, &targets) {
            // Live memory is inconsistent; there is nothing safer to do.
            panic!("pageset-2 reload failed ({e}); memory is inconsistent");
        }
    }

    fn do_powerdown(&mut self) -> Result<()> {
        let outcome = if self.config.reboot {
            info!("image written, rebooting");
            self.platform.reboot()
        } else {
            info!("image written, powering off");
            self.platform.power_off()
        };
        outcome.map_err(|_| self.fail(CycleResult::ABORTED))
    }

    // ----- resume -------------------------------------------------------

    /// Look for an image and, if one is ours, restore it. With no image
    /// present the result is empty and boot continues normally.
    pub fn resume(&mut self) -> CycleResult {
        self.begin_cycle();
        if !self.platform.try_pm_mutex() {
            self.result = CycleResult::PM_SEM | CycleResult::ABORTED;
            return self.result;
        }
        let outcome = self.resume_inner();
        self.finish_cycle(outcome);
        self.platform.release_pm_mutex();
        self.result
    }

    /// Probe the configured location, then the alternate
    /// one, for an image of ours.
    fn find_image(&mut self) -> Result<Option<cryo_storage::ImageSignature>> {
        let specs: Vec<String> = [self.config.resume.clone(), self.config.alt_resume.clone()]
            .into_iter()
            .flatten()
            .collect();
        for (i, spec) in specs.iter().enumerate() {
            if i > 0 {
                info!(spec = %spec, "trying alternate image location");
            }
            if self.registry.activate_writer_for(spec, true).is_err() {
                continue;
            }
            let writer = self.registry.active_writer_mut()?;
            match writer.image_exists()? {
                ImagePresence::Ours(sig) => return Ok(Some(sig)),
                ImagePresence::Foreign(_) => {
                    // Identified and declined; read_signature already
                    // logged who owns it.
                }
                ImagePresence::PlainSwap | ImagePresence::None => {}
            }
            self.registry.deactivate_writer();
        }
        Ok(None)
    }

    fn resume_inner(&mut self) -> Result<()> {
        let sig = match self.find_image()? {
            Some(sig) => sig,
            None => {
                debug!("no image to resume");
                return Ok(());
            }
        };
        self.state |= CycleState::IMAGE_EXISTS | CycleState::NOW_RESUMING;

        if sig.resume_attempted {
            warn!("image was already the subject of a resume attempt, not touching it");
            return Err(self.fail(CycleResult::ABORTED));
        }

        self.registry.initialise_all(true)?;
        self.state |= CycleState::INITIALISED;

        let header = match self.read_header() {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "image header unusable");
                return Err(self.fail(CycleResult::PRE_RESTORE_FAILED));
            }
        };

        {
            let writer = self.registry.active_writer_mut()?;
            writer.mark_resume_attempted(true)?;
        }
        self.state |= CycleState::RESUME_ATTEMPTED;

        // Pageset-2 streams straight over live memory; those pages were
        // quiescent when captured and their owners are not running yet.
        let ps2_targets: Vec<Pfn> = self.maps.pageset2.iter().collect();
        if ps2_targets.len() as u64 != header.pageset2_size {
            return Err(self.fail(CycleResult::PRE_RESTORE_FAILED));
        }
        if let Err(e) = self.read_stream(StreamKind::Pageset2, &ps2_targets) {
            panic!("hibernation image is unusable ({e}); reboot without resume=");
        }

        if self.platform.freeze_tasks().is_err() {
            return Err(self.fail(CycleResult::CANT_SUSPEND));
        }
        self.state |= CycleState::FROZEN;

        // Load pageset-1: scratch pages, restore list, then the stream.
        let ps1_targets = match self.build_restore_scratch(header.pagedir1_size) {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "cannot stage pageset-1 copy");
                return Err(self.fail(CycleResult::PRE_RESTORE_FAILED));
            }
        };
        if let Err(e) = self.read_stream(StreamKind::Pageset1, &ps1_targets) {
            panic!("hibernation image is unusable ({e}); reboot without resume=");
        }

        // The atomic restore.
        let late = self.config.late_cpu_hotplug;
        if let Err(bits) = atomic::go_atomic(&mut self.platform, false, late) {
            return Err(self.fail(bits));
        }
        if self.platform.save_cpu_context().is_err() {
            atomic::end_atomic(&mut self.platform, AtomicStage::DevicePowerUp, false, late);
            return Err(self.fail(CycleResult::PRE_RESTORE_FAILED));
        }

        let jump = {
            let host = &mut self.host;
            let list = &self.restore_list;
            let mut copyback = || -> Result<()> {
                atomic::copyback(host, list.normal())?;
                atomic::copyback(host, list.highmem())
            };
            self.platform.restore_jump(&mut copyback)
        };
        if jump.is_err() {
            atomic::end_atomic(&mut self.platform, AtomicStage::DevicePowerUp, false, late);
            return Err(self.fail(CycleResult::PRE_RESTORE_FAILED));
        }

        // On real hardware the jump does not return; from here on we model
        // the restored kernel unwinding out of its own atomic region.
        atomic::end_atomic(&mut self.platform, AtomicStage::DevicePowerUp, false, late);
        info!("memory restored, execution back in captured kernel");

        let keep = self.config.keep_image;
        let writer = self.registry.active_writer_mut()?;
        if keep {
            writer.mark_resume_attempted(false)?;
            self.result |= CycleResult::KEPT_IMAGE;
        } else {
            writer.remove_image()?;
        }
        Ok(())
    }

    fn read_header(&mut self) -> Result<ImageHeader> {
        let writer = self.registry.active_writer_mut()?;
        writer.read_header_init()?;
        let mut fixed = [0u8; FIXED_RECORD_LEN];
        writer.header_read(&mut fixed)?;
        let record = ImageHeader::parse(&fixed)?;
        let chain1 = header::read_chain(writer)?;
        let chain2 = header::read_chain(writer)?;
        let area = header::read_module_area(writer)?;
        writer.read_header_cleanup()?;
        self.registry.load_all_config(&area)?;

        if chain1.size() != record.pagedir1_size || chain2.size() != record.pageset2_size {
            return Err(SnapshotError::Corrupt("pagedir sizes disagree with header"));
        }
        self.maps.pageset1 = header::chain_to_bitmap(&chain1);
        self.maps.pageset2 = header::chain_to_bitmap(&chain2);
        info!(
            pageset1 = record.pagedir1_size,
            pageset2 = record.pageset2_size,
            os = %record.os_version,
            "image header read"
        );
        Ok(record)
    }

    /// Pull one pageset back through the pipeline, placing record `i` at
    /// `targets[i]`. Indices are cross-checked against the stream.
    fn read_stream(&mut self, stream: StreamKind, targets: &[Pfn]) -> Result<()> {
        let started = Instant::now();
        let (filters, writer) = self.registry.pipeline_parts()?;
        let mut pipeline = Pipeline::new(filters, writer);
        pipeline.rw_init(IoDir::Read, stream)?;

        let mut out = Vec::with_capacity(PAGE_SIZE);
        let mut buf = [0u8; PAGE_SIZE];
        for expected in 0..targets.len() as u64 {
            let index = pipeline
                .read_page(&mut out)?
                .ok_or(SnapshotError::Corrupt("pageset stream truncated"))?;
            if index != expected {
                return Err(SnapshotError::Corrupt("pageset stream out of order"));
            }
            if out.len() != PAGE_SIZE {
                return Err(SnapshotError::Corrupt("restored record is not one page"));
            }
            buf.copy_from_slice(&out);
            self.host.write_page(targets[index as usize], &buf)?;
        }
        pipeline.rw_cleanup(IoDir::Read, stream)?;
        self.stats.account_read(targets.len() as u64, started);
        debug!(?stream, pages = targets.len(), "pageset read");
        Ok(())
    }

    /// Choose a scratch frame for every pageset-1 page and build the
    /// restore list. Scratch frames must collide with nothing the restore
    /// will touch.
    fn build_restore_scratch(&mut self, expected: u64) -> Result<Vec<Pfn>> {
        let origs: Vec<Pfn> = self.maps.pageset1.iter().collect();
        if origs.len() as u64 != expected {
            return Err(SnapshotError::Corrupt("pagedir-1 does not match header"));
        }

        let mut scratch = Vec::with_capacity(origs.len());
        'zones: for zone in self.host.zones() {
            for pfn in zone.start_pfn..zone.end_pfn {
                if scratch.len() == origs.len() {
                    break 'zones;
                }
                if !self.host.pfn_valid(pfn)
                    || self.host.page_kind(pfn) != PageKind::Unused
                    || self.maps.pageset1.test(pfn)
                    || self.maps.pageset2.test(pfn)
                {
                    continue;
                }
                scratch.push(pfn);
            }
        }
        if scratch.len() != origs.len() {
            return Err(SnapshotError::NoSpace);
        }

        self.maps.pageset1_copy.clear_all();
        self.restore_list.clear();
        let zones = self.host.zones();
        for (&orig, &copy) in origs.iter().zip(scratch.iter()) {
            self.maps.pageset1_copy.set(copy);
            let high = zones
                .iter()
                .any(|z| z.kind == ZoneKind::Highmem && (z.start_pfn..z.end_pfn).contains(&orig));
            if high {
                self.restore_list.push_highmem(orig, copy);
            } else {
                self.restore_list.push_normal(orig, copy);
            }
        }
        debug!(
            pages = origs.len(),
            highmem = self.restore_list.highmem().len(),
            "restore list staged"
        );
        Ok(scratch)
    }

    // ----- maintenance --------------------------------------------------

    /// Explicitly invalidate a stored image (the `remove_image` surface).
    pub fn remove_image(&mut self) -> Result<()> {
        let spec = self
            .config
            .resume
            .clone()
            .ok_or(SnapshotError::Config("no resume device configured".into()))?;
        self.registry.activate_writer_for(&spec, true)?;
        self.registry.active_writer_mut()?.remove_image()
    }

    /// Peek at the stored image without restoring anything.
    pub fn inspect(&mut self) -> Result<ImageInfo> {
        let spec = self
            .config
            .resume
            .clone()
            .ok_or(SnapshotError::Config("no resume device configured".into()))?;
        self.registry.activate_writer_for(&spec, true)?;
        let writer = self.registry.active_writer_mut()?;
        match writer.image_exists()? {
            ImagePresence::Ours(_) => {}
            _ => return Err(SnapshotError::Corrupt("no image of ours present")),
        }
        writer.read_header_init()?;
        let mut fixed = [0u8; FIXED_RECORD_LEN];
        writer.header_read(&mut fixed)?;
        let record = ImageHeader::parse(&fixed)?;
        let chain1 = header::read_chain(writer)?;
        let chain2 = header::read_chain(writer)?;
        let area = header::read_module_area(writer)?;
        let modules = header::module_names(&area)?;
        writer.read_header_cleanup()?;
        Ok(ImageInfo {
            header: record,
            pagedir1_extents: chain1.num_extents(),
            pagedir2_extents: chain2.num_extents(),
            modules,
        })
    }
}

/// Compare the atomic copies against the checksums taken just before the
/// atomic region. Pages promoted late (resave) have no recorded checksum
/// and are skipped.
fn verify_copies<H: MemoryHost>(
    host: &H,
    maps: &mut PageMaps,
    crcs: &[(Pfn, u32)],
) -> Result<()> {
    maps.pageset1.seek(0);
    maps.pageset1_copy.seek(0);
    let mut buf = [0u8; PAGE_SIZE];
    loop {
        let src = maps.pageset1.next_pfn();
        let dst = maps.pageset1_copy.next_pfn();
        if src == cryo_mem::PFN_END {
            return Ok(());
        }
        if maps.resave.test(src) {
            continue;
        }
        let Ok(slot) = crcs.binary_search_by_key(&src, |&(pfn, _)| pfn) else {
            continue;
        };
        host.read_page(dst, &mut buf)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        if hasher.finalize() != crcs[slot].1 {
            return Err(SnapshotError::Corrupt("pageset-1 changed under the snapshot"));
        }
    }
}
