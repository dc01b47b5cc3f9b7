use cryo_mem::PAGE_SIZE;
use cryo_storage::{
    page_io, read_signature, restore_swap_signature, set_resume_attempted, write_image_signature,
    ImageSignature, IoDir, SectorMap, SignatureKind, SlotSource, StorageBackend, StorageError,
    SwapAllocator, SwapSlot, SwapSpace, SECTORS_PER_PAGE,
};
use tracing::{debug, info};

use crate::module::{ImagePresence, Module, ModuleKind, StreamKind, Writer};
use crate::{Result, SnapshotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    HeaderWrite,
    /// Header reads run before the slot chains are known; pages are
    /// located contiguously from the signature's header sector.
    HeaderRead,
    DataWrite,
    DataRead,
}

/// The swap-backed writer: maps the logical image byte stream onto
/// reserved swap slots, owns the signature in sector 0 of the resume
/// device, and serializes its slot chains into its header config blob.
pub struct SwapWriter {
    swap: SwapSpace,
    names: Vec<String>,
    allocator: SwapAllocator,
    map: Option<SectorMap>,
    resume_dev: Option<usize>,
    signature: Option<ImageSignature>,

    mode: Option<Mode>,
    buf: Box<[u8; PAGE_SIZE]>,
    buf_page: Option<u64>,
    buf_dirty: bool,
    header_pos: u64,
    data_pos: u64,
}

impl SwapWriter {
    pub fn new() -> Self {
        Self {
            swap: SwapSpace::new(),
            names: Vec::new(),
            allocator: SwapAllocator::new(0),
            map: None,
            resume_dev: None,
            signature: None,
            mode: None,
            buf: Box::new([0u8; PAGE_SIZE]),
            buf_page: None,
            buf_dirty: false,
            header_pos: 0,
            data_pos: 0,
        }
    }

    /// Round-robin slot handouts across devices (equal-priority swap).
    pub fn new_round_robin() -> Self {
        Self {
            swap: SwapSpace::with_round_robin(),
            ..Self::new()
        }
    }

    /// Register a swap device under the name `resume=` specs use.
    pub fn add_swap_device(
        &mut self,
        name: &str,
        id: u32,
        backend: Box<dyn StorageBackend>,
    ) -> Result<usize> {
        let idx = self.swap.add_device(id, backend)?;
        self.names.push(name.to_owned());
        self.allocator = SwapAllocator::new(self.swap.device_count());
        Ok(idx)
    }

    fn resume_backend(&mut self) -> Result<&mut dyn StorageBackend> {
        let dev = self
            .resume_dev
            .ok_or(SnapshotError::Config("no resume device selected".into()))?;
        Ok(self.swap.backend_mut(dev))
    }

    /// Absolute stream byte position of the active mode.
    fn cur_pos(&self) -> u64 {
        match self.mode {
            Some(Mode::HeaderWrite) | Some(Mode::HeaderRead) => self.header_pos,
            Some(Mode::DataWrite) | Some(Mode::DataRead) => {
                self.allocator.header_pages() * PAGE_SIZE as u64 + self.data_pos
            }
            None => 0,
        }
    }

    fn advance(&mut self, n: u64) {
        match self.mode {
            Some(Mode::HeaderWrite) | Some(Mode::HeaderRead) => self.header_pos += n,
            Some(Mode::DataWrite) | Some(Mode::DataRead) => self.data_pos += n,
            None => {}
        }
    }

    /// Locate stream page `page` on its device.
    fn page_sector(&self, page: u64) -> Result<(usize, u64)> {
        if self.mode == Some(Mode::HeaderRead) {
            let sig = self
                .signature
                .ok_or(SnapshotError::Corrupt("header read without signature"))?;
            let dev = self
                .swap
                .device_index_by_id(sig.header_dev)
                .ok_or(SnapshotError::Corrupt("signature names an unknown device"))?;
            return Ok((dev, u64::from(sig.header_sector) + page * SECTORS_PER_PAGE));
        }
        let map = self
            .map
            .as_ref()
            .ok_or(SnapshotError::Unsupported("no storage reserved"))?;
        Ok(map.page_location(page).map_err(SnapshotError::Storage)?)
    }

    fn flush_buf(&mut self) -> Result<()> {
        if self.buf_dirty {
            let page = self
                .buf_page
                .ok_or(SnapshotError::Corrupt("dirty buffer without a page"))?;
            let (dev, sector) = self.page_sector(page)?;
            page_io(IoDir::Write, self.swap.backend_mut(dev), sector, &mut self.buf)?;
            self.buf_dirty = false;
        }
        Ok(())
    }

    fn load_buf(&mut self, page: u64) -> Result<()> {
        if self.buf_page == Some(page) {
            return Ok(());
        }
        self.flush_buf()?;
        let (dev, sector) = self.page_sector(page)?;
        page_io(IoDir::Read, self.swap.backend_mut(dev), sector, &mut self.buf)?;
        self.buf_page = Some(page);
        Ok(())
    }

    fn stream_write(&mut self, mut bytes: &[u8]) -> Result<()> {
        if self.mode == Some(Mode::HeaderWrite) {
            let cap = self.allocator.header_pages() * PAGE_SIZE as u64;
            if self.header_pos + bytes.len() as u64 > cap {
                return Err(SnapshotError::Corrupt("header overruns its reservation"));
            }
        }
        while !bytes.is_empty() {
            let pos = self.cur_pos();
            let page = pos / PAGE_SIZE as u64;
            let off = (pos % PAGE_SIZE as u64) as usize;
            if self.buf_page != Some(page) {
                self.flush_buf()?;
                if off > 0 {
                    // Entering a page mid-way: preserve what is there.
                    let (dev, sector) = self.page_sector(page)?;
                    page_io(IoDir::Read, self.swap.backend_mut(dev), sector, &mut self.buf)?;
                } else {
                    self.buf.fill(0);
                }
                self.buf_page = Some(page);
            }
            let n = (PAGE_SIZE - off).min(bytes.len());
            self.buf[off..off + n].copy_from_slice(&bytes[..n]);
            self.buf_dirty = true;
            self.advance(n as u64);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn stream_read(&mut self, out: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < out.len() {
            let pos = self.cur_pos();
            let page = pos / PAGE_SIZE as u64;
            let off = (pos % PAGE_SIZE as u64) as usize;
            self.load_buf(page)?;
            let n = (PAGE_SIZE - off).min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.buf[off..off + n]);
            self.advance(n as u64);
            done += n;
        }
        Ok(())
    }

    fn reset_stream(&mut self) {
        self.mode = None;
        self.buf_page = None;
        self.buf_dirty = false;
        self.header_pos = 0;
        self.data_pos = 0;
    }
}

impl Default for SwapWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for SwapWriter {
    fn name(&self) -> &'static str {
        "swapwriter"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::WRITER
    }

    fn initialise(&mut self, starting_cycle: bool) -> Result<()> {
        if starting_cycle {
            self.reset_stream();
        }
        Ok(())
    }

    fn save_config_info(&self, out: &mut Vec<u8>) {
        // The slot chains are the writer's config: resume rebuilds the
        // stream layout from them.
        let _ = self.allocator.write_to(out);
    }

    fn load_config_info(&mut self, mut data: &[u8]) -> Result<()> {
        let allocator = SwapAllocator::read_from(&mut data)?;
        if !data.is_empty() {
            return Err(SnapshotError::Corrupt("trailing bytes in writer config"));
        }
        // Adopt the image's reservation so nothing else lands on it.
        for (dev, chain) in allocator.slot_chains().iter().enumerate() {
            if dev >= self.swap.device_count() {
                return Err(SnapshotError::Corrupt("image references missing swap device"));
            }
            for slot in chain.iter() {
                self.swap.reserve_slot(SwapSlot { dev, slot });
            }
        }
        self.map = Some(allocator.sector_map(&self.swap));
        self.allocator = allocator;
        debug!(pages = self.allocator.allocated(), "image reservation adopted");
        Ok(())
    }

    fn print_debug_info(&self, out: &mut String) {
        use std::fmt::Write as _;
        let _ = writeln!(
            out,
            "swapwriter: {} pages reserved on {} devices",
            self.allocator.allocated(),
            self.swap.device_count()
        );
    }
}

impl Writer for SwapWriter {
    fn parse_sig_location(&mut self, spec: &str, only_writer: bool, quiet: bool) -> Result<bool> {
        let rest = spec.strip_prefix("swap:").unwrap_or(spec);
        // `swap:/dev/xxx:firstblock`: the block offset is accepted and
        // ignored; slot 0 always holds the signature here.
        let name = match rest.rsplit_once(':') {
            Some((head, tail)) if tail.chars().all(|c| c.is_ascii_digit()) && !tail.is_empty() => {
                head
            }
            _ => rest,
        };
        match self.names.iter().position(|n| n == name) {
            Some(idx) => {
                self.resume_dev = Some(idx);
                if !quiet {
                    info!(device = name, "resume device accepted");
                }
                Ok(true)
            }
            None => {
                if only_writer {
                    return Err(SnapshotError::Config(format!(
                        "swapwriter does not know device `{name}`"
                    )));
                }
                if !quiet {
                    debug!(device = name, "spec does not name a registered swap device");
                }
                Ok(false)
            }
        }
    }

    fn storage_available(&mut self) -> Result<u64> {
        Ok(self.swap.free_slots() + self.allocator.allocated())
    }

    fn storage_allocated(&self) -> u64 {
        self.allocator.allocated()
    }

    fn allocate_header_space(&mut self, pages: u64) -> Result<()> {
        self.allocator.reserve_header(pages);
        Ok(())
    }

    fn allocate_storage(&mut self, pages: u64) -> Result<()> {
        self.allocator.allocate(&mut self.swap, pages)?;
        self.map = Some(self.allocator.sector_map(&self.swap));
        Ok(())
    }

    fn release_storage(&mut self) -> Result<()> {
        self.allocator.release(&mut self.swap);
        self.map = None;
        Ok(())
    }

    fn image_exists(&mut self) -> Result<ImagePresence> {
        let backend = self.resume_backend()?;
        let presence = match read_signature(backend)? {
            SignatureKind::Image(sig) => ImagePresence::Ours(sig),
            SignatureKind::PlainSwap => ImagePresence::PlainSwap,
            SignatureKind::Foreign(name) => ImagePresence::Foreign(name),
            SignatureKind::None => ImagePresence::None,
        };
        if let ImagePresence::Ours(sig) = presence {
            self.signature = Some(sig);
        }
        Ok(presence)
    }

    fn mark_resume_attempted(&mut self, flag: bool) -> Result<()> {
        let backend = self.resume_backend()?;
        set_resume_attempted(backend, flag)?;
        if let Some(sig) = self.signature.as_mut() {
            sig.resume_attempted = flag;
        }
        Ok(())
    }

    fn remove_image(&mut self) -> Result<()> {
        {
            let backend = self.resume_backend()?;
            restore_swap_signature(backend)?;
        }
        self.allocator.release(&mut self.swap);
        self.map = None;
        self.signature = None;
        info!("image invalidated, swap signature restored");
        Ok(())
    }

    fn write_header_init(&mut self) -> Result<()> {
        self.flush_buf()?;
        self.mode = Some(Mode::HeaderWrite);
        self.header_pos = 0;
        self.buf_page = None;
        Ok(())
    }

    fn write_header_cleanup(&mut self) -> Result<()> {
        self.flush_buf()?;
        let (header_dev, sector) = self
            .allocator
            .header_location(&self.swap)
            .map_err(SnapshotError::Storage)?;
        if sector >= 1 << 31 {
            return Err(SnapshotError::Storage(StorageError::Unsupported(
                "header sector does not fit the signature encoding",
            )));
        }
        let signature = ImageSignature {
            version: 1,
            header_dev,
            header_sector: sector as u32,
            resume_attempted: false,
        };
        {
            let backend = self.resume_backend()?;
            write_image_signature(backend, &signature)?;
        }
        self.signature = Some(signature);
        self.mode = None;
        info!(sector, "image header written and signed");
        Ok(())
    }

    fn read_header_init(&mut self) -> Result<()> {
        if self.signature.is_none() {
            // Callers normally probe image_exists first.
            match self.image_exists()? {
                ImagePresence::Ours(_) => {}
                _ => return Err(SnapshotError::Corrupt("no image to read a header from")),
            }
        }
        self.mode = Some(Mode::HeaderRead);
        self.header_pos = 0;
        self.buf_page = None;
        self.buf_dirty = false;
        Ok(())
    }

    fn read_header_cleanup(&mut self) -> Result<()> {
        self.mode = None;
        self.buf_page = None;
        Ok(())
    }

    fn header_write(&mut self, buf: &[u8]) -> Result<()> {
        if self.mode != Some(Mode::HeaderWrite) {
            return Err(SnapshotError::Corrupt("header write outside header pass"));
        }
        self.stream_write(buf)
    }

    fn header_read(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.mode != Some(Mode::HeaderRead) {
            return Err(SnapshotError::Corrupt("header read outside header pass"));
        }
        self.stream_read(buf)
    }

    fn rw_init(&mut self, dir: IoDir, stream: StreamKind) -> Result<()> {
        match dir {
            IoDir::Write => {
                // Pageset-2 opens the data region; pageset-1 continues it.
                if self.mode != Some(Mode::DataWrite) {
                    self.mode = Some(Mode::DataWrite);
                    if stream == StreamKind::Pageset2 {
                        self.data_pos = 0;
                        self.buf_page = None;
                    }
                }
            }
            IoDir::Read => {
                if self.mode != Some(Mode::DataRead) {
                    self.mode = Some(Mode::DataRead);
                    if stream == StreamKind::Pageset2 {
                        self.data_pos = 0;
                    }
                    self.buf_page = None;
                    self.buf_dirty = false;
                }
            }
        }
        Ok(())
    }

    fn rw_cleanup(&mut self, dir: IoDir, _stream: StreamKind) -> Result<()> {
        if dir == IoDir::Write {
            self.flush_buf()?;
        }
        Ok(())
    }

    fn write_page(&mut self, index: u64, data: &[u8]) -> Result<()> {
        if self.mode != Some(Mode::DataWrite) {
            return Err(SnapshotError::Corrupt("page write outside data pass"));
        }
        let size: u32 = data
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("record too large"))?;
        self.stream_write(&index.to_le_bytes())?;
        self.stream_write(&size.to_le_bytes())?;
        self.stream_write(data)
    }

    fn read_page(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if self.mode != Some(Mode::DataRead) {
            return Err(SnapshotError::Corrupt("page read outside data pass"));
        }
        let mut record = [0u8; 12];
        match self.stream_read(&mut record) {
            Ok(()) => {}
            Err(SnapshotError::Storage(StorageError::OutOfBounds { .. })) => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let index = u64::from_le_bytes(record[..8].try_into().unwrap());
        let size = u32::from_le_bytes(record[8..12].try_into().unwrap()) as usize;
        if size > PAGE_SIZE + 64 {
            return Err(SnapshotError::Corrupt("record size is implausible"));
        }
        out.resize(size, 0);
        self.stream_read(&mut out[..])?;
        Ok(Some(index))
    }
}
