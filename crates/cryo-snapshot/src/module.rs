use std::fmt;

use cryo_storage::IoDir;
use tracing::{debug, warn};

use crate::{Result, SnapshotError};

/// What [`Writer::image_exists`] found on the resume device. A foreign
/// image is reported, never claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePresence {
    Ours(cryo_storage::ImageSignature),
    PlainSwap,
    Foreign(&'static str),
    None,
}

/// Stable module-kind tag. The numeric values are written into image
/// headers and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleKind(pub u32);

impl ModuleKind {
    pub const FILTER: ModuleKind = ModuleKind(1);
    pub const WRITER: ModuleKind = ModuleKind(2);
    pub const MISC: ModuleKind = ModuleKind(3);
    pub const MISC_HIDDEN: ModuleKind = ModuleKind(4);

    pub fn name(self) -> Option<&'static str> {
        match self {
            ModuleKind::FILTER => Some("FILTER"),
            ModuleKind::WRITER => Some("WRITER"),
            ModuleKind::MISC => Some("MISC"),
            ModuleKind::MISC_HIDDEN => Some("MISC_HIDDEN"),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "UNKNOWN({})", self.0),
        }
    }
}

/// Which image substream a pipeline pass is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Pageset1,
    Pageset2,
}

/// Hooks shared by every module. Most are optional; the defaults do
/// nothing.
pub trait Module {
    /// Directory-style name, at most 31 bytes; also the header blob key.
    fn name(&self) -> &'static str;

    fn kind(&self) -> ModuleKind;

    fn enabled(&self) -> bool {
        true
    }

    fn set_enabled(&mut self, _enabled: bool) {}

    fn initialise(&mut self, _starting_cycle: bool) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self, _finishing_cycle: bool) {}

    /// Pages of working memory this module needs during a cycle.
    fn memory_needed(&self) -> u64 {
        0
    }

    /// Extra image pages this module will add (filters with framing
    /// overhead).
    fn storage_needed(&self) -> u64 {
        0
    }

    /// Anticipated compression percentage for sizing storage asks.
    fn expected_compression(&self) -> u32 {
        100
    }

    fn save_config_info(&self, _out: &mut Vec<u8>) {}

    fn load_config_info(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn print_debug_info(&self, _out: &mut String) {}
}

/// Downstream half of the write pipeline: accept one transformed page.
pub trait PageSink {
    fn put_page(&mut self, index: u64, data: &[u8]) -> Result<()>;
}

/// Upstream half of the read pipeline: produce the next page record.
/// Returns the record's index, or `None` at end of stream.
pub trait PageSource {
    fn get_page(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>>;
}

/// A transformation stage. On write a filter may reshape the payload
/// (compression) before forwarding; on read it must hand back a fully
/// reconstructed page; decompression cannot suspend across reads.
pub trait Filter: Module {
    fn rw_init(&mut self, _dir: IoDir, _stream: StreamKind) -> Result<()> {
        Ok(())
    }

    fn rw_cleanup(&mut self, _dir: IoDir, _stream: StreamKind) -> Result<()> {
        Ok(())
    }

    fn write_page(&mut self, index: u64, data: &[u8], sink: &mut dyn PageSink) -> Result<()>;

    fn read_page(&mut self, source: &mut dyn PageSource, out: &mut Vec<u8>)
        -> Result<Option<u64>>;
}

/// The terminal module: owns backing storage, the image signature and the
/// header stream. Exactly one writer is active per cycle.
pub trait Writer: Module {
    /// Claim `spec` (a `resume=` value) if it names storage this writer
    /// manages. Returns whether the spec was claimed.
    fn parse_sig_location(&mut self, spec: &str, only_writer: bool, quiet: bool) -> Result<bool>;

    /// Pages of backing store this writer could still reserve.
    fn storage_available(&mut self) -> Result<u64>;

    /// Pages currently reserved, header included.
    fn storage_allocated(&self) -> u64;

    fn allocate_header_space(&mut self, pages: u64) -> Result<()>;

    fn allocate_storage(&mut self, pages: u64) -> Result<()>;

    fn release_storage(&mut self) -> Result<()>;

    fn image_exists(&mut self) -> Result<ImagePresence>;

    fn mark_resume_attempted(&mut self, flag: bool) -> Result<()>;

    /// Invalidate the image and hand the storage back to the platform.
    fn remove_image(&mut self) -> Result<()>;

    fn write_header_init(&mut self) -> Result<()>;
    fn write_header_cleanup(&mut self) -> Result<()>;
    fn read_header_init(&mut self) -> Result<()>;
    fn read_header_cleanup(&mut self) -> Result<()>;

    /// Sequential byte access to the header region, valid between the
    /// matching init and cleanup calls.
    fn header_write(&mut self, buf: &[u8]) -> Result<()>;
    fn header_read(&mut self, buf: &mut [u8]) -> Result<()>;

    fn rw_init(&mut self, dir: IoDir, stream: StreamKind) -> Result<()>;
    fn rw_cleanup(&mut self, dir: IoDir, stream: StreamKind) -> Result<()>;

    fn write_page(&mut self, index: u64, data: &[u8]) -> Result<()>;

    fn read_page(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>>;
}

/// The module registry: filters in registration order, writers with at
/// most one active, misc modules for config blobs only.
///
/// The write pipeline runs `core → filter[0] → … → filter[n-1] → writer`;
/// each stage's downstream neighbor is the next enabled filter, or the
/// active writer after the last one.
#[derive(Default)]
pub struct ModuleRegistry {
    filters: Vec<Box<dyn Filter>>,
    writers: Vec<Box<dyn Writer>>,
    misc: Vec<Box<dyn Module>>,
    active_writer: Option<usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_filter(&mut self, filter: Box<dyn Filter>) -> Result<()> {
        if filter.kind() != ModuleKind::FILTER {
            return Err(SnapshotError::Unsupported("module is not a filter"));
        }
        debug!(module = filter.name(), "filter registered");
        self.filters.push(filter);
        Ok(())
    }

    pub fn register_writer(&mut self, writer: Box<dyn Writer>) -> Result<()> {
        if writer.kind() != ModuleKind::WRITER {
            return Err(SnapshotError::Unsupported("module is not a writer"));
        }
        debug!(module = writer.name(), "writer registered");
        self.writers.push(writer);
        Ok(())
    }

    pub fn register_misc(&mut self, module: Box<dyn Module>) -> Result<()> {
        match module.kind() {
            ModuleKind::MISC | ModuleKind::MISC_HIDDEN => {
                self.misc.push(module);
                Ok(())
            }
            _ => Err(SnapshotError::Unsupported("module is not misc")),
        }
    }

    /// Offer `spec` to every registered writer; the first to claim it
    /// becomes the active writer. Claiming while another writer is active
    /// fails.
    pub fn activate_writer_for(&mut self, spec: &str, quiet: bool) -> Result<()> {
        let mut claimed = None;
        for (i, writer) in self.writers.iter_mut().enumerate() {
            if writer.parse_sig_location(spec, false, quiet)? {
                claimed = Some(i);
                break;
            }
        }
        let Some(i) = claimed else {
            return Err(SnapshotError::Config(format!(
                "no writer accepts resume location `{spec}`"
            )));
        };
        if let Some(active) = self.active_writer {
            if active != i {
                return Err(SnapshotError::Unsupported(
                    "a different writer is already active",
                ));
            }
        }
        self.active_writer = Some(i);
        debug!(module = self.writers[i].name(), spec, "writer activated");
        Ok(())
    }

    pub fn deactivate_writer(&mut self) {
        self.active_writer = None;
    }

    pub fn has_active_writer(&self) -> bool {
        self.active_writer.is_some()
    }

    pub fn active_writer_mut(&mut self) -> Result<&mut dyn Writer> {
        let idx = self
            .active_writer
            .ok_or(SnapshotError::Unsupported("no active writer"))?;
        Ok(&mut *self.writers[idx])
    }

    /// Enabled filters plus the active writer, the shape every pipeline
    /// pass borrows.
    pub fn pipeline_parts(&mut self) -> Result<(&mut [Box<dyn Filter>], &mut dyn Writer)> {
        let idx = self
            .active_writer
            .ok_or(SnapshotError::Unsupported("no active writer"))?;
        Ok((&mut self.filters[..], &mut *self.writers[idx]))
    }

    /// Total expected compression across the filter chain, in percent.
    pub fn expected_compression(&self) -> u32 {
        self.filters
            .iter()
            .filter(|f| f.enabled())
            .map(|f| f.expected_compression())
            .fold(100, |acc, pct| acc * pct / 100)
            .max(1)
    }

    pub fn memory_needed(&self) -> u64 {
        self.all_modules().map(|m| m.memory_needed()).sum()
    }

    pub fn storage_needed(&self) -> u64 {
        self.all_modules().map(|m| m.storage_needed()).sum()
    }

    fn all_modules(&self) -> impl Iterator<Item = &dyn Module> {
        self.filters
            .iter()
            .map(|f| f.as_ref() as &dyn Module)
            .chain(self.writers.iter().map(|w| w.as_ref() as &dyn Module))
            .chain(self.misc.iter().map(|m| m.as_ref() as &dyn Module))
    }

    pub fn initialise_all(&mut self, starting_cycle: bool) -> Result<()> {
        for f in &mut self.filters {
            f.initialise(starting_cycle)?;
        }
        for w in &mut self.writers {
            w.initialise(starting_cycle)?;
        }
        for m in &mut self.misc {
            m.initialise(starting_cycle)?;
        }
        Ok(())
    }

    pub fn cleanup_all(&mut self, finishing_cycle: bool) {
        for f in &mut self.filters {
            f.cleanup(finishing_cycle);
        }
        for w in &mut self.writers {
            w.cleanup(finishing_cycle);
        }
        for m in &mut self.misc {
            m.cleanup(finishing_cycle);
        }
    }

    /// Frame every enabled module's config blob:
    /// `{name: 32 bytes, kind: u32, len: u32, payload}`, closed by a
    /// zero-name sentinel.
    pub fn save_all_config(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut frame = |module: &dyn Module| -> Result<()> {
            if !module.enabled() {
                return Ok(());
            }
            let name = module.name().as_bytes();
            if name.len() > 31 || name.is_empty() {
                return Err(SnapshotError::Unsupported("bad module name length"));
            }
            let mut name_field = [0u8; 32];
            name_field[..name.len()].copy_from_slice(name);
            let mut blob = Vec::new();
            module.save_config_info(&mut blob);
            out.extend_from_slice(&name_field);
            out.extend_from_slice(&module.kind().0.to_le_bytes());
            out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
            out.extend_from_slice(&blob);
            Ok(())
        };
        for module in self.all_modules() {
            frame(module)?;
        }
        out.extend_from_slice(&[0u8; 32]);
        Ok(())
    }

    /// Dispatch framed config blobs back to their modules by name.
    /// Blobs for modules not present are skipped with a warning.
    pub fn load_all_config(&mut self, mut input: &[u8]) -> Result<()> {
        loop {
            if input.len() < 32 {
                return Err(SnapshotError::Corrupt("truncated module config area"));
            }
            let (name_field, rest) = input.split_at(32);
            input = rest;
            if name_field.iter().all(|&b| b == 0) {
                return Ok(());
            }
            let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(32);
            let name = std::str::from_utf8(&name_field[..name_len])
                .map_err(|_| SnapshotError::Corrupt("module name not utf-8"))?
                .to_owned();

            if input.len() < 8 {
                return Err(SnapshotError::Corrupt("truncated module config frame"));
            }
            let kind = u32::from_le_bytes(input[..4].try_into().unwrap());
            let len = u32::from_le_bytes(input[4..8].try_into().unwrap()) as usize;
            input = &input[8..];
            if input.len() < len {
                return Err(SnapshotError::Corrupt("module config blob overruns area"));
            }
            let (blob, rest) = input.split_at(len);
            input = rest;

            match self.module_by_name_mut(&name) {
                Some(module) => {
                    if module.kind().0 != kind {
                        return Err(SnapshotError::Corrupt("module kind mismatch in header"));
                    }
                    module.load_config_info(blob)?;
                }
                None => warn!(module = %name, "image references a module this kernel lacks"),
            }
        }
    }

    fn module_by_name_mut(&mut self, name: &str) -> Option<&mut dyn Module> {
        if let Some(f) = self.filters.iter_mut().find(|f| f.name() == name) {
            return Some(f.as_mut() as &mut dyn Module);
        }
        if let Some(w) = self.writers.iter_mut().find(|w| w.name() == name) {
            return Some(w.as_mut() as &mut dyn Module);
        }
        if let Some(m) = self.misc.iter_mut().find(|m| m.name() == name) {
            return Some(m.as_mut() as &mut dyn Module);
        }
        None
    }

    /// Collect every module's debug lines, hidden modules excluded.
    pub fn print_debug_info(&self) -> String {
        let mut out = String::new();
        for module in self.all_modules() {
            if module.kind() == ModuleKind::MISC_HIDDEN {
                continue;
            }
            module.print_debug_info(&mut out);
        }
        out
    }
}
