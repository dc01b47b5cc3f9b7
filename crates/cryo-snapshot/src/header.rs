use cryo_mem::{PageBitmap, PAGE_SIZE};
use cryo_storage::ExtentChain;

use crate::module::Writer;
use crate::{Result, SnapshotError};

/// Leading bytes of the fixed header record.
pub const HEADER_MAGIC: [u8; 8] = *b"CRYOIMG1";

/// Size of the fixed record, including the reserved tail word.
pub const FIXED_RECORD_LEN: usize = 192;

const OS_VERSION_LEN: usize = 64;

/// The fixed leading record of the main image header. Everything is
/// little-endian and byte-exact; resume on a different build refuses the
/// image on the magic, not by misparsing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Capturing machine's OS version string, at most 63 bytes.
    pub os_version: String,
    /// Physical pages seen by the classifier.
    pub page_count: u64,
    pub cpu_count: u32,
    pub page_size: u32,
    /// Pages in the pageset-2 stream.
    pub pageset2_size: u64,
    /// Policy parameters in effect when the image was written.
    pub policy: [i64; 6],
    /// Pages written, write msec, pages read, read msec.
    pub io_stats: [u64; 4],
    /// Pages in the pageset-1 stream (the pagedir-1 descriptor).
    pub pagedir1_size: u64,
    /// Root device of the captured system.
    pub root_dev: u32,
}

impl ImageHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.extend_from_slice(&HEADER_MAGIC);

        let os = self.os_version.as_bytes();
        if os.len() >= OS_VERSION_LEN {
            return Err(SnapshotError::Unsupported("os version string too long"));
        }
        let mut os_field = [0u8; OS_VERSION_LEN];
        os_field[..os.len()].copy_from_slice(os);
        out.extend_from_slice(&os_field);

        out.extend_from_slice(&self.page_count.to_le_bytes());
        out.extend_from_slice(&self.cpu_count.to_le_bytes());
        out.extend_from_slice(&self.page_size.to_le_bytes());
        out.extend_from_slice(&self.pageset2_size.to_le_bytes());
        for p in &self.policy {
            out.extend_from_slice(&p.to_le_bytes());
        }
        for s in &self.io_stats {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out.extend_from_slice(&self.pagedir1_size.to_le_bytes());
        out.extend_from_slice(&self.root_dev.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // reserved

        debug_assert_eq!(out.len() - start, FIXED_RECORD_LEN);
        Ok(())
    }

    pub fn parse(bytes: &[u8; FIXED_RECORD_LEN]) -> Result<Self> {
        if bytes[..8] != HEADER_MAGIC {
            return Err(SnapshotError::Corrupt("bad image header magic"));
        }
        let os_field = &bytes[8..8 + OS_VERSION_LEN];
        let os_len = os_field.iter().position(|&b| b == 0).unwrap_or(OS_VERSION_LEN);
        let os_version = std::str::from_utf8(&os_field[..os_len])
            .map_err(|_| SnapshotError::Corrupt("os version not utf-8"))?
            .to_owned();

        let mut at = 8 + OS_VERSION_LEN;
        let mut u64_at = |at: &mut usize| {
            let v = u64::from_le_bytes(bytes[*at..*at + 8].try_into().unwrap());
            *at += 8;
            v
        };
        let mut u32_at = |at: &mut usize| {
            let v = u32::from_le_bytes(bytes[*at..*at + 4].try_into().unwrap());
            *at += 4;
            v
        };

        let page_count = u64_at(&mut at);
        let cpu_count = u32_at(&mut at);
        let page_size = u32_at(&mut at);
        let pageset2_size = u64_at(&mut at);
        let mut policy = [0i64; 6];
        for p in &mut policy {
            *p = u64_at(&mut at) as i64;
        }
        let mut io_stats = [0u64; 4];
        for s in &mut io_stats {
            *s = u64_at(&mut at);
        }
        let pagedir1_size = u64_at(&mut at);
        let root_dev = u32_at(&mut at);

        if page_size != PAGE_SIZE as u32 {
            return Err(SnapshotError::Unsupported("image page size differs from host"));
        }

        Ok(Self {
            os_version,
            page_count,
            cpu_count,
            page_size,
            pageset2_size,
            policy,
            io_stats,
            pagedir1_size,
            root_dev,
        })
    }
}

/// Serialize an extent chain into the header stream.
pub fn write_chain(writer: &mut dyn Writer, chain: &ExtentChain) -> Result<()> {
    let mut buf = Vec::with_capacity(chain.serialized_len());
    chain.write_to(&mut buf)?;
    writer.header_write(&buf)
}

/// Read one extent chain back from the header stream.
pub fn read_chain(writer: &mut dyn Writer) -> Result<ExtentChain> {
    let mut prefix = [0u8; 8];
    writer.header_read(&mut prefix)?;
    let num = u32::from_le_bytes(prefix[..4].try_into().unwrap()) as usize;
    if num > 1 << 20 {
        return Err(SnapshotError::Corrupt("implausible extent count"));
    }
    let mut body = vec![0u8; num * 16];
    writer.header_read(&mut body)?;
    let mut full = Vec::with_capacity(8 + body.len());
    full.extend_from_slice(&prefix);
    full.extend_from_slice(&body);
    let mut cursor = &full[..];
    let chain = ExtentChain::read_from(&mut cursor).map_err(SnapshotError::Storage)?;
    Ok(chain)
}

/// Run-length encode a bitmap's members for the header.
pub fn bitmap_to_chain(map: &PageBitmap) -> Result<ExtentChain> {
    let mut chain = ExtentChain::new();
    let mut run: Option<(u64, u64)> = None;
    for pfn in map.iter() {
        run = match run {
            None => Some((pfn, pfn)),
            Some((start, end)) if pfn == end + 1 => Some((start, pfn)),
            Some((start, end)) => {
                chain.append(start, end).map_err(SnapshotError::Storage)?;
                Some((pfn, pfn))
            }
        };
    }
    if let Some((start, end)) = run {
        chain.append(start, end).map_err(SnapshotError::Storage)?;
    }
    Ok(chain)
}

/// Rebuild a bitmap from its run-length encoding.
pub fn chain_to_bitmap(chain: &ExtentChain) -> PageBitmap {
    let mut map = PageBitmap::new();
    for pfn in chain.iter() {
        map.set(pfn);
    }
    map
}

/// Read the framed module-config area into a buffer `load_all_config`
/// understands, stopping at the zero-name sentinel.
pub fn read_module_area(writer: &mut dyn Writer) -> Result<Vec<u8>> {
    let mut area = Vec::new();
    loop {
        let mut name = [0u8; 32];
        writer.header_read(&mut name)?;
        area.extend_from_slice(&name);
        if name.iter().all(|&b| b == 0) {
            return Ok(area);
        }
        let mut kind_len = [0u8; 8];
        writer.header_read(&mut kind_len)?;
        area.extend_from_slice(&kind_len);
        let len = u32::from_le_bytes(kind_len[4..8].try_into().unwrap()) as usize;
        if len > 1 << 24 {
            return Err(SnapshotError::Corrupt("module config blob is implausible"));
        }
        let mut blob = vec![0u8; len];
        writer.header_read(&mut blob)?;
        area.extend_from_slice(&blob);
    }
}

/// Parse just the module names out of a config area.
pub fn module_names(mut area: &[u8]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    loop {
        if area.len() < 32 {
            return Err(SnapshotError::Corrupt("truncated module config area"));
        }
        let (name_field, rest) = area.split_at(32);
        area = rest;
        if name_field.iter().all(|&b| b == 0) {
            return Ok(names);
        }
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(32);
        names.push(
            std::str::from_utf8(&name_field[..name_len])
                .map_err(|_| SnapshotError::Corrupt("module name not utf-8"))?
                .to_owned(),
        );
        if area.len() < 8 {
            return Err(SnapshotError::Corrupt("truncated module config frame"));
        }
        let len = u32::from_le_bytes(area[4..8].try_into().unwrap()) as usize;
        area = &area[8..];
        if area.len() < len {
            return Err(SnapshotError::Corrupt("module config blob overruns area"));
        }
        area = &area[len..];
    }
}

/// Header summary produced by [`inspect`](crate::inspect): the fixed
/// record plus the modules the image was written with.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub header: ImageHeader,
    pub pagedir1_extents: usize,
    pub pagedir2_extents: usize,
    pub modules: Vec<String>,
}
