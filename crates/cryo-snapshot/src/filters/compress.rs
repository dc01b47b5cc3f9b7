use cryo_mem::PAGE_SIZE;
use cryo_storage::IoDir;
use tracing::debug;

use crate::module::{Filter, Module, ModuleKind, PageSink, PageSource, StreamKind};
use crate::{Result, SnapshotError};

/// Algorithm tag stored in the config blob. Only LZ4 block compression is
/// wired in.
const ALGO_LZ4: u32 = 1;

/// Per-page LZ4 compression.
///
/// Pages that do not shrink are forwarded raw; the record size tells the
/// read side which form it is looking at (`PAGE_SIZE` means raw, anything
/// smaller is an LZ4 block).
pub struct CompressionFilter {
    enabled: bool,
    expected_pct: u32,
    bytes_in: u64,
    bytes_out: u64,
}

impl CompressionFilter {
    pub fn new() -> Self {
        Self {
            enabled: true,
            expected_pct: 100,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Configure the anticipated compression percentage used when sizing
    /// storage asks.
    pub fn with_expected(expected_pct: u32) -> Self {
        Self {
            expected_pct: expected_pct.clamp(1, 100),
            ..Self::new()
        }
    }

    /// Observed ratio so far, percent of input retained.
    pub fn observed_pct(&self) -> u32 {
        if self.bytes_in == 0 {
            100
        } else {
            (self.bytes_out * 100 / self.bytes_in) as u32
        }
    }
}

impl Default for CompressionFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CompressionFilter {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::FILTER
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn initialise(&mut self, starting_cycle: bool) -> Result<()> {
        if starting_cycle {
            self.bytes_in = 0;
            self.bytes_out = 0;
        }
        Ok(())
    }

    fn expected_compression(&self) -> u32 {
        self.expected_pct
    }

    fn save_config_info(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&ALGO_LZ4.to_le_bytes());
        out.extend_from_slice(&self.expected_pct.to_le_bytes());
        out.extend_from_slice(&self.bytes_in.to_le_bytes());
        out.extend_from_slice(&self.bytes_out.to_le_bytes());
    }

    fn load_config_info(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != 24 {
            return Err(SnapshotError::Corrupt("compression config blob size"));
        }
        let algo = u32::from_le_bytes(data[..4].try_into().unwrap());
        if algo != ALGO_LZ4 {
            return Err(SnapshotError::Corrupt("image compressed with unknown algorithm"));
        }
        self.expected_pct = u32::from_le_bytes(data[4..8].try_into().unwrap());
        self.bytes_in = u64::from_le_bytes(data[8..16].try_into().unwrap());
        self.bytes_out = u64::from_le_bytes(data[16..24].try_into().unwrap());
        Ok(())
    }

    fn print_debug_info(&self, out: &mut String) {
        use std::fmt::Write as _;
        let _ = writeln!(
            out,
            "lz4: {} -> {} bytes ({}%)",
            self.bytes_in,
            self.bytes_out,
            self.observed_pct()
        );
    }
}

impl Filter for CompressionFilter {
    fn rw_cleanup(&mut self, dir: IoDir, stream: StreamKind) -> Result<()> {
        if dir == IoDir::Write {
            debug!(
                ?stream,
                observed_pct = self.observed_pct(),
                "compression pass finished"
            );
        }
        Ok(())
    }

    fn write_page(&mut self, index: u64, data: &[u8], sink: &mut dyn PageSink) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(SnapshotError::Corrupt("compressor fed a non-page record"));
        }
        self.bytes_in += data.len() as u64;
        let compressed = lz4_flex::block::compress(data);
        if compressed.len() < PAGE_SIZE {
            self.bytes_out += compressed.len() as u64;
            sink.put_page(index, &compressed)
        } else {
            // Incompressible; store raw so the read side can tell by size.
            self.bytes_out += data.len() as u64;
            sink.put_page(index, data)
        }
    }

    fn read_page(
        &mut self,
        source: &mut dyn PageSource,
        out: &mut Vec<u8>,
    ) -> Result<Option<u64>> {
        let mut payload = Vec::new();
        let index = match source.get_page(&mut payload)? {
            Some(index) => index,
            None => return Ok(None),
        };
        if payload.len() == PAGE_SIZE {
            *out = payload;
        } else {
            let decompressed = lz4_flex::block::decompress(&payload, PAGE_SIZE)
                .map_err(|_| SnapshotError::Corrupt("lz4 payload does not decompress"))?;
            if decompressed.len() != PAGE_SIZE {
                return Err(SnapshotError::Corrupt("lz4 payload is not one page"));
            }
            *out = decompressed;
        }
        Ok(Some(index))
    }
}
