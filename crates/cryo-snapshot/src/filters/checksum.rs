use cryo_storage::IoDir;
use tracing::debug;

use crate::module::{Filter, Module, ModuleKind, PageSink, PageSource, StreamKind};
use crate::{Result, SnapshotError};

/// Per-stream rolling totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StreamDigest {
    pages: u64,
    crc: u32,
}

impl StreamDigest {
    fn fold(&mut self, page_crc: u32) {
        self.pages += 1;
        // Order-sensitive rolling combination of the per-page CRCs.
        self.crc = self.crc.rotate_left(1) ^ page_crc;
    }
}

/// CRC32 integrity filter.
///
/// Every record passing downstream gets its CRC32 appended; on read the
/// checksum is verified and stripped before the payload travels further
/// up the chain. Rolling per-stream digests are carried in the config
/// blob and checked when a read pass completes.
pub struct ChecksumFilter {
    enabled: bool,
    current: Option<StreamKind>,
    observed: [StreamDigest; 2],
    expected: Option<[StreamDigest; 2]>,
}

fn slot(stream: StreamKind) -> usize {
    match stream {
        StreamKind::Pageset2 => 0,
        StreamKind::Pageset1 => 1,
    }
}

impl ChecksumFilter {
    pub fn new() -> Self {
        Self {
            enabled: true,
            current: None,
            observed: [StreamDigest::default(); 2],
            expected: None,
        }
    }

    fn page_crc(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for ChecksumFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ChecksumFilter {
    fn name(&self) -> &'static str {
        "checksum"
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
            self.observed = [StreamDigest::default(); 2];
            self.expected = None;
        }
        Ok(())
    }

    fn save_config_info(&self, out: &mut Vec<u8>) {
        for digest in &self.observed {
            out.extend_from_slice(&digest.pages.to_le_bytes());
            out.extend_from_slice(&digest.crc.to_le_bytes());
        }
    }

    fn load_config_info(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != 24 {
            return Err(SnapshotError::Corrupt("checksum config blob size"));
        }
        let mut expected = [StreamDigest::default(); 2];
        for (i, chunk) in data.chunks_exact(12).enumerate() {
            expected[i] = StreamDigest {
                pages: u64::from_le_bytes(chunk[..8].try_into().unwrap()),
                crc: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
            };
        }
        self.expected = Some(expected);
        self.observed = [StreamDigest::default(); 2];
        Ok(())
    }
}

impl Filter for ChecksumFilter {
    fn rw_init(&mut self, _dir: IoDir, stream: StreamKind) -> Result<()> {
        self.current = Some(stream);
        Ok(())
    }

    fn rw_cleanup(&mut self, dir: IoDir, stream: StreamKind) -> Result<()> {
        self.current = None;
        if dir != IoDir::Read {
            return Ok(());
        }
        let Some(expected) = self.expected else {
            // No digest in the header (filter was off when writing).
            return Ok(());
        };
        let idx = slot(stream);
        if expected[idx] != self.observed[idx] {
            return Err(SnapshotError::Corrupt("stream checksum mismatch"));
        }
        debug!(?stream, pages = self.observed[idx].pages, "stream checksum verified");
        Ok(())
    }

    fn write_page(&mut self, index: u64, data: &[u8], sink: &mut dyn PageSink) -> Result<()> {
        let stream = self
            .current
            .ok_or(SnapshotError::Corrupt("checksum pass not initialised"))?;
        let crc = Self::page_crc(data);
        self.observed[slot(stream)].fold(crc);
        let mut framed = Vec::with_capacity(data.len() + 4);
        framed.extend_from_slice(data);
        framed.extend_from_slice(&crc.to_le_bytes());
        sink.put_page(index, &framed)
    }

    fn read_page(
        &mut self,
        source: &mut dyn PageSource,
        out: &mut Vec<u8>,
    ) -> Result<Option<u64>> {
        let stream = self
            .current
            .ok_or(SnapshotError::Corrupt("checksum pass not initialised"))?;
        let mut framed = Vec::new();
        let index = match source.get_page(&mut framed)? {
            Some(index) => index,
            None => return Ok(None),
        };
        if framed.len() < 4 {
            return Err(SnapshotError::Corrupt("record too short for its checksum"));
        }
        let payload_len = framed.len() - 4;
        let stored = u32::from_le_bytes(framed[payload_len..].try_into().unwrap());
        framed.truncate(payload_len);
        let crc = Self::page_crc(&framed);
        if crc != stored {
            return Err(SnapshotError::Corrupt("page checksum mismatch"));
        }
        self.observed[slot(stream)].fold(crc);
        *out = framed;
        Ok(Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink {
        records: Vec<(u64, Vec<u8>)>,
    }

    impl PageSink for VecSink {
        fn put_page(&mut self, index: u64, data: &[u8]) -> Result<()> {
            self.records.push((index, data.to_vec()));
            Ok(())
        }
    }

    struct VecSource {
        records: std::vec::IntoIter<(u64, Vec<u8>)>,
    }

    impl PageSource for VecSource {
        fn get_page(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
            match self.records.next() {
                Some((index, data)) => {
                    *out = data;
                    Ok(Some(index))
                }
                None => Ok(None),
            }
        }
    }

    #[test]
    fn checksum_appends_verifies_and_strips() {
        let mut filter = ChecksumFilter::new();
        filter.rw_init(IoDir::Write, StreamKind::Pageset1).unwrap();
        let data = vec![9u8; 100];
        let mut sink = VecSink { records: vec![] };
        filter.write_page(3, &data, &mut sink).unwrap();
        assert_eq!(sink.records[0].1.len(), 104);

        let mut blob = Vec::new();
        filter.save_config_info(&mut blob);

        let mut reader = ChecksumFilter::new();
        reader.load_config_info(&blob).unwrap();
        reader.rw_init(IoDir::Read, StreamKind::Pageset1).unwrap();
        let mut source = VecSource {
            records: sink.records.into_iter(),
        };
        let mut out = Vec::new();
        assert_eq!(reader.read_page(&mut source, &mut out).unwrap(), Some(3));
        assert_eq!(out, data);
        reader.rw_cleanup(IoDir::Read, StreamKind::Pageset1).unwrap();
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let mut filter = ChecksumFilter::new();
        filter.rw_init(IoDir::Write, StreamKind::Pageset2).unwrap();
        let mut sink = VecSink { records: vec![] };
        filter.write_page(0, &[1, 2, 3], &mut sink).unwrap();

        let mut records = sink.records;
        records[0].1[0] ^= 0xFF;

        filter.rw_init(IoDir::Read, StreamKind::Pageset2).unwrap();
        let mut source = VecSource {
            records: records.into_iter(),
        };
        let mut out = Vec::new();
        assert!(matches!(
            filter.read_page(&mut source, &mut out),
            Err(SnapshotError::Corrupt(_))
        ));
    }

    #[test]
    fn rolling_digest_mismatch_fails_cleanup() {
        let mut writer_side = ChecksumFilter::new();
        writer_side
            .rw_init(IoDir::Write, StreamKind::Pageset1)
            .unwrap();
        let mut sink = VecSink { records: vec![] };
        writer_side.write_page(0, &[5; 16], &mut sink).unwrap();
        writer_side.write_page(1, &[6; 16], &mut sink).unwrap();
        let mut blob = Vec::new();
        writer_side.save_config_info(&mut blob);

        // Read back only one of the two records.
        let mut reader = ChecksumFilter::new();
        reader.load_config_info(&blob).unwrap();
        reader.rw_init(IoDir::Read, StreamKind::Pageset1).unwrap();
        let mut source = VecSource {
            records: sink.records[..1].to_vec().into_iter(),
        };
        let mut out = Vec::new();
        reader.read_page(&mut source, &mut out).unwrap();
        assert!(matches!(
            reader.rw_cleanup(IoDir::Read, StreamKind::Pageset1),
            Err(SnapshotError::Corrupt(_))
        ));
    }
}
