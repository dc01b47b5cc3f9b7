use cryo_storage::IoDir;

use crate::module::{Filter, PageSink, PageSource, StreamKind, Writer};
use crate::Result;

/// One borrowed pass over the filter chain and the active writer.
///
/// Write: `core → filter[0] → … → filter[n-1] → writer`; read is the
/// inverse. Disabled filters are skipped in both directions. The pass is
/// deliberately synchronous per page: a stage cannot return until its
/// downstream has consumed (or produced) the whole record.
pub struct Pipeline<'a> {
    filters: &'a mut [Box<dyn Filter>],
    writer: &'a mut dyn Writer,
}

struct WriteChain<'a> {
    filters: &'a mut [Box<dyn Filter>],
    writer: &'a mut dyn Writer,
}

impl PageSink for WriteChain<'_> {
    fn put_page(&mut self, index: u64, data: &[u8]) -> Result<()> {
        let mut filters: &mut [Box<dyn Filter>] = &mut *self.filters;
        loop {
            match filters.split_first_mut() {
                Some((first, rest)) if !first.enabled() => {
                    filters = rest;
                }
                Some((first, rest)) => {
                    let mut downstream = WriteChain {
                        filters: rest,
                        writer: &mut *self.writer,
                    };
                    return first.write_page(index, data, &mut downstream);
                }
                None => return self.writer.write_page(index, data),
            }
        }
    }
}

struct ReadChain<'a> {
    filters: &'a mut [Box<dyn Filter>],
    writer: &'a mut dyn Writer,
}

impl PageSource for ReadChain<'_> {
    fn get_page(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        let mut filters: &mut [Box<dyn Filter>] = &mut *self.filters;
        loop {
            match filters.split_first_mut() {
                Some((first, rest)) if !first.enabled() => {
                    filters = rest;
                }
                Some((first, rest)) => {
                    let mut upstream = ReadChain {
                        filters: rest,
                        writer: &mut *self.writer,
                    };
                    return first.read_page(&mut upstream, out);
                }
                None => return self.writer.read_page(out),
            }
        }
    }
}

impl<'a> Pipeline<'a> {
    pub fn new(filters: &'a mut [Box<dyn Filter>], writer: &'a mut dyn Writer) -> Self {
        Self { filters, writer }
    }

    pub fn rw_init(&mut self, dir: IoDir, stream: StreamKind) -> Result<()> {
        for filter in self.filters.iter_mut().filter(|f| f.enabled()) {
            filter.rw_init(dir, stream)?;
        }
        self.writer.rw_init(dir, stream)
    }

    /// Tear a pass down. Filters go first so anything they still hold can
    /// drain downstream before the writer closes the stream.
    pub fn rw_cleanup(&mut self, dir: IoDir, stream: StreamKind) -> Result<()> {
        for filter in self.filters.iter_mut().filter(|f| f.enabled()) {
            filter.rw_cleanup(dir, stream)?;
        }
        self.writer.rw_cleanup(dir, stream)
    }

    /// Push one page record through the chain. `data` is the raw page;
    /// what reaches the writer may be smaller.
    pub fn write_page(&mut self, index: u64, data: &[u8]) -> Result<()> {
        let mut chain = WriteChain {
            filters: &mut *self.filters,
            writer: &mut *self.writer,
        };
        chain.put_page(index, data)
    }

    /// Pull the next page record through the chain. `out` receives the
    /// fully reconstructed page; the record's index is returned.
    pub fn read_page(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        let mut chain = ReadChain {
            filters: &mut *self.filters,
            writer: &mut *self.writer,
        };
        chain.get_page(out)
    }
}
