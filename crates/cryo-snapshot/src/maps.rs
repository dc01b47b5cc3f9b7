use cryo_mem::PageBitmap;

use crate::{Result, SnapshotError};

/// The page-classification bitmaps, created once per cycle after the
/// freezer runs and torn down in `do_cleanup` regardless of outcome.
#[derive(Default)]
pub struct PageMaps {
    /// Pages whose content must be captured by the atomic copy.
    pub pageset1: PageBitmap,
    /// Reserved scratch pages, one per pageset-1 page, holding the copy.
    pub pageset1_copy: PageBitmap,
    /// Pages provably quiescent after the freezer; streamed directly.
    pub pageset2: PageBitmap,
    /// Pages currently in flight through the I/O pipeline.
    pub io: PageBitmap,
    /// Kernel-declared do-not-save regions.
    pub nosave: PageBitmap,
    /// Pages available for the copy-page reserve.
    pub free: PageBitmap,
    /// Pages dirtied after classification, rewritten before the atomic
    /// copy completes.
    pub resave: PageBitmap,
}

impl PageMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear_all(&mut self) {
        self.pageset1.clear_all();
        self.pageset1_copy.clear_all();
        self.pageset2.clear_all();
        self.io.clear_all();
        self.nosave.clear_all();
        self.free.clear_all();
        self.resave.clear_all();
    }

    /// Verify the classification invariants:
    /// pageset-1, pageset-2, the copy reserve and nosave are pairwise
    /// disjoint, and the copy reserve matches pageset-1 in size.
    pub fn check_invariants(&self) -> Result<()> {
        for pfn in self.pageset1.iter() {
            if self.pageset2.test(pfn) {
                return Err(SnapshotError::Corrupt("page in both pagesets"));
            }
            if self.pageset1_copy.test(pfn) {
                return Err(SnapshotError::Corrupt("pageset-1 page doubles as copy page"));
            }
            if self.nosave.test(pfn) {
                return Err(SnapshotError::Corrupt("nosave page in pageset-1"));
            }
        }
        for pfn in self.pageset1_copy.iter() {
            if self.pageset2.test(pfn) || self.nosave.test(pfn) {
                return Err(SnapshotError::Corrupt("copy page not exclusive"));
            }
        }
        for pfn in self.pageset2.iter() {
            if self.nosave.test(pfn) {
                return Err(SnapshotError::Corrupt("nosave page in pageset-2"));
            }
        }
        if self.pageset1.count() != self.pageset1_copy.count() {
            return Err(SnapshotError::Corrupt("copy reserve does not match pageset-1"));
        }
        Ok(())
    }
}
