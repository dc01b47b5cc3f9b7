use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Outcome bits of a hibernate or resume cycle. The engine never
    /// "exits"; it reports through this set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CycleResult: u32 {
        const ABORTED                      = 1 << 0;
        const KEPT_IMAGE                   = 1 << 1;
        const EXTRA_PAGES_ALLOW_TOO_SMALL  = 1 << 2;
        const DEVICE_REFUSED               = 1 << 3;
        const SYSDEV_REFUSED               = 1 << 4;
        const CPU_HOTPLUG_FAILED           = 1 << 5;
        const ARCH_PREPARE_FAILED          = 1 << 6;
        const PLATFORM_PREP_FAILED         = 1 << 7;
        const PRE_SNAPSHOT_FAILED          = 1 << 8;
        const PRE_RESTORE_FAILED           = 1 << 9;
        const FAILED_IO                    = 1 << 10;
        const PM_SEM                       = 1 << 11;
        const CANT_SUSPEND                 = 1 << 12;
    }
}

impl CycleResult {
    /// Bits that mean the cycle did not complete cleanly. `KEPT_IMAGE`
    /// alone is a successful outcome.
    pub fn is_failure(self) -> bool {
        !(self - CycleResult::KEPT_IMAGE).is_empty()
    }
}

bitflags! {
    /// Where in its lifecycle the engine currently is. Written only by the
    /// cycle controller; readers may poll without locking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CycleState: u32 {
        const INITIALISED       = 1 << 0;
        const FROZEN            = 1 << 1;
        const ATOMIC            = 1 << 2;
        const IMAGE_WRITTEN     = 1 << 3;
        const NOW_RESUMING      = 1 << 4;
        const RESUME_ATTEMPTED  = 1 << 5;
        const IMAGE_EXISTS      = 1 << 6;
    }
}

/// Shared abort channel. Any module may raise a result bit at any time;
/// the cycle controller polls it at every sequence boundary.
#[derive(Debug, Default)]
pub struct AbortFlag {
    bits: AtomicU32,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, result: CycleResult) {
        self.bits
            .fetch_or(result.bits() | CycleResult::ABORTED.bits(), Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.bits.load(Ordering::SeqCst) != 0
    }

    pub fn get(&self) -> CycleResult {
        CycleResult::from_bits_truncate(self.bits.load(Ordering::SeqCst))
    }

    pub fn clear(&self) {
        self.bits.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kept_image_alone_is_not_a_failure() {
        assert!(!CycleResult::KEPT_IMAGE.is_failure());
        assert!(!CycleResult::empty().is_failure());
        assert!((CycleResult::KEPT_IMAGE | CycleResult::ABORTED).is_failure());
        assert!(CycleResult::FAILED_IO.is_failure());
    }

    #[test]
    fn abort_flag_accumulates() {
        let flag = AbortFlag::new();
        assert!(!flag.is_set());
        flag.set(CycleResult::DEVICE_REFUSED);
        assert!(flag.is_set());
        assert!(flag.get().contains(CycleResult::DEVICE_REFUSED));
        assert!(flag.get().contains(CycleResult::ABORTED));
        flag.clear();
        assert!(!flag.is_set());
    }
}
