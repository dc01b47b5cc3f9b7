use cryo_mem::{RestoreEntry, PAGE_SIZE, PFN_END};
use tracing::debug;

use crate::host::MemoryHost;
use crate::maps::PageMaps;
use crate::platform::{Platform, SuspendPhase};
use crate::result::CycleResult;
use crate::{Result, SnapshotError};

/// Rollback labels of the atomic region, in rollback execution order.
/// `end_atomic(stage)` executes every label from `stage` onward: the
/// deliberate fall-through that guarantees a failure at entry step `k`
/// undoes exactly the steps reached, no more and no less.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicStage {
    DevicePowerUp,
    SysdevResume,
    IrqsOn,
    CpusUp,
    PmUnlock,
    ArchCleanup,
    DeviceResume,
    ConsoleResume,
    PlatformEnd,
}

const ROLLBACK_ORDER: [AtomicStage; 9] = [
    AtomicStage::DevicePowerUp,
    AtomicStage::SysdevResume,
    AtomicStage::IrqsOn,
    AtomicStage::CpusUp,
    AtomicStage::PmUnlock,
    AtomicStage::ArchCleanup,
    AtomicStage::DeviceResume,
    AtomicStage::ConsoleResume,
    AtomicStage::PlatformEnd,
];

/// Walk the quiesce sequence: console, devices, architecture prep, PM
/// lock, CPUs, IRQs, system devices, device power. On failure the
/// matching rollback stage is executed before the error is reported, so
/// the caller sees a machine in its pre-atomic state.
pub fn go_atomic<P: Platform>(
    platform: &mut P,
    suspending: bool,
    late_cpu_hotplug: bool,
) -> std::result::Result<(), CycleResult> {
    let mut fail = |platform: &mut P, stage: AtomicStage, bit: CycleResult| {
        end_atomic(platform, stage, suspending, late_cpu_hotplug);
        Err(bit)
    };

    if suspending && platform.platform_begin().is_err() {
        return fail(platform, AtomicStage::PlatformEnd, CycleResult::PLATFORM_PREP_FAILED);
    }
    if platform.suspend_console().is_err() {
        return fail(platform, AtomicStage::ConsoleResume, CycleResult::CANT_SUSPEND);
    }
    if platform.suspend_devices(SuspendPhase::One).is_err() {
        return fail(platform, AtomicStage::DeviceResume, CycleResult::DEVICE_REFUSED);
    }
    if suspending && platform.arch_prepare().is_err() {
        return fail(platform, AtomicStage::ArchCleanup, CycleResult::ARCH_PREPARE_FAILED);
    }
    if platform.pm_lock().is_err() {
        return fail(platform, AtomicStage::PmUnlock, CycleResult::PM_SEM);
    }
    if late_cpu_hotplug && platform.disable_nonboot_cpus().is_err() {
        return fail(platform, AtomicStage::CpusUp, CycleResult::CPU_HOTPLUG_FAILED);
    }
    platform.irq_disable();
    if platform.suspend_devices(SuspendPhase::Two).is_err() {
        return fail(platform, AtomicStage::SysdevResume, CycleResult::SYSDEV_REFUSED);
    }
    if platform.power_down_devices().is_err() {
        return fail(platform, AtomicStage::DevicePowerUp, CycleResult::DEVICE_REFUSED);
    }
    debug!("atomic region entered");
    Ok(())
}

/// Unwind from `stage` through every later rollback label.
pub fn end_atomic<P: Platform>(
    platform: &mut P,
    stage: AtomicStage,
    suspending: bool,
    late_cpu_hotplug: bool,
) {
    let start = ROLLBACK_ORDER
        .iter()
        .position(|s| *s == stage)
        .unwrap_or(ROLLBACK_ORDER.len());
    for s in &ROLLBACK_ORDER[start..] {
        match s {
            AtomicStage::DevicePowerUp => platform.power_up_devices(),
            AtomicStage::SysdevResume => platform.resume_devices(SuspendPhase::Two),
            AtomicStage::IrqsOn => platform.irq_enable(),
            AtomicStage::CpusUp => {
                if late_cpu_hotplug {
                    platform.enable_nonboot_cpus();
                }
            }
            AtomicStage::PmUnlock => platform.pm_unlock(),
            AtomicStage::ArchCleanup => {
                if suspending {
                    platform.arch_cleanup();
                }
            }
            AtomicStage::DeviceResume => platform.resume_devices(SuspendPhase::One),
            AtomicStage::ConsoleResume => platform.resume_console(),
            AtomicStage::PlatformEnd => {
                if suspending {
                    platform.platform_end();
                }
            }
        }
    }
}

fn copy_page_words(from: &[u8; PAGE_SIZE], to: &mut [u8; PAGE_SIZE]) {
    // One word at a time from the highest word downward; a bulk page copy
    // could touch FPU state and change the preempt count under us.
    for w in (0..PAGE_SIZE / 8).rev() {
        to[w * 8..(w + 1) * 8].copy_from_slice(&from[w * 8..(w + 1) * 8]);
    }
}

/// The atomic copy: walk pageset-1 and its copy reserve in lock-step and
/// duplicate every page. Returns the number of pages copied.
pub fn copy_pageset1<H: MemoryHost>(host: &mut H, maps: &mut PageMaps) -> Result<u64> {
    maps.pageset1.seek(0);
    maps.pageset1_copy.seek(0);
    let mut copied = 0u64;
    let mut from = [0u8; PAGE_SIZE];
    let mut to = [0u8; PAGE_SIZE];
    loop {
        let src = maps.pageset1.next_pfn();
        let dst = maps.pageset1_copy.next_pfn();
        match (src == PFN_END, dst == PFN_END) {
            (true, true) => break,
            (false, false) => {}
            _ => return Err(SnapshotError::Corrupt("pageset and copy reserve out of step")),
        }
        host.read_page(src, &mut from)?;
        copy_page_words(&from, &mut to);
        host.write_page(dst, &to)?;
        copied += 1;
    }
    Ok(copied)
}

/// Overwrite every original frame from its copy. The portable half of the
/// restore; the trampoline invokes this for the normal-zone list, the
/// engine runs it directly for high memory.
pub fn copyback<H: MemoryHost>(host: &mut H, entries: &[RestoreEntry]) -> Result<()> {
    let mut from = [0u8; PAGE_SIZE];
    let mut to = [0u8; PAGE_SIZE];
    for entry in entries {
        host.read_page(entry.copy_pfn, &mut from)?;
        copy_page_words(&from, &mut to);
        host.write_page(entry.orig_pfn, &to)?;
    }
    Ok(())
}
