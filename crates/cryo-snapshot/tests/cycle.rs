#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};

use cryo_snapshot::test_util::{TestHost, TestPlatform};
use cryo_snapshot::{
    ChecksumFilter, CompressionFilter, CycleResult, Engine, EngineConfig, ImagePresence,
    PageKind, SwapWriter, Writer, PAGE_SIZE,
};
use cryo_storage::{Result as StorageResult, StorageBackend, StorageError};

/// A `MemBackend` look-alike whose bytes outlive the engine, so a second
/// engine can "boot" against the same device.
#[derive(Clone)]
struct SharedBackend(Arc<Mutex<Vec<u8>>>);

impl SharedBackend {
    fn new(len: u64) -> Self {
        Self(Arc::new(Mutex::new(vec![0u8; len as usize])))
    }

    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    fn patch(&self, offset: usize, f: impl Fn(&mut u8)) {
        f(&mut self.0.lock().unwrap()[offset]);
    }
}

impl StorageBackend for SharedBackend {
    fn len(&self) -> StorageResult<u64> {
        Ok(self.0.lock().unwrap().len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let data = self.0.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(StorageError::OutOfBounds {
                offset: offset as u64,
                len: buf.len(),
                device_len: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        let mut data = self.0.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(StorageError::OutOfBounds {
                offset: offset as u64,
                len: buf.len(),
                device_len: data.len() as u64,
            });
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

const SWAP_DEV_ID: u32 = 0x0103;

fn config(extra_options: &[&str]) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.apply_option("resume=swap:/dev/vda2").unwrap();
    config.apply_option("extra_pages_allowance=32").unwrap();
    for option in extra_options {
        config.apply_option(option).unwrap();
    }
    config
}

fn engine(
    host: TestHost,
    platform: TestPlatform,
    store: SharedBackend,
    extra_options: &[&str],
) -> Engine<TestHost, TestPlatform> {
    let mut engine = Engine::new(host, platform, config(extra_options));
    let mut writer = SwapWriter::new();
    writer
        .add_swap_device("/dev/vda2", SWAP_DEV_ID, Box::new(store))
        .unwrap();
    let registry = engine.registry_mut();
    registry
        .register_filter(Box::new(CompressionFilter::new()))
        .unwrap();
    registry
        .register_filter(Box::new(ChecksumFilter::new()))
        .unwrap();
    registry.register_writer(Box::new(writer)).unwrap();
    engine
}

const PS1_RANGE: std::ops::Range<u64> = 100..228; // 128 pages
const PS2_RANGE: std::ops::Range<u64> = 300..364; // 64 pages

/// A small synthetic image: pageset-1 patterned `0xAA55 ^ pfn`,
/// pageset-2 filled with `0x12345678`.
fn synthetic_host() -> TestHost {
    let mut host = TestHost::flat(600);
    for pfn in PS1_RANGE {
        host.set_kind(pfn, PageKind::KernelData);
        let pattern = (0xAA55u64 ^ pfn).to_le_bytes();
        host.fill_page(pfn, move |i| pattern[i % 8]);
    }
    for pfn in PS2_RANGE {
        host.set_kind(pfn, PageKind::PageCache);
        let pattern = 0x12345678u32.to_le_bytes();
        host.fill_page(pfn, move |i| pattern[i % 4]);
    }
    host
}

/// Freezer-test mode: freeze, classify, thaw, and write nothing.
#[test]
fn freezer_test_cycle_touches_no_storage() {
    let store = SharedBackend::new(256 * PAGE_SIZE as u64);
    let mut engine = engine(
        synthetic_host(),
        TestPlatform::new(),
        store.clone(),
        &["freezer_test=on"],
    );

    let result = engine.hibernate();
    assert!(!result.is_failure(), "result: {result:?}");

    let platform = engine.platform();
    assert!(platform.called("freeze_tasks"));
    assert!(platform.called("thaw_tasks"));
    assert!(!platform.called("snapshot_jump"));
    assert!(!platform.called("power_off"));

    // Disk unchanged: no signature, no data.
    assert!(store.bytes().iter().all(|&b| b == 0));
}

/// Full hibernate to the in-memory device, then resume into a
/// scrambled machine and verify both pagesets byte-for-byte.
#[test]
fn hibernate_then_resume_restores_memory_exactly() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut first = engine(
        synthetic_host(),
        TestPlatform::new(),
        store.clone(),
        &[],
    );

    let result = first.hibernate();
    assert!(!result.is_failure(), "hibernate result: {result:?}");
    assert!(first.platform().called("snapshot_jump"));
    assert!(first.platform().called("power_off"));
    assert_eq!(first.io_stats().pages_written, 128 + 64);

    // Signature: our magic, header device id, header at sector 8.
    let bytes = store.bytes();
    assert_eq!(bytes[0], b'Z');
    assert_eq!(&bytes[1..5], &SWAP_DEV_ID.to_le_bytes());
    assert_eq!(bytes[5], 0);
    assert_eq!(&bytes[6..10], &8u32.to_le_bytes());

    // What memory must look like after resume.
    let expected: Vec<(u64, [u8; PAGE_SIZE])> = PS1_RANGE
        .chain(PS2_RANGE)
        .map(|pfn| (pfn, *first.host().page(pfn)))
        .collect();

    // "Reboot": fresh memory with the image regions scrambled.
    let mut cold_host = TestHost::flat(600);
    for pfn in PS1_RANGE.chain(PS2_RANGE) {
        cold_host.fill_page(pfn, |_| 0xFF);
    }
    let mut second = engine(cold_host, TestPlatform::new(), store.clone(), &[]);

    let result = second.resume();
    assert!(!result.is_failure(), "resume result: {result:?}");

    let platform = second.platform();
    assert!(platform.called("freeze_tasks"));
    assert!(platform.called("restore_jump"));
    assert!(platform.called("thaw_tasks"));

    for (pfn, page) in &expected {
        assert_eq!(
            second.host().page(*pfn),
            page,
            "pfn {pfn} not restored byte-for-byte"
        );
    }

    // Successful resume hands the device back to swap.
    let bytes = store.bytes();
    assert_eq!(&bytes[..10], b"SWAPSPACE2");
}

/// Resume with nothing on the device is a clean no-op.
#[test]
fn resume_without_image_is_silent() {
    let store = SharedBackend::new(64 * PAGE_SIZE as u64);
    let mut engine = engine(TestHost::flat(128), TestPlatform::new(), store, &[]);
    let result = engine.resume();
    assert_eq!(result, CycleResult::empty());
    assert!(!engine.platform().called("freeze_tasks"));
}

/// Keep-image powers down without re-reserving, and explicit
/// invalidation restores the swap signature.
#[test]
fn keep_image_then_invalidate() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut engine = engine(
        synthetic_host(),
        TestPlatform::new(),
        store.clone(),
        &[],
    );

    assert!(!engine.hibernate().is_failure());
    let reserved = engine
        .registry_mut()
        .active_writer_mut()
        .unwrap()
        .storage_allocated();
    assert!(reserved > 0);

    engine.config_mut().keep_image = true;
    let result = engine.hibernate();
    assert!(result.contains(CycleResult::KEPT_IMAGE));
    assert!(!result.is_failure());
    // Straight to powerdown: the reservation was not touched.
    assert_eq!(
        engine
            .registry_mut()
            .active_writer_mut()
            .unwrap()
            .storage_allocated(),
        reserved
    );
    assert_eq!(
        engine
            .platform()
            .calls()
            .iter()
            .filter(|c| *c == "power_off")
            .count(),
        2
    );
    // Image still intact.
    assert_eq!(store.bytes()[0], b'Z');

    engine.config_mut().keep_image = false;
    engine.remove_image().unwrap();
    assert_eq!(&store.bytes()[..10], b"SWAPSPACE2");
    assert_eq!(
        engine
            .registry_mut()
            .active_writer_mut()
            .unwrap()
            .image_exists()
            .unwrap(),
        ImagePresence::PlainSwap
    );
}

/// A device refusing to suspend unwinds the atomic region
/// precisely and leaves the machine running.
#[test]
fn device_suspend_refusal_unwinds_and_aborts() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut platform = TestPlatform::new();
    platform.fail_on("suspend_devices:1");
    let mut engine = engine(synthetic_host(), platform, store, &[]);

    let result = engine.hibernate();
    assert!(result.contains(CycleResult::DEVICE_REFUSED));
    assert!(result.contains(CycleResult::ABORTED));

    let calls = engine.platform().calls_after("suspend_devices:1");
    assert!(calls.contains(&"resume_devices:1".to_owned()));
    assert!(calls.contains(&"resume_console".to_owned()));
    assert!(calls.contains(&"thaw_tasks".to_owned()));
    assert!(calls.contains(&"enable_nonboot_cpus".to_owned()));
    assert!(!engine.platform().called("power_off"));

    // Memory still intact after the pageset-2 reload.
    let expected = synthetic_host();
    for pfn in PS1_RANGE.chain(PS2_RANGE) {
        assert_eq!(engine.host().page(pfn), expected.page(pfn));
    }
}

/// A busy PM mutex refuses the cycle outright.
#[test]
fn busy_pm_mutex_refuses_cycle() {
    let store = SharedBackend::new(64 * PAGE_SIZE as u64);
    let mut platform = TestPlatform::new();
    platform.set_pm_busy(true);
    let mut engine = engine(TestHost::flat(64), platform, store, &[]);
    let result = engine.hibernate();
    assert!(result.contains(CycleResult::PM_SEM));
    assert!(!engine.platform().called("freeze_tasks"));
}

/// A second resume attempt after an interrupted one is refused.
#[test]
fn interrupted_resume_is_not_retried() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut first = engine(
        synthetic_host(),
        TestPlatform::new(),
        store.clone(),
        &[],
    );
    assert!(!first.hibernate().is_failure());

    // Flag the image as already attempted, as a crashed resume would.
    store.patch(5, |b| *b |= 0x80);

    let mut second = engine(
        TestHost::flat(600),
        TestPlatform::new(),
        store.clone(),
        &[],
    );
    let result = second.resume();
    assert!(result.contains(CycleResult::ABORTED));
    // The image was not claimed or destroyed.
    assert_eq!(store.bytes()[0], b'Z');
}

/// When the primary location holds no image, the
/// alternate parameter is probed and restored from.
#[test]
fn alternate_image_location_is_probed() {
    let store_a = SharedBackend::new(256 * PAGE_SIZE as u64);
    let store_b = SharedBackend::new(512 * PAGE_SIZE as u64);

    let two_device_engine = |host: TestHost, resume: &str, alt: Option<&str>| {
        let mut config = EngineConfig::default();
        config.apply_option(&format!("resume={resume}")).unwrap();
        if let Some(alt) = alt {
            config
                .apply_option(&format!("alt_resume_param={alt}"))
                .unwrap();
        }
        config.apply_option("extra_pages_allowance=32").unwrap();
        let mut engine = Engine::new(host, TestPlatform::new(), config);
        let mut writer = SwapWriter::new();
        writer
            .add_swap_device("/dev/vda2", 1, Box::new(store_a.clone()))
            .unwrap();
        writer
            .add_swap_device("/dev/vdb2", 2, Box::new(store_b.clone()))
            .unwrap();
        let registry = engine.registry_mut();
        registry
            .register_filter(Box::new(CompressionFilter::new()))
            .unwrap();
        registry
            .register_filter(Box::new(ChecksumFilter::new()))
            .unwrap();
        registry.register_writer(Box::new(writer)).unwrap();
        engine
    };

    let mut first = two_device_engine(synthetic_host(), "swap:/dev/vdb2", None);
    assert!(!first.hibernate().is_failure());
    // Signature landed on the named resume device.
    assert_eq!(store_b.bytes()[0], b'Z');
    assert_eq!(store_a.bytes()[0], 0);

    let expected: Vec<(u64, [u8; PAGE_SIZE])> = PS1_RANGE
        .chain(PS2_RANGE)
        .map(|pfn| (pfn, *first.host().page(pfn)))
        .collect();

    let mut second = two_device_engine(
        TestHost::flat(600),
        "swap:/dev/vda2",
        Some("swap:/dev/vdb2"),
    );
    let result = second.resume();
    assert!(!result.is_failure(), "alt resume result: {result:?}");
    for (pfn, page) in &expected {
        assert_eq!(second.host().page(*pfn), page);
    }
}

/// A raised abort flag stops the cycle at the next boundary.
#[test]
fn abort_flag_stops_the_cycle() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut engine = engine(
        synthetic_host(),
        TestPlatform::new(),
        store.clone(),
        &[],
    );
    engine.abort_handle().set(CycleResult::empty());
    let result = engine.hibernate();
    assert!(result.contains(CycleResult::ABORTED));
    assert!(!engine.platform().called("snapshot_jump"));
    // Nothing made it to powerdown; the signature was never written.
    assert_ne!(store.bytes()[0], b'Z');
}

/// no_pageset2 folds everything into the atomic copy and still restores
/// byte-for-byte.
#[test]
fn no_pageset2_cycle_round_trips() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut first = engine(
        synthetic_host(),
        TestPlatform::new(),
        store.clone(),
        &["no_pageset2"],
    );
    let result = first.hibernate();
    assert!(!result.is_failure(), "hibernate: {result:?}");
    // Everything was captured atomically; nothing streamed as pageset-2.
    assert_eq!(first.io_stats().pages_written, 128 + 64);
    assert_eq!(first.maps().pageset2.count(), 0);

    let expected: Vec<(u64, [u8; PAGE_SIZE])> = PS1_RANGE
        .chain(PS2_RANGE)
        .map(|pfn| (pfn, *first.host().page(pfn)))
        .collect();

    let mut second = engine(
        TestHost::flat(600),
        TestPlatform::new(),
        store,
        &["no_pageset2"],
    );
    let result = second.resume();
    assert!(!result.is_failure(), "resume: {result:?}");
    for (pfn, page) in &expected {
        assert_eq!(second.host().page(*pfn), page);
    }
}

/// With late CPU hotplug the non-boot CPUs come down inside the atomic
/// region, after the PM lock and before interrupts go off.
#[test]
fn late_cpu_hotplug_moves_cpu_unplug_into_atomic_region() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut engine = engine(
        synthetic_host(),
        TestPlatform::new(),
        store,
        &["late_cpu_hotplug"],
    );
    assert!(!engine.hibernate().is_failure());

    let calls = engine.platform().calls();
    let pos = |name: &str| calls.iter().position(|c| c == name).unwrap();
    assert!(pos("freeze_tasks") < pos("disable_nonboot_cpus"));
    assert!(pos("pm_lock") < pos("disable_nonboot_cpus"));
    assert!(pos("disable_nonboot_cpus") < pos("irq_disable"));
}

/// Module debug info surfaces what the cycle did.
#[test]
fn debug_info_reports_compression_and_reservation() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut engine = engine(
        synthetic_host(),
        TestPlatform::new(),
        store,
        &[],
    );
    assert!(!engine.hibernate().is_failure());
    let info = engine.debug_info();
    assert!(info.contains("lz4:"), "{info}");
    assert!(info.contains("swapwriter:"), "{info}");
}

/// Reboot policy reaches the reboot hook instead of power-off.
#[test]
fn reboot_option_reboots() {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut engine = engine(
        synthetic_host(),
        TestPlatform::new(),
        store,
        &["reboot"],
    );
    assert!(!engine.hibernate().is_failure());
    assert!(engine.platform().called("reboot"));
    assert!(!engine.platform().called("power_off"));
}
