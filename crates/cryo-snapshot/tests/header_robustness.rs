#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};

use cryo_snapshot::test_util::{TestHost, TestPlatform};
use cryo_snapshot::{
    ChecksumFilter, CompressionFilter, CycleResult, Engine, EngineConfig, PageKind, SwapWriter,
    PAGE_SIZE,
};
use cryo_storage::{Result as StorageResult, StorageBackend, StorageError};

#[derive(Clone)]
struct SharedBackend(Arc<Mutex<Vec<u8>>>);

impl SharedBackend {
    fn new(len: u64) -> Self {
        Self(Arc::new(Mutex::new(vec![0u8; len as usize])))
    }

    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    fn flip(&self, offset: usize) {
        self.0.lock().unwrap()[offset] ^= 0xFF;
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

fn build_engine(host: TestHost, store: SharedBackend) -> Engine<TestHost, TestPlatform> {
    let mut config = EngineConfig::default();
    config.apply_option("resume=swap:/dev/vda2").unwrap();
    config.apply_option("extra_pages_allowance=16").unwrap();

    let mut engine = Engine::new(host, TestPlatform::new(), config);
    let mut writer = SwapWriter::new();
    writer
        .add_swap_device("/dev/vda2", 7, Box::new(store))
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

fn image_host() -> TestHost {
    let mut host = TestHost::flat(400);
    host.set_kind_range(50, 114, PageKind::KernelData);
    host.set_kind_range(200, 232, PageKind::PageCache);
    let mut counter = 0u32;
    for pfn in 50..114u64 {
        counter = counter.wrapping_add(1);
        let seed = counter;
        host.fill_page(pfn, move |i| (seed as usize + i * 7) as u8);
    }
    host
}

fn written_store() -> SharedBackend {
    let store = SharedBackend::new(512 * PAGE_SIZE as u64);
    let mut engine = build_engine(image_host(), store.clone());
    let result = engine.hibernate();
    assert!(!result.is_failure(), "setup hibernate failed: {result:?}");
    store
}

/// Identical inputs produce identical images, apart from the wall-clock
/// I/O accounting fields in the fixed record.
#[test]
fn identical_cycles_write_identical_images() {
    let a = written_store();
    let b = written_store();

    let mut bytes_a = a.bytes();
    let mut bytes_b = b.bytes();

    // The io_stats block sits 144 bytes into the fixed record, which
    // starts at the first header page (stream page 0 = slot 1).
    let stats_at = PAGE_SIZE + 144;
    bytes_a[stats_at..stats_at + 32].fill(0);
    bytes_b[stats_at..stats_at + 32].fill(0);

    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn inspect_reports_header_and_modules() {
    let store = written_store();
    let mut engine = build_engine(image_host(), store);

    let info = engine.inspect().unwrap();
    assert_eq!(info.header.pagedir1_size, 64);
    assert_eq!(info.header.pageset2_size, 32);
    assert_eq!(info.header.cpu_count, 4);
    assert_eq!(info.header.page_size, PAGE_SIZE as u32);
    assert_eq!(info.header.os_version, "6.1.0-cryo");
    assert_eq!(info.header.root_dev, 0x0801);
    assert_eq!(
        info.modules,
        vec!["lz4".to_owned(), "checksum".to_owned(), "swapwriter".to_owned()]
    );
    assert!(info.pagedir1_extents >= 1);
}

/// A corrupt header magic refuses the resume cleanly; nothing is
/// restored, nothing panics.
#[test]
fn corrupt_header_magic_refuses_resume() {
    let store = written_store();
    store.flip(PAGE_SIZE); // first byte of the fixed record

    let mut engine = build_engine(TestHost::flat(400), store.clone());
    let result = engine.resume();
    assert!(result.contains(CycleResult::PRE_RESTORE_FAILED), "{result:?}");
    assert!(!engine.platform().called("restore_jump"));
    // The image signature is still in place; nothing was invalidated.
    assert_eq!(store.bytes()[0], b'Z');
}

/// A mangled extent chain in the header is caught by the redundancy
/// checks.
#[test]
fn corrupt_extent_chain_refuses_resume() {
    let store = written_store();
    // Third byte of pagedir-1's extent count, straight after the fixed
    // record: the count becomes implausible.
    store.flip(PAGE_SIZE + 192 + 2);

    let mut engine = build_engine(TestHost::flat(400), store);
    let result = engine.resume();
    assert!(result.contains(CycleResult::PRE_RESTORE_FAILED), "{result:?}");
    assert!(!engine.platform().called("freeze_tasks"));
}

/// Payload corruption discovered mid-stream is fatal: the image is
/// unusable and live memory may already be patched.
#[test]
#[should_panic(expected = "unusable")]
fn corrupt_payload_panics_during_resume() {
    let store = written_store();
    // Flip a byte near the end of the written stream; the checksum filter
    // will catch it while pages are being read back.
    let bytes = store.bytes();
    let last_nonzero = bytes
        .iter()
        .rposition(|&b| b != 0)
        .expect("image has content");
    store.flip(last_nonzero);

    let mut engine = build_engine(TestHost::flat(400), store);
    let _ = engine.resume();
}
