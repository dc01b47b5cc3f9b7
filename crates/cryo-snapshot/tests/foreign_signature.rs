#![cfg(not(target_arch = "wasm32"))]

use cryo_snapshot::test_util::{TestHost, TestPlatform};
use cryo_snapshot::{
    CycleResult, Engine, EngineConfig, ImagePresence, SwapWriter, Writer, PAGE_SIZE,
};
use cryo_storage::{MemBackend, StorageBackend};

fn engine_with_sector0(
    sector0: &[u8],
) -> Engine<TestHost, TestPlatform> {
    let mut backend = MemBackend::new(64 * PAGE_SIZE as u64);
    let mut page = vec![0u8; PAGE_SIZE];
    page[..sector0.len()].copy_from_slice(sector0);
    backend.write_at(0, &page).unwrap();

    let mut config = EngineConfig::default();
    config.apply_option("resume=swap:/dev/vda2").unwrap();

    let mut engine = Engine::new(TestHost::flat(64), TestPlatform::new(), config);
    let mut writer = SwapWriter::new();
    writer
        .add_swap_device("/dev/vda2", 1, Box::new(backend))
        .unwrap();
    engine.registry_mut().register_writer(Box::new(writer)).unwrap();
    engine
}

/// Another hibernator's signature is identified and declined;
/// to us that is "no image".
#[test]
fn foreign_signature_is_reported_not_claimed() {
    let mut engine = engine_with_sector0(b"S1SUSPEND");

    engine
        .registry_mut()
        .activate_writer_for("swap:/dev/vda2", true)
        .unwrap();
    let presence = engine
        .registry_mut()
        .active_writer_mut()
        .unwrap()
        .image_exists()
        .unwrap();
    assert_eq!(presence, ImagePresence::Foreign("swsusp"));

    // The cycle controller treats it as no image at all.
    let result = engine.resume();
    assert_eq!(result, CycleResult::empty());
    assert!(!engine.platform().called("freeze_tasks"));
    assert!(!engine.platform().called("restore_jump"));
}

#[test]
fn uswsusp_signature_is_also_foreign() {
    let mut engine = engine_with_sector0(b"ULSUSPEND");
    engine
        .registry_mut()
        .activate_writer_for("swap:/dev/vda2", true)
        .unwrap();
    assert_eq!(
        engine
            .registry_mut()
            .active_writer_mut()
            .unwrap()
            .image_exists()
            .unwrap(),
        ImagePresence::Foreign("uswsusp")
    );
}

#[test]
fn plain_swap_is_no_image() {
    let mut engine = engine_with_sector0(b"SWAPSPACE2");
    let result = engine.resume();
    assert_eq!(result, CycleResult::empty());
}
