//! Integration test: end-to-end replay on the null driver
//!
//! Builds traces in memory with TraceWriter, replays them through the full
//! dispatch core and checks what the driver ended up seeing.

use std::io::Cursor;

use vkr_common::logging::try_init_test_logging;
use vkr_core::{DeferPolicy, FrameSettings, Lookup, ReplayConfig};
use vkr_replay::*;
use vkr_trace::*;

const INSTANCE: u64 = 0x1000;
const PHYSICAL_DEVICE: u64 = 0x2000;
const DEVICE: u64 = 0x3000;
const QUEUE: u64 = 0x4000;
const SURFACE: u64 = 0x5000;
const SWAPCHAIN: u64 = 0x6000;
const MEMORY: u64 = 0x7000;
const BUFFER: u64 = 0x8000;
const COMMAND_POOL: u64 = 0x9000;
const COMMAND_BUFFER: u64 = 0xA000;

const ALLOCATION_SIZE: u64 = 4096;

fn header() -> TraceHeader {
    TraceHeader::for_host(vec![GpuInfo {
        vendor_id: 0x10DE,
        device_id: 0x2684,
        driver_version: 0x0220_8000,
    }])
}

fn payload() -> Vec<u8> {
    (0..ALLOCATION_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Instance, device, swapchain. The trace GPU has three memory types; the
/// third (host visible, coherent, cached) only exists at index 3 on the
/// null device.
fn setup<W: std::io::Write>(w: &mut TraceWriter<W>) {
    w.write_call(EntryPoint::CreateInstance, 0, &[
        Arg::string("demo"),
        Arg::Value(1),
        Arg::string("engine"),
        Arg::Value(1),
        Arg::Value(1 << 22),
        Arg::str_list(&[]),
        Arg::str_list(&["VK_KHR_surface", "VK_KHR_xcb_surface"]),
        Arg::Value(INSTANCE),
    ])
    .unwrap();
    w.write_call(EntryPoint::EnumeratePhysicalDevices, 0, &[
        Arg::Value(INSTANCE),
        Arg::Values(vec![PHYSICAL_DEVICE]),
    ])
    .unwrap();
    w.write_call(EntryPoint::GetPhysicalDeviceProperties, 0, &[
        Arg::Value(PHYSICAL_DEVICE),
        Arg::Value(1 << 22),
        Arg::Value(0x0220_8000),
        Arg::Value(0x10DE),
        Arg::Value(0x2684),
        Arg::Value(2),
        Arg::string("trace gpu"),
    ])
    .unwrap();
    w.write_call(EntryPoint::GetPhysicalDeviceQueueFamilyProperties, 0, &[
        Arg::Value(PHYSICAL_DEVICE),
        Arg::Records(vec![vec![Arg::Value(0x7), Arg::Value(1), Arg::Value(64)]]),
    ])
    .unwrap();
    w.write_call(EntryPoint::GetPhysicalDeviceMemoryProperties, 0, &[
        Arg::Value(PHYSICAL_DEVICE),
        Arg::Records(vec![
            vec![Arg::Value(0x1), Arg::Value(0)],
            vec![Arg::Value(0x6), Arg::Value(1)],
            vec![Arg::Value(0xE), Arg::Value(1)],
        ]),
        Arg::Records(vec![
            vec![Arg::Value(1 << 30), Arg::Value(1)],
            vec![Arg::Value(1 << 28), Arg::Value(0)],
        ]),
    ])
    .unwrap();
    w.write_call(EntryPoint::CreateDevice, 0, &[
        Arg::Value(PHYSICAL_DEVICE),
        Arg::Records(vec![vec![
            Arg::Value(0),
            Arg::Value(0),
            Arg::Bytes(1.0f32.to_ne_bytes().to_vec()),
        ]]),
        Arg::str_list(&["VK_KHR_swapchain"]),
        Arg::Bytes(Vec::new()),
        Arg::Value(DEVICE),
    ])
    .unwrap();
    w.write_call(EntryPoint::GetDeviceQueue, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(0),
        Arg::Value(0),
        Arg::Value(QUEUE),
    ])
    .unwrap();
    w.write_call(EntryPoint::CreateSurfaceKhr, 0, &[
        Arg::Value(INSTANCE),
        Arg::Value(640),
        Arg::Value(480),
        Arg::Value(SURFACE),
    ])
    .unwrap();
    w.write_call(EntryPoint::CreateSwapchainKhr, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(SURFACE),
        Arg::Value(3),
        Arg::Value(44),
        Arg::Value(0),
        Arg::Value(640),
        Arg::Value(480),
        Arg::Value(1),
        Arg::Value(0x10),
        Arg::Value(0),
        Arg::Values(Vec::new()),
        Arg::Value(1),
        Arg::Value(1),
        Arg::Value(2),
        Arg::Value(1),
        Arg::Value(NULL_HANDLE),
        Arg::Value(SWAPCHAIN),
    ])
    .unwrap();
}

/// Allocate from trace memory type 2, fill it through a mapping, then bind
/// a buffer to it.
fn upload<W: std::io::Write>(w: &mut TraceWriter<W>) {
    w.write_call(EntryPoint::AllocateMemory, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(ALLOCATION_SIZE),
        Arg::Value(2),
        Arg::Value(MEMORY),
    ])
    .unwrap();
    w.write_call(EntryPoint::MapMemory, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(MEMORY),
        Arg::Value(0),
        Arg::Value(u64::MAX),
        Arg::Value(0),
        Arg::Value(0x7fff_0000),
    ])
    .unwrap();
    w.write_call(EntryPoint::UnmapMemory, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(MEMORY),
        Arg::Bytes(payload()),
    ])
    .unwrap();
    w.write_call(EntryPoint::CreateBuffer, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(0),
        Arg::Value(ALLOCATION_SIZE),
        Arg::Value(0x80),
        Arg::Value(0),
        Arg::Values(Vec::new()),
        Arg::Value(BUFFER),
    ])
    .unwrap();
    w.write_call(EntryPoint::BindBufferMemory, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(BUFFER),
        Arg::Value(MEMORY),
        Arg::Value(0),
    ])
    .unwrap();
}

fn frame<W: std::io::Write>(w: &mut TraceWriter<W>, image_index: u64) {
    w.write_call(EntryPoint::AcquireNextImageKhr, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(SWAPCHAIN),
        Arg::Value(u64::MAX),
        Arg::Value(NULL_HANDLE),
        Arg::Value(NULL_HANDLE),
        Arg::Value(image_index),
    ])
    .unwrap();
    w.write_call(EntryPoint::QueuePresentKhr, 0, &[
        Arg::Value(QUEUE),
        Arg::Values(Vec::new()),
        Arg::Values(vec![SWAPCHAIN]),
        Arg::Values(vec![image_index]),
    ])
    .unwrap();
}

fn trace(frames: u64) -> Vec<u8> {
    try_init_test_logging();
    let mut w = TraceWriter::new(Vec::new(), &header()).unwrap();
    setup(&mut w);
    upload(&mut w);
    for i in 0..frames {
        frame(&mut w, i % 3);
    }
    w.finish().unwrap()
}

fn replay_memory(replayer: &Replayer<NullDriver>) -> u64 {
    match replayer.context().objects.lookup(ObjectKind::DeviceMemory, MEMORY) {
        Lookup::Mapped(replay) => replay,
        other => panic!("trace memory not mapped: {other:?}"),
    }
}

#[test]
fn test_three_frames_replay_cleanly() {
    let mut store = TraceStore::from_reader(Cursor::new(trace(3))).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &ReplayConfig::default());
    let stats = replayer.run(&mut store).unwrap();

    assert_eq!(stats.frames, 3);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.mismatches, 0);
    assert_eq!(stats.packets, stats.replayed);
    assert_eq!(replayer.current_frame(), 3);

    let memory = replay_memory(&replayer);
    let driver = replayer.driver();
    assert_eq!(driver.memory_type_of(memory), Some(3));
    assert_eq!(driver.memory_contents(memory), Some(payload().as_slice()));
    assert_eq!(driver.mapped_range(memory), None);
    assert_eq!(driver.count_calls(EntryPoint::QueuePresentKhr), 3);
    assert!(driver.foreign().is_empty(), "foreign handles: {:?}", driver.foreign());
}

#[test]
fn test_deferred_allocation_uploads_on_bind() {
    let mut config = ReplayConfig::default();
    config.memory.defer_allocations = DeferPolicy::Always;
    let mut store = TraceStore::from_reader(Cursor::new(trace(1))).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &config);
    let stats = replayer.run(&mut store).unwrap();

    assert_eq!(stats.skipped, 0);
    let memory = replay_memory(&replayer);
    let driver = replayer.driver();
    assert_eq!(driver.live_allocations(), 1);
    assert_eq!(driver.memory_type_of(memory), Some(3));
    assert_eq!(driver.memory_contents(memory), Some(payload().as_slice()));
    assert!(driver.foreign().is_empty());
}

#[test]
fn test_unknown_command_buffer_is_skipped() {
    try_init_test_logging();
    let mut w = TraceWriter::new(Vec::new(), &header()).unwrap();
    setup(&mut w);
    w.write_call(EntryPoint::CmdDraw, 0, &[
        Arg::Value(0xBAD),
        Arg::Value(3),
        Arg::Value(1),
        Arg::Value(0),
        Arg::Value(0),
    ])
    .unwrap();
    frame(&mut w, 0);
    let bytes = w.finish().unwrap();

    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &ReplayConfig::default());
    let stats = replayer.run(&mut store).unwrap();

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.frames, 1);
    assert_eq!(replayer.driver().count_calls(EntryPoint::CmdDraw), 0);
    assert!(replayer.driver().foreign().is_empty());
}

#[test]
fn test_bodies_restored_after_dispatch() {
    let mut store = TraceStore::from_reader(Cursor::new(trace(2))).unwrap();
    let mut dispatcher = Dispatcher::new(NullDriver::default(), &ReplayConfig::default());
    while let Some(mut packet) = store.next_packet().unwrap() {
        let before = packet.body.clone();
        let outcome = dispatcher.dispatch(&mut packet).unwrap();
        assert!(!outcome.is_skipped(), "{}: {outcome:?}", packet.name());
        assert_eq!(packet.body, before, "{} body not restored", packet.name());
    }
}

#[test]
fn test_failed_instance_creation_is_fatal() {
    let mut driver = NullDriver::default();
    driver.fail_on(EntryPoint::CreateInstance, ash::vk::Result::ERROR_INCOMPATIBLE_DRIVER);
    let mut store = TraceStore::from_reader(Cursor::new(trace(1))).unwrap();
    let mut replayer = Replayer::new(driver, &ReplayConfig::default());
    let err = replayer.run(&mut store).unwrap_err();
    assert!(matches!(
        err,
        ReplayError::Device {
            entry: EntryPoint::CreateInstance,
            ..
        }
    ));
}

/// A CreateInstance the application saw fail, e.g. while probing for an
/// optional layer, before the real one.
fn failed_layer_instance<W: std::io::Write>(w: &mut TraceWriter<W>) {
    w.write_call(EntryPoint::CreateInstance, ash::vk::Result::ERROR_LAYER_NOT_PRESENT.as_raw(), &[
        Arg::string("demo"),
        Arg::Value(1),
        Arg::string("engine"),
        Arg::Value(1),
        Arg::Value(1 << 22),
        Arg::str_list(&["VK_LAYER_optional_overlay"]),
        Arg::str_list(&[]),
        Arg::Value(NULL_HANDLE),
    ])
    .unwrap();
}

#[test]
fn test_instance_failure_seen_at_capture_is_not_fatal() {
    try_init_test_logging();
    let mut w = TraceWriter::new(Vec::new(), &header()).unwrap();
    failed_layer_instance(&mut w);
    setup(&mut w);
    frame(&mut w, 0);
    let bytes = w.finish().unwrap();

    let mut driver = NullDriver::default();
    driver.fail_next(EntryPoint::CreateInstance, ash::vk::Result::ERROR_LAYER_NOT_PRESENT);
    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    let mut replayer = Replayer::new(driver, &ReplayConfig::default());
    let stats = replayer.run(&mut store).unwrap();

    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.mismatches, 0);
    assert_eq!(stats.frames, 1);
    assert_eq!(replayer.driver().count_calls(EntryPoint::CreateInstance), 2);
    assert!(replayer.driver().foreign().is_empty());
}

#[test]
fn test_instance_failure_seen_only_at_capture_is_a_mismatch() {
    try_init_test_logging();
    let mut w = TraceWriter::new(Vec::new(), &header()).unwrap();
    failed_layer_instance(&mut w);
    setup(&mut w);
    let bytes = w.finish().unwrap();

    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &ReplayConfig::default());
    let stats = replayer.run(&mut store).unwrap();

    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.mismatches, 1);
    assert!(matches!(
        replayer.context().objects.lookup(ObjectKind::Instance, INSTANCE),
        Lookup::Mapped(_)
    ));
}

#[test]
fn test_injected_failure_counts_as_mismatch() {
    let mut driver = NullDriver::default();
    driver.fail_on(EntryPoint::QueuePresentKhr, ash::vk::Result::ERROR_OUT_OF_DATE_KHR);
    let mut store = TraceStore::from_reader(Cursor::new(trace(2))).unwrap();
    let mut replayer = Replayer::new(driver, &ReplayConfig::default());
    let stats = replayer.run(&mut store).unwrap();
    assert_eq!(stats.mismatches, 2);
    assert_eq!(stats.frames, 2);
}

#[test]
fn test_looping_needs_rewindable_store() {
    let mut config = ReplayConfig::default();
    config.frames.num_loops = 2;
    let mut store = StreamStore::from_reader(Cursor::new(trace(2))).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &config);
    assert!(matches!(replayer.run(&mut store), Err(ReplayError::Config(_))));
}

#[test]
fn test_frame_range_loops() {
    let mut config = ReplayConfig::default();
    config.frames = FrameSettings {
        loop_start_frame: 1,
        loop_end_frame: 2,
        num_loops: 2,
    };
    let mut store = TraceStore::from_reader(Cursor::new(trace(3))).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &config);
    let stats = replayer.run(&mut store).unwrap();

    assert_eq!(stats.frames, 5);
    assert_eq!(stats.loops, 2);
    assert_eq!(stats.skipped, 0);
    assert_eq!(replayer.driver().count_calls(EntryPoint::QueuePresentKhr), 5);
}

#[test]
fn test_preloaded_store_replays_same_stream() {
    let mut file = TraceStore::from_reader(Cursor::new(trace(3))).unwrap();
    let mut preloaded = PreloadedStore::load(&mut file).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &ReplayConfig::default());
    let stats = replayer.run(&mut preloaded).unwrap();
    assert_eq!(stats.packets, preloaded.len() as u64);
    assert_eq!(stats.frames, 3);
}

/// Record `COMMAND_BUFFER` from a fresh pool and submit it to `QUEUE`.
fn submit<W: std::io::Write>(w: &mut TraceWriter<W>) {
    w.write_call(EntryPoint::CreateCommandPool, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(0),
        Arg::Value(0),
        Arg::Value(COMMAND_POOL),
    ])
    .unwrap();
    w.write_call(EntryPoint::AllocateCommandBuffers, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(COMMAND_POOL),
        Arg::Value(0),
        Arg::Values(vec![COMMAND_BUFFER]),
    ])
    .unwrap();
    w.write_call(EntryPoint::BeginCommandBuffer, 0, &[Arg::Value(COMMAND_BUFFER), Arg::Value(0)])
        .unwrap();
    w.write_call(EntryPoint::EndCommandBuffer, 0, &[Arg::Value(COMMAND_BUFFER)])
        .unwrap();
    w.write_call(EntryPoint::QueueSubmit, 0, &[
        Arg::Value(QUEUE),
        Arg::Records(vec![vec![
            Arg::Values(Vec::new()),
            Arg::Values(Vec::new()),
            Arg::Values(vec![COMMAND_BUFFER]),
            Arg::Values(Vec::new()),
        ]]),
        Arg::Value(NULL_HANDLE),
    ])
    .unwrap();
}

#[test]
fn test_write_submit_present_destroy() {
    try_init_test_logging();
    let mut w = TraceWriter::new(Vec::new(), &header()).unwrap();
    setup(&mut w);
    w.write_call(EntryPoint::AllocateMemory, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(ALLOCATION_SIZE),
        Arg::Value(2),
        Arg::Value(MEMORY),
    ])
    .unwrap();
    w.write_call(EntryPoint::MapMemory, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(MEMORY),
        Arg::Value(0),
        Arg::Value(u64::MAX),
        Arg::Value(0),
        Arg::Value(0x7fff_0000),
    ])
    .unwrap();
    w.write_call(EntryPoint::UnmapMemory, 0, &[
        Arg::Value(DEVICE),
        Arg::Value(MEMORY),
        Arg::Bytes(payload()),
    ])
    .unwrap();
    submit(&mut w);
    for i in 0..3 {
        frame(&mut w, i);
    }
    w.write_call(EntryPoint::DestroyDevice, 0, &[Arg::Value(DEVICE)]).unwrap();
    let bytes = w.finish().unwrap();

    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    let mut replayer = Replayer::new(NullDriver::default(), &ReplayConfig::default());
    let stats = replayer.run(&mut store).unwrap();

    assert_eq!(stats.frames, 3);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.mismatches, 0);

    let memory = replay_memory(&replayer);
    let ctx = replayer.context();
    assert_eq!(ctx.objects.lookup(ObjectKind::Device, DEVICE), Lookup::Missing);
    assert_eq!(ctx.owner(ObjectKind::Queue, QUEUE), None);
    assert_eq!(ctx.owner(ObjectKind::CommandBuffer, COMMAND_BUFFER), None);
    assert_eq!(ctx.owner(ObjectKind::DeviceMemory, MEMORY), None);

    let driver = replayer.driver();
    assert_eq!(driver.memory_type_of(memory), Some(3));
    assert_eq!(driver.memory_contents(memory), Some(payload().as_slice()));
    assert_eq!(driver.count_calls(EntryPoint::QueueSubmit), 1);
    assert_eq!(driver.count_calls(EntryPoint::DestroyDevice), 1);
    assert!(driver.foreign().is_empty(), "foreign handles: {:?}", driver.foreign());
}
