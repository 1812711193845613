//! End-to-end behavior on software devices.

use nyx_core::format::Rgba8;
use nyx_gpu::backend::MemoryType;
use nyx_gpu::{
    Array, ArrayFlags, Attachment, Chain, ChainType, ErrorCode, GpuError, HostConfig, Image,
    ImageFormat, ImageLayout, Memory, MemoryFlags, RenderPass, Subpass, VirtualWindow,
};
use nyx_test::HeadlessHarness;
use std::sync::Arc;
use std::time::Duration;

fn filled(harness: &HeadlessHarness, values: &[u32]) -> Array<u32> {
    let device = harness.device().unwrap();
    let mut array = Array::new();
    array
        .initialize(device, values.len(), true, ArrayFlags::default())
        .unwrap();
    array.write_synced(0, values).unwrap();
    array
}

#[test]
fn array_copy_between_device_buffers() {
    let harness = HeadlessHarness::new().unwrap();
    let device = harness.device().unwrap();
    let src = filled(&harness, &[1, 2, 3, 4]);
    let mut dst = Array::<u32>::new();
    dst.initialize(device, 4, true, ArrayFlags::default()).unwrap();

    let mut chain = Chain::new();
    chain.initialize(device, ChainType::Transfer).unwrap();
    chain.copy_array(&src, &dst, 0, 0, 0).unwrap();
    chain.submit().unwrap();
    chain.synchronize().unwrap();

    dst.sync_to_host().unwrap();
    assert_eq!(dst.to_vec(), vec![1, 2, 3, 4]);
    assert!(harness.reports().is_empty());
}

#[test]
fn image_upload_ends_shader_readable() {
    let harness = HeadlessHarness::new().unwrap();
    let device = harness.device().unwrap();
    let pixels = filled(&harness, &[0xff00_00ff, 0xff00_ff00, 0xffff_0000, 0xffff_ffff]);

    let mut image = Image::<Rgba8>::new();
    image.initialize(device, 2, 2, 1).unwrap();
    assert_eq!(image.byte_size(), 16);

    let mut chain = Chain::new();
    chain.initialize(device, ChainType::Graphics).unwrap();
    chain.transition(&image, ImageLayout::TransferDst).unwrap();
    chain.copy_array_to_image(&pixels, &image, 0, 0, 0).unwrap();
    chain.transition(&image, ImageLayout::ShaderRead).unwrap();
    chain.submit().unwrap();
    chain.synchronize().unwrap();

    assert_eq!(image.layout(), ImageLayout::ShaderRead);
    assert_eq!(image.byte_size(), 16);

    // Read the pixels back through a second buffer.
    let back = filled(&harness, &[0; 4]);
    chain.reset().unwrap();
    chain.begin().unwrap();
    chain.transition(&image, ImageLayout::TransferSrc).unwrap();
    chain.copy_image_to_array(&image, &back, 0, 0, 0).unwrap();
    chain.submit().unwrap();
    chain.synchronize().unwrap();
    back.sync_to_host().unwrap();
    assert_eq!(back.to_vec(), pixels.to_vec());
}

#[test]
fn concurrent_submissions_never_interleave() {
    let config = HostConfig::default().with_submit_latency(Duration::from_millis(2));
    let harness = HeadlessHarness::with_config(config, 1).unwrap();
    let device = harness.device().unwrap();
    let src = filled(&harness, &[7; 16]);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let src = src.clone();
            scope.spawn(move || {
                let mut dst = Array::<u32>::new();
                dst.initialize(device, 16, true, ArrayFlags::default()).unwrap();
                for _ in 0..5 {
                    let mut chain = Chain::new();
                    chain.initialize(device, ChainType::Transfer).unwrap();
                    chain.copy_array(&src, &dst, 0, 0, 0).unwrap();
                    chain.submit().unwrap();
                    chain.synchronize().unwrap();
                }
                dst.sync_to_host().unwrap();
                assert_eq!(dst.to_vec(), vec![7; 16]);
            });
        }
    });

    let stats = harness.stats(0).unwrap();
    assert_eq!(stats.max_concurrent_submits, 1);
    assert!(stats.submissions >= 20);
}

#[test]
fn recording_after_submit_is_rejected_and_reported() {
    let harness = HeadlessHarness::new().unwrap();
    let device = harness.device().unwrap();
    let src = filled(&harness, &[1, 2]);
    let dst = filled(&harness, &[0, 0]);

    let mut chain = Chain::new();
    chain.initialize(device, ChainType::Transfer).unwrap();
    chain.submit().unwrap();

    let err = chain.copy_array(&src, &dst, 0, 0, 0).unwrap_err();
    assert!(matches!(err, GpuError::InvalidChainState { .. }));
    assert_eq!(harness.codes(), vec![ErrorCode::InvalidChainState]);
    assert_eq!(harness.fatal_count(), 1);

    chain.synchronize().unwrap();
    chain.reset().unwrap();
    chain.begin().unwrap();
    chain.copy_array(&src, &dst, 0, 0, 0).unwrap();
}

#[test]
fn sub_allocation_that_does_not_fit_leaves_array_empty() {
    let harness = HeadlessHarness::new().unwrap();
    let device = harness.device().unwrap();
    let memory = Memory::allocate(device, 64, false, MemoryFlags::DEVICE_LOCAL).unwrap();

    let mut array = Array::<u32>::new();
    assert!(!array.initialize_in(&memory, 100, false, ArrayFlags::default()));
    assert!(array.handle().is_none());
    assert_eq!(array.byte_size(), 0);

    assert!(array.initialize_in(&memory, 8, false, ArrayFlags::default()));
    assert_eq!(array.byte_size(), 32);
}

#[test]
fn unmatched_memory_flags_allocate_nothing() {
    let config = HostConfig::default().with_memory_types(vec![MemoryType {
        flags: MemoryFlags::DEVICE_LOCAL,
        heap: 0,
    }]);
    let harness = HeadlessHarness::with_config(config, 1).unwrap();
    let device = harness.device().unwrap();

    let result = Memory::allocate(device, 256, false, MemoryFlags::HOST_SHARED);
    assert!(matches!(result, Err(GpuError::AllocationFailed(_))));
    assert_eq!(harness.stats(0).unwrap().live_allocations, 0);
}

#[test]
fn unmodified_round_trip_is_byte_identical() {
    let harness = HeadlessHarness::new().unwrap();
    let values: Vec<u32> = (0..64).map(|i| i * 0x0101_0101).collect();
    let array = filled(&harness, &values);

    array.sync_to_host().unwrap();
    array.sync_to_device().unwrap();
    array.sync_to_host().unwrap();
    assert_eq!(array.to_vec(), values);
    assert!(!array.dirty());
}

#[test]
fn window_resize_rebuilds_framebuffers() {
    let harness = HeadlessHarness::new().unwrap();
    let device = harness.device().unwrap();
    let window = Arc::new(VirtualWindow::new(64, 48));
    let id = harness.context().register_window(window.clone());

    let mut pass = RenderPass::new();
    pass.add_subpass(Subpass::new().with_attachment(Attachment::new(ImageFormat::Bgra8)));
    pass.initialize_for_window(device, id).unwrap();
    assert_eq!((pass.extent().width, pass.extent().height), (64, 48));
    assert!(!pass.present().unwrap());

    window.resize(80, 60);
    assert!(pass.present().unwrap());
    assert_eq!((pass.extent().width, pass.extent().height), (80, 60));
    assert!(!pass.present().unwrap());
}
