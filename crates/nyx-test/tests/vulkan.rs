//! The same flows on real hardware.
//!
//! These tests require a Vulkan 1.3 GPU and are skipped by default.

use nyx_gpu::{Array, ArrayFlags, BackendKind, Chain, ChainType, Context};

fn context() -> Context {
    Context::builder()
        .app_name("nyx-test")
        .backend(BackendKind::Vulkan)
        .presentation(false)
        .validation(true)
        .build()
        .unwrap()
}

#[test]
#[ignore = "Requires GPU hardware"]
fn vulkan_context_creation() {
    let context = context();
    assert!(context.device_count() > 0);
    assert!(!context.device(0).unwrap().info().name.is_empty());
}

#[test]
#[ignore = "Requires GPU hardware"]
fn vulkan_array_copy_and_readback() {
    let context = context();
    let device = context.device(0).unwrap();

    let mut src = Array::<u32>::new();
    src.initialize(device, 4, true, ArrayFlags::default()).unwrap();
    src.write_synced(0, &[1, 2, 3, 4]).unwrap();
    let mut dst = Array::<u32>::new();
    dst.initialize(device, 4, false, ArrayFlags::default()).unwrap();

    let mut chain = Chain::new();
    chain.initialize(device, ChainType::Transfer).unwrap();
    chain.copy_array(&src, &dst, 0, 0, 0).unwrap();
    let readback = chain.copy_to_host(&dst, 0, 0, 0).unwrap();
    chain.submit().unwrap();
    chain.synchronize().unwrap();

    assert_eq!(readback.take(), Some(vec![1, 2, 3, 4]));
}
