//! Integration tests for bindless descriptor bookkeeping
//!
//! Descriptor slots point back at buffers owned by a ResourceManager; these
//! tests check slots follow the buffers' lifetimes.
//! No GPU required.
//!
//! Run with: cargo test --test descriptor_integration_tests


use gpu_resource_core::gpucore::log::null_logger;
use gpu_resource_core::gpucore::{
    BufferDesc, BufferUsage, DescriptorHeapType, DescriptorTable, IndexAllocator,
    ResourceManager, ResourceManagerConfig,
};
use host_test_utils::HostFactory;

// ============================================================================
// BINDLESS WORKFLOW TESTS
// ============================================================================

#[test]
fn test_integration_slots_track_manager_buffers() {
    let factory = HostFactory::shared();
    let manager = ResourceManager::new(factory.clone(), ResourceManagerConfig::default(), null_logger()).unwrap();
    let heap: DescriptorTable = DescriptorTable::new(DescriptorHeapType::Resource, 64, null_logger());

    let desc = BufferDesc::new(2048, BufferUsage::STORAGE);
    let handles: Vec<_> = (0..4).map(|_| manager.create_buffer(&desc).unwrap()).collect();
    let slots: Vec<u32> = handles
        .iter()
        .enumerate()
        .map(|(i, handle)| {
            let buffer = manager.buffer(*handle).unwrap();
            heap.allocate_for(&format!("particles[{}]", i), &buffer).unwrap()
        })
        .collect();

    assert_eq!(heap.allocated_slots(), slots);
    assert!(heap.stale_slots().is_empty());

    // Pooled buffers are parked, not destroyed: the slot still resolves
    manager.destroy_buffer(handles[1]);
    assert!(heap.resource(slots[1]).is_some());

    // Trimming destroys the parked buffer and leaves the slot dangling
    manager.trim_pools(0);
    // HostFactory keeps its own reference until destroy; after that nothing does
    assert_eq!(heap.stale_slots(), vec![slots[1]]);
    assert!(heap.free(slots[1]));
    assert!(heap.stale_slots().is_empty());
    heap.validate_integrity();
}

#[test]
fn test_integration_heap_churn_stays_consistent() {
    let heap: DescriptorTable<String> = DescriptorTable::new(DescriptorHeapType::Sampler, 128, null_logger());
    let mut live: Vec<(u32, u32)> = Vec::new();

    for frame in 0..200u64 {
        heap.set_frame(frame);
        let count = 1 + (frame % 5) as u32;
        if let Some(start) = heap.allocate_range(count, "material") {
            live.push((start, count));
        }
        if frame % 3 == 0 && !live.is_empty() {
            let (start, count) = live.remove(0);
            assert!(heap.free_range(start, count));
        }
        assert_eq!(heap.allocated_count() + heap.free_count(), heap.capacity());
    }

    heap.validate_integrity();
    let fragmentation = heap.fragmentation();
    assert!((0.0..=1.0).contains(&fragmentation));

    for (start, count) in live {
        assert!(heap.free_range(start, count));
    }
    assert_eq!(heap.free_count(), 128);
    assert_eq!(heap.fragmentation(), 0.0);
}

#[test]
fn test_integration_index_allocator_coalescing() {
    let allocator = IndexAllocator::new(64, null_logger());
    let a = allocator.allocate(16).unwrap();
    let b = allocator.allocate(16).unwrap();
    let _c = allocator.allocate(32).unwrap();
    assert!(allocator.allocate(1).is_none());

    allocator.deallocate(a, 16);
    allocator.deallocate(b, 16);
    assert_eq!(allocator.allocate(32), Some(0));
    allocator.validate_integrity();
}
