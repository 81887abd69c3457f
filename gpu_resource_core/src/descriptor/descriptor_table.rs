//! Fixed-capacity descriptor heap with per-slot bookkeeping.
//!
//! Slot indices come from an `IndexAllocator`; the table adds a debug tag,
//! the frame the slot was created in and a weak back-reference to the
//! resource the slot describes. The weak reference never keeps the resource
//! alive, which makes dangling slots easy to find with `stale_slots`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::Mutex;

use crate::allocator::IndexAllocator;
use crate::device::Buffer;
use crate::log::Logger;
use crate::{gpu_error, gpu_trace, gpu_warn};

const SOURCE: &str = "gpucore::DescriptorTable";

/// Kind of descriptors stored in a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Buffers and sampled/storage images
    Resource,
    Sampler,
    RenderTarget,
    DepthStencil,
}

/// Snapshot of one allocated slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSlotInfo {
    pub index: u32,
    pub heap_type: DescriptorHeapType,
    pub tag: String,
    /// Frame number current when the slot was allocated
    pub frame_created: u64,
    /// A resource was bound to the slot at some point
    pub has_resource: bool,
    /// The bound resource is still alive
    pub resource_alive: bool,
}

struct SlotMeta<R: ?Sized> {
    tag: String,
    frame_created: u64,
    resource: Option<Weak<R>>,
}

impl<R: ?Sized> SlotMeta<R> {
    fn is_stale(&self) -> bool {
        self.resource.as_ref().is_some_and(|weak| weak.strong_count() == 0)
    }
}

/// Descriptor slots of one heap type
///
/// `R` is the resource type slots point back to.
pub struct DescriptorTable<R: ?Sized = dyn Buffer> {
    heap_type: DescriptorHeapType,
    allocator: IndexAllocator,
    slots: Mutex<Vec<Option<SlotMeta<R>>>>,
    frame: AtomicU64,
    logger: Arc<dyn Logger>,
}

impl<R: ?Sized> DescriptorTable<R> {
    pub fn new(heap_type: DescriptorHeapType, capacity: u32, logger: Arc<dyn Logger>) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Self {
            heap_type,
            allocator: IndexAllocator::new(capacity, logger.clone()),
            slots: Mutex::new(slots),
            frame: AtomicU64::new(0),
            logger,
        }
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    // ===== ALLOCATION =====

    /// Allocate one slot
    pub fn allocate(&self, tag: &str) -> Option<u32> {
        self.allocate_range(1, tag)
    }

    /// Allocate `count` contiguous slots, all carrying `tag`
    pub fn allocate_range(&self, count: u32, tag: &str) -> Option<u32> {
        self.allocate_with(count, tag, None)
    }

    /// Allocate one slot describing `resource`
    pub fn allocate_for(&self, tag: &str, resource: &Arc<R>) -> Option<u32> {
        self.allocate_with(1, tag, Some(Arc::downgrade(resource)))
    }

    fn allocate_with(&self, count: u32, tag: &str, resource: Option<Weak<R>>) -> Option<u32> {
        let Some(index) = self.allocator.allocate(count) else {
            gpu_warn!(
                self.logger,
                SOURCE,
                "{:?} heap full: {} slots requested for '{}'",
                self.heap_type,
                count,
                tag
            );
            return None;
        };

        let frame_created = self.frame();
        let mut slots = self.slots.lock();
        for slot in &mut slots[index as usize..(index + count) as usize] {
            *slot = Some(SlotMeta {
                tag: tag.to_string(),
                frame_created,
                resource: resource.clone(),
            });
        }
        drop(slots);

        gpu_trace!(self.logger, SOURCE, "{:?}[{}..{}] '{}'", self.heap_type, index, index + count, tag);
        Some(index)
    }

    /// Free one slot
    pub fn free(&self, index: u32) -> bool {
        self.free_range(index, 1)
    }

    /// Free `count` slots starting at `index`
    ///
    /// Fails, changing nothing, if any slot in the range is not allocated.
    pub fn free_range(&self, index: u32, count: u32) -> bool {
        let Some(end) = index.checked_add(count).filter(|&end| count > 0 && end <= self.capacity()) else {
            return false;
        };
        let allocated = {
            let mut slots = self.slots.lock();
            let range = &mut slots[index as usize..end as usize];
            let allocated = range.iter().all(Option::is_some);
            if allocated {
                range.iter_mut().for_each(|slot| *slot = None);
            }
            allocated
        };
        if !allocated {
            gpu_warn!(self.logger, SOURCE, "Free of unallocated range [{}..{})", index, end);
            return false;
        }
        self.allocator.deallocate(index, count)
    }

    // ===== METADATA =====

    /// Metadata of an allocated slot
    pub fn slot(&self, index: u32) -> Option<DescriptorSlotInfo> {
        let slots = self.slots.lock();
        let meta = slots.get(index as usize)?.as_ref()?;
        Some(DescriptorSlotInfo {
            index,
            heap_type: self.heap_type,
            tag: meta.tag.clone(),
            frame_created: meta.frame_created,
            has_resource: meta.resource.is_some(),
            resource_alive: meta.resource.as_ref().is_some_and(|weak| weak.strong_count() > 0),
        })
    }

    /// Resource bound to the slot, if it is still alive
    pub fn resource(&self, index: u32) -> Option<Arc<R>> {
        let slots = self.slots.lock();
        slots.get(index as usize)?.as_ref()?.resource.as_ref()?.upgrade()
    }

    /// Point an allocated slot at `resource`
    pub fn bind_resource(&self, index: u32, resource: &Arc<R>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(index as usize).and_then(Option::as_mut) {
            Some(meta) => {
                meta.resource = Some(Arc::downgrade(resource));
                true
            }
            None => false,
        }
    }

    /// Set the frame number stamped on slots allocated from now on
    pub fn set_frame(&self, frame: u64) {
        self.frame.store(frame, Ordering::Relaxed);
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Indices of all allocated slots, ascending
    pub fn allocated_slots(&self) -> Vec<u32> {
        self.collect_slots(|_| true)
    }

    /// Allocated slots whose resource has been dropped
    pub fn stale_slots(&self) -> Vec<u32> {
        self.collect_slots(SlotMeta::is_stale)
    }

    fn collect_slots(&self, filter: impl Fn(&SlotMeta<R>) -> bool) -> Vec<u32> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().filter(|meta| filter(*meta)).map(|_| index as u32))
            .collect()
    }

    // ===== ALLOCATOR QUERIES =====

    pub fn capacity(&self) -> u32 {
        self.allocator.capacity()
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocator.allocated_count()
    }

    pub fn free_count(&self) -> u32 {
        self.allocator.free_count()
    }

    pub fn fragmentation(&self) -> f32 {
        self.allocator.fragmentation()
    }

    /// Check the allocator and that metadata matches occupancy
    ///
    /// Panics on any inconsistency. Only meaningful while no other thread
    /// is allocating or freeing.
    pub fn validate_integrity(&self) {
        self.allocator.validate_integrity();
        let occupied: Vec<bool> = self.slots.lock().iter().map(Option::is_some).collect();
        let mismatch = occupied
            .iter()
            .enumerate()
            .position(|(index, &used)| used != self.allocator.is_allocated(index as u32));
        if let Some(index) = mismatch {
            gpu_error!(self.logger, SOURCE, "Slot {} metadata does not match occupancy", index);
            panic!("DescriptorTable integrity violation at slot {}", index);
        }
    }
}

#[cfg(test)]
#[path = "descriptor_table_tests.rs"]
mod tests;
