//! Allocates contiguous index ranges inside a fixed capacity.
//!
//! Best-fit over a free list of `{offset, length}` blocks, with coalescing
//! of neighbouring blocks on free. Used for descriptor slots, but knows
//! nothing about descriptors: it hands out plain `u32` indices.
//!
//! # Example
//!
//! ```ignore
//! let alloc = IndexAllocator::new(16, logger);
//! let a = alloc.allocate(4).unwrap();  // 0
//! let b = alloc.allocate(4).unwrap();  // 4
//! alloc.deallocate(a, 4);
//! alloc.deallocate(b, 4);              // merged with [0, 4) and the tail
//! assert_eq!(alloc.free_block_count(), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;

use crate::log::Logger;
use crate::{gpu_debug, gpu_error, gpu_info, gpu_warn};

const SOURCE: &str = "gpucore::IndexAllocator";

/// A detected inconsistency in the allocator's internal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// The size-ordered and offset-ordered free lists disagree
    FreeListMismatch { offset: u32, length: u32 },
    /// A free block extends past the capacity (or is empty)
    BlockOutOfRange { offset: u32, length: u32 },
    /// Two free blocks share at least one slot
    OverlappingBlocks { first: u32, second: u32 },
    /// A free block covers a slot marked occupied
    FreeSlotOccupied { slot: u32 },
    /// A slot is neither occupied nor covered by a free block
    LostSlot { slot: u32 },
    /// Sum of free block lengths differs from the free counter
    FreeCountMismatch { counted: u32, recorded: u32 },
    /// Occupied slots in the mask differ from the allocated counter
    AllocatedCountMismatch { scanned: u32, recorded: u32 },
    /// `allocated + free != capacity`
    ConservationBroken { allocated: u32, free: u32, capacity: u32 },
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityViolation::FreeListMismatch { offset, length } => {
                write!(f, "free lists disagree on block [{}, +{})", offset, length)
            }
            IntegrityViolation::BlockOutOfRange { offset, length } => {
                write!(f, "free block [{}, +{}) is out of range", offset, length)
            }
            IntegrityViolation::OverlappingBlocks { first, second } => {
                write!(f, "free blocks at {} and {} overlap", first, second)
            }
            IntegrityViolation::FreeSlotOccupied { slot } => {
                write!(f, "slot {} is inside a free block but marked occupied", slot)
            }
            IntegrityViolation::LostSlot { slot } => {
                write!(f, "slot {} is neither occupied nor free", slot)
            }
            IntegrityViolation::FreeCountMismatch { counted, recorded } => {
                write!(f, "free blocks hold {} slots, counter says {}", counted, recorded)
            }
            IntegrityViolation::AllocatedCountMismatch { scanned, recorded } => {
                write!(f, "mask has {} occupied slots, counter says {}", scanned, recorded)
            }
            IntegrityViolation::ConservationBroken { allocated, free, capacity } => {
                write!(f, "allocated {} + free {} != capacity {}", allocated, free, capacity)
            }
        }
    }
}

impl std::error::Error for IntegrityViolation {}

/// Snapshot of the allocator counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexAllocatorStats {
    pub capacity: u32,
    pub allocated: u32,
    pub free: u32,
    pub free_blocks: u32,
    pub largest_free_block: u32,
    pub fragmentation: f32,
}

/// Internal state guarded by the allocator lock
struct AllocatorState {
    occupied: Vec<bool>,
    /// `(length, offset)`, smallest first: best fit is the first entry >= count
    by_size: BTreeSet<(u32, u32)>,
    /// `offset -> length`, for neighbour lookup when coalescing
    by_offset: BTreeMap<u32, u32>,
    allocated: u32,
    free: u32,
}

impl AllocatorState {
    fn new(capacity: u32) -> Self {
        let mut state = Self {
            occupied: vec![false; capacity as usize],
            by_size: BTreeSet::new(),
            by_offset: BTreeMap::new(),
            allocated: 0,
            free: capacity,
        };
        if capacity > 0 {
            state.insert_block(0, capacity);
        }
        state
    }

    fn insert_block(&mut self, offset: u32, length: u32) {
        self.by_size.insert((length, offset));
        self.by_offset.insert(offset, length);
    }

    fn remove_block(&mut self, offset: u32, length: u32) {
        self.by_size.remove(&(length, offset));
        self.by_offset.remove(&offset);
    }

    fn mark(&mut self, offset: u32, count: u32, occupied: bool) {
        for slot in &mut self.occupied[offset as usize..(offset + count) as usize] {
            *slot = occupied;
        }
    }

    /// Smallest block that fits, lowest offset on ties
    fn take_best_fit(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let (length, offset) = *self.by_size.range((count, 0)..).next()?;
        self.remove_block(offset, length);
        if length > count {
            self.insert_block(offset + count, length - count);
        }
        self.mark(offset, count, true);
        self.allocated += count;
        self.free -= count;
        Some(offset)
    }

    fn is_range_allocated(&self, index: u32, count: u32) -> bool {
        let end = index as u64 + count as u64;
        count > 0
            && end <= self.occupied.len() as u64
            && self.occupied[index as usize..end as usize].iter().all(|&o| o)
    }

    fn release(&mut self, index: u32, count: u32) -> bool {
        if !self.is_range_allocated(index, count) {
            return false;
        }
        self.mark(index, count, false);
        self.allocated -= count;
        self.free += count;

        let mut start = index;
        let mut length = count;

        let previous = self
            .by_offset
            .range(..index)
            .next_back()
            .map(|(&offset, &len)| (offset, len));
        if let Some((prev_offset, prev_length)) = previous {
            if prev_offset + prev_length == index {
                self.remove_block(prev_offset, prev_length);
                start = prev_offset;
                length += prev_length;
            }
        }

        if let Some(&next_length) = self.by_offset.get(&(index + count)) {
            self.remove_block(index + count, next_length);
            length += next_length;
        }

        self.insert_block(start, length);
        true
    }

    fn largest_free_block(&self) -> u32 {
        self.by_size.iter().next_back().map(|&(length, _)| length).unwrap_or(0)
    }

    fn fragmentation(&self) -> f32 {
        if self.free == 0 || self.by_offset.len() <= 1 {
            return 0.0;
        }
        (self.free - self.largest_free_block()) as f32 / self.free as f32
    }

    fn check(&self, capacity: u32) -> Result<(), IntegrityViolation> {
        for &(length, offset) in &self.by_size {
            if self.by_offset.get(&offset) != Some(&length) {
                return Err(IntegrityViolation::FreeListMismatch { offset, length });
            }
        }
        if self.by_size.len() != self.by_offset.len() {
            let (&offset, &length) = self
                .by_offset
                .iter()
                .find(|(offset, length)| !self.by_size.contains(&(**length, **offset)))
                .unwrap_or((&0, &0));
            return Err(IntegrityViolation::FreeListMismatch { offset, length });
        }

        // Occupancy as described by the free list
        let mut covered = vec![false; capacity as usize];
        let mut counted: u32 = 0;
        let mut previous: Option<(u32, u64)> = None;
        for (&offset, &length) in &self.by_offset {
            let end = offset as u64 + length as u64;
            if length == 0 || end > capacity as u64 {
                return Err(IntegrityViolation::BlockOutOfRange { offset, length });
            }
            if let Some((prev_offset, prev_end)) = previous {
                if (offset as u64) < prev_end {
                    return Err(IntegrityViolation::OverlappingBlocks {
                        first: prev_offset,
                        second: offset,
                    });
                }
            }
            for slot in offset..offset + length {
                if self.occupied[slot as usize] {
                    return Err(IntegrityViolation::FreeSlotOccupied { slot });
                }
                covered[slot as usize] = true;
            }
            counted += length;
            previous = Some((offset, end));
        }
        if counted != self.free {
            return Err(IntegrityViolation::FreeCountMismatch { counted, recorded: self.free });
        }

        // Occupancy from a direct scan of the mask
        let scanned = self.occupied.iter().filter(|&&o| o).count() as u32;
        if scanned != self.allocated {
            return Err(IntegrityViolation::AllocatedCountMismatch {
                scanned,
                recorded: self.allocated,
            });
        }
        if let Some(slot) = (0..capacity).find(|&s| !self.occupied[s as usize] && !covered[s as usize]) {
            return Err(IntegrityViolation::LostSlot { slot });
        }
        if self.allocated + self.free != capacity {
            return Err(IntegrityViolation::ConservationBroken {
                allocated: self.allocated,
                free: self.free,
                capacity,
            });
        }
        Ok(())
    }
}

/// Fixed-capacity best-fit index allocator
///
/// All operations take the allocator's single lock; under contention
/// callers block. Never grows or shrinks.
pub struct IndexAllocator {
    capacity: u32,
    state: Mutex<AllocatorState>,
    logger: Arc<dyn Logger>,
}

impl IndexAllocator {
    /// Create an allocator managing `[0, capacity)`
    pub fn new(capacity: u32, logger: Arc<dyn Logger>) -> Self {
        gpu_debug!(logger, SOURCE, "Created allocator with capacity {}", capacity);
        Self {
            capacity,
            state: Mutex::new(AllocatorState::new(capacity)),
            logger,
        }
    }

    /// Allocate `count` contiguous indices
    ///
    /// Returns the first index, or None when `count` is 0 or no single free
    /// block is large enough. Never allocates partially.
    pub fn allocate(&self, count: u32) -> Option<u32> {
        let (result, free) = {
            let mut state = self.state.lock();
            let result = state.take_best_fit(count);
            (result, state.free)
        };
        if result.is_none() {
            gpu_debug!(self.logger, SOURCE,
                "allocate({}) failed ({} free of {})", count, free, self.capacity);
        }
        result
    }

    /// Return `[index, index + count)` to the free list
    ///
    /// Returns false, changing nothing, if the range is empty, out of bounds
    /// or contains a slot that is not currently allocated.
    pub fn deallocate(&self, index: u32, count: u32) -> bool {
        let released = self.state.lock().release(index, count);
        if !released {
            gpu_warn!(self.logger, SOURCE,
                "Rejected deallocate({}, {}): range is not fully allocated", index, count);
        }
        released
    }

    /// Allocate `count` single indices, all or nothing
    ///
    /// On failure every index granted so far is returned and the result is
    /// empty, so a partial batch is never observable.
    pub fn allocate_batch(&self, count: u32) -> Vec<u32> {
        if count == 0 {
            return Vec::new();
        }
        let mut state = self.state.lock();
        let mut granted = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match state.take_best_fit(1) {
                Some(index) => granted.push(index),
                None => {
                    for &index in &granted {
                        state.release(index, 1);
                    }
                    drop(state);
                    gpu_debug!(self.logger, SOURCE,
                        "allocate_batch({}) rolled back after {} grants", count, granted.len());
                    return Vec::new();
                }
            }
        }
        granted
    }

    /// Free everything: a single free block spanning the capacity
    pub fn reset(&self) {
        *self.state.lock() = AllocatorState::new(self.capacity);
        gpu_info!(self.logger, SOURCE, "Reset allocator ({} slots)", self.capacity);
    }

    /// Total number of indices managed
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of allocated indices
    pub fn allocated_count(&self) -> u32 {
        self.state.lock().allocated
    }

    /// Number of free indices
    pub fn free_count(&self) -> u32 {
        self.state.lock().free
    }

    /// Number of disjoint free blocks
    pub fn free_block_count(&self) -> u32 {
        self.state.lock().by_offset.len() as u32
    }

    /// Length of the largest free block (0 when full)
    pub fn largest_free_block(&self) -> u32 {
        self.state.lock().largest_free_block()
    }

    /// Whether `index` is currently allocated (false when out of range)
    pub fn is_allocated(&self, index: u32) -> bool {
        self.state.lock().occupied.get(index as usize).copied().unwrap_or(false)
    }

    /// `(total_free - largest_free_block) / total_free`, in `[0, 1]`
    ///
    /// 0 when nothing is free or at most one free block exists.
    pub fn fragmentation(&self) -> f32 {
        self.state.lock().fragmentation()
    }

    /// Counter snapshot taken under a single lock
    pub fn stats(&self) -> IndexAllocatorStats {
        let state = self.state.lock();
        IndexAllocatorStats {
            capacity: self.capacity,
            allocated: state.allocated,
            free: state.free,
            free_blocks: state.by_offset.len() as u32,
            largest_free_block: state.largest_free_block(),
            fragmentation: state.fragmentation(),
        }
    }

    /// Recompute occupancy from the free list and from the mask and compare
    pub fn check_integrity(&self) -> Result<(), IntegrityViolation> {
        self.state.lock().check(self.capacity)
    }

    /// Like `check_integrity`, but a violation is fatal
    ///
    /// # Panics
    ///
    /// Panics on any inconsistency. Continuing with a corrupted free list
    /// would hand out slots that are already in use.
    pub fn validate_integrity(&self) {
        if let Err(violation) = self.check_integrity() {
            gpu_error!(self.logger, SOURCE, "Integrity violation: {}", violation);
            panic!("IndexAllocator integrity violation: {}", violation);
        }
    }

    #[cfg(test)]
    fn corrupt_for_testing(&self, f: impl FnOnce(&mut Vec<bool>, &mut u32, &mut u32)) {
        let mut state = self.state.lock();
        let AllocatorState { occupied, allocated, free, .. } = &mut *state;
        f(occupied, allocated, free);
    }
}

#[cfg(test)]
#[path = "index_allocator_tests.rs"]
mod tests;
