//! Rotating set of CPU-writable staging buffers for uploads.
//!
//! Each buffer is a bump allocator: allocations advance a cursor and only a
//! reset rewinds it. When the current buffer is full the allocator moves on
//! to the next one, resetting it first. Resetting a buffer whose contents
//! the GPU may still read is the caller's responsibility; every allocation
//! carries the reset epoch of its buffer so integration code can tell
//! buffer generations apart.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::device::{Buffer, BufferDesc, BufferUsage, ResourceFactory};
use crate::error::{Error, Result};
use crate::log::Logger;
use crate::{gpu_debug, gpu_err, gpu_error, gpu_trace, gpu_warn};

const SOURCE: &str = "gpucore::RingStagingAllocator";

// ===== CONFIG =====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingConfig {
    /// Number of buffers in the ring
    pub buffer_count: usize,
    /// Size of each buffer in bytes
    pub buffer_size: u64,
    /// Alignment used for uploads (power of two)
    pub alignment: u64,
    /// Map every buffer once at creation instead of per use
    pub persistent_mapping: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            buffer_size: 4 * 1024 * 1024,
            alignment: 256,
            persistent_mapping: true,
        }
    }
}

impl StagingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(Error::InvalidConfig("buffer_count must be at least 1".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be non-zero".to_string()));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "alignment must be a power of 2, got {}",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Round `value` up to `alignment` (0 and 1 mean unaligned)
fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(value);
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

// ===== ALLOCATION =====

/// A range of staging memory, writable from the CPU
///
/// The range belongs to one epoch of its buffer. Once the buffer is reset
/// (or destroyed) `write` refuses to touch it; `cpu_ptr` is not checked and
/// must not be used past that point.
#[derive(Clone)]
pub struct StagingAllocation {
    buffer: Arc<dyn Buffer>,
    cursor: Arc<Mutex<Cursor>>,
    ptr: *mut u8,
    /// Index of the buffer in the ring
    pub buffer_index: usize,
    /// Byte offset inside the buffer
    pub offset: u64,
    pub size: u64,
    /// Device address of the first byte
    pub gpu_address: u64,
    /// Reset count of the buffer when the range was handed out
    pub epoch: u64,
}

// SAFETY: the pointer is only dereferenced by `write`, under the buffer's
// cursor lock and only while the buffer is still mapped in the epoch the
// range was handed out in. Ranges of one epoch never overlap.
unsafe impl Send for StagingAllocation {}
unsafe impl Sync for StagingAllocation {}

impl StagingAllocation {
    /// Buffer the range lives in (the copy source)
    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    /// CPU pointer to the first byte; stay within `[0, size)`
    pub fn cpu_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Whether the buffer is still in the epoch this range was handed out in
    pub fn is_current(&self) -> bool {
        let cursor = self.cursor.lock();
        cursor.epoch == self.epoch && cursor.mapped
    }

    /// Copy `data` to `offset` within the range
    ///
    /// Returns false, writing nothing, if the bytes do not fit or the buffer
    /// has been reset or destroyed since the range was allocated.
    pub fn write(&self, offset: u64, data: &[u8]) -> bool {
        let fits = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.size);
        if !fits {
            return false;
        }
        let cursor = self.cursor.lock();
        if cursor.epoch != self.epoch || !cursor.mapped {
            return false;
        }
        // SAFETY: bounds checked above; the cursor lock keeps the buffer from
        // being reset or unmapped during the copy
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset as usize), data.len());
        }
        true
    }
}

impl fmt::Debug for StagingAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingAllocation")
            .field("buffer_index", &self.buffer_index)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("epoch", &self.epoch)
            .finish()
    }
}

// ===== STAGING BUFFER =====

struct Cursor {
    offset: u64,
    epoch: u64,
    mapped: bool,
}

/// One buffer of the ring with its bump cursor
pub struct StagingBuffer {
    index: usize,
    buffer: Arc<dyn Buffer>,
    persistent_mapping: bool,
    /// Shared with the allocations handed out, so they can detect a reset
    cursor: Arc<Mutex<Cursor>>,
    logger: Arc<dyn Logger>,
}

impl StagingBuffer {
    fn new(
        index: usize,
        buffer: Arc<dyn Buffer>,
        persistent_mapping: bool,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        if persistent_mapping {
            buffer.map()?;
        }
        Ok(Self {
            index,
            buffer,
            persistent_mapping,
            cursor: Arc::new(Mutex::new(Cursor { offset: 0, epoch: 0, mapped: persistent_mapping })),
            logger,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.buffer.size()
    }

    /// Bytes consumed since the last reset, alignment padding included
    pub fn used(&self) -> u64 {
        self.cursor.lock().offset
    }

    pub fn remaining(&self) -> u64 {
        self.capacity() - self.used()
    }

    /// Number of resets so far
    pub fn epoch(&self) -> u64 {
        self.cursor.lock().epoch
    }

    pub fn is_mapped(&self) -> bool {
        self.cursor.lock().mapped
    }

    /// Bump-allocate `size` bytes aligned to `alignment`
    pub fn allocate(&self, size: u64, alignment: u64) -> Option<StagingAllocation> {
        if size == 0 || (alignment > 1 && !alignment.is_power_of_two()) {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let offset = align_up(cursor.offset, alignment)?;
        let end = offset.checked_add(size)?;
        if end > self.capacity() {
            return None;
        }
        let base = self.base_ptr(&mut cursor)?;
        cursor.offset = end;
        Some(StagingAllocation {
            buffer: self.buffer.clone(),
            cursor: Arc::clone(&self.cursor),
            // SAFETY: offset < end <= capacity, inside the mapped range
            ptr: unsafe { base.add(offset as usize) },
            buffer_index: self.index,
            offset,
            size,
            gpu_address: self.buffer.gpu_address() + offset,
            epoch: cursor.epoch,
        })
    }

    /// Rewind the cursor; earlier allocations from this buffer become invalid
    ///
    /// The caller guarantees the GPU is done reading them.
    pub fn reset(&self) {
        let mut cursor = self.cursor.lock();
        cursor.offset = 0;
        cursor.epoch += 1;
        if cursor.mapped && !self.persistent_mapping {
            self.buffer.unmap();
            cursor.mapped = false;
        }
    }

    fn base_ptr(&self, cursor: &mut Cursor) -> Option<*mut u8> {
        if cursor.mapped {
            if let Some(ptr) = self.buffer.mapped_ptr() {
                return Some(ptr);
            }
        }
        match self.buffer.map() {
            Ok(ptr) => {
                cursor.mapped = true;
                Some(ptr)
            }
            Err(e) => {
                gpu_error!(self.logger, SOURCE, "Failed to map staging buffer {}: {}", self.index, e);
                None
            }
        }
    }
}

// ===== RING =====

/// Staging allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub buffer_count: usize,
    pub buffer_size: u64,
    pub current_buffer: usize,
    /// Sum of all cursors
    pub bytes_in_flight: u64,
    pub allocations: u64,
    pub failed_allocations: u64,
    /// Times an allocation moved the ring to another buffer
    pub rollovers: u64,
}

/// Hands out staging memory from a ring of equally sized buffers
///
/// Lock order is always current index, then buffer cursor.
pub struct RingStagingAllocator {
    factory: Arc<dyn ResourceFactory>,
    config: StagingConfig,
    buffers: Vec<StagingBuffer>,
    current: Mutex<usize>,
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
    rollovers: AtomicU64,
    logger: Arc<dyn Logger>,
}

impl RingStagingAllocator {
    /// Create every buffer of the ring through `factory`
    pub fn new(
        factory: Arc<dyn ResourceFactory>,
        config: StagingConfig,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        config.validate()?;

        let mut buffers = Vec::with_capacity(config.buffer_count);
        for index in 0..config.buffer_count {
            let desc = BufferDesc::new(config.buffer_size, BufferUsage::TRANSFER_SRC)
                .cpu_accessible()
                .with_name(format!("staging[{}]", index));
            let created = factory.create_buffer(&desc).and_then(|buffer| {
                if buffer.size() < config.buffer_size || !buffer.cpu_accessible() {
                    let (size, host_visible) = (buffer.size(), buffer.cpu_accessible());
                    factory.destroy_buffer(buffer);
                    return Err(gpu_err!(
                        logger,
                        SOURCE,
                        "Unusable staging buffer {}: {} bytes, host visible: {}",
                        index,
                        size,
                        host_visible
                    ));
                }
                StagingBuffer::new(index, buffer.clone(), config.persistent_mapping, logger.clone())
                    .map_err(|e| {
                        factory.destroy_buffer(buffer);
                        e
                    })
            });
            match created {
                Ok(staging) => buffers.push(staging),
                Err(e) => {
                    gpu_error!(logger, SOURCE, "Failed to create staging buffer {}: {}", index, e);
                    for staging in buffers {
                        Self::destroy_staging(factory.as_ref(), staging);
                    }
                    return Err(Error::InitializationFailed(format!(
                        "staging buffer {}: {}",
                        index, e
                    )));
                }
            }
        }

        gpu_debug!(
            logger,
            SOURCE,
            "Created {} staging buffers of {} bytes (persistent mapping: {})",
            config.buffer_count,
            config.buffer_size,
            config.persistent_mapping
        );

        Ok(Self {
            factory,
            config,
            buffers,
            current: Mutex::new(0),
            allocations: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            rollovers: AtomicU64::new(0),
            logger,
        })
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, index: usize) -> Option<&StagingBuffer> {
        self.buffers.get(index)
    }

    pub fn current_index(&self) -> usize {
        *self.current.lock()
    }

    /// Allocate from the current buffer, rolling over to the next ones if needed
    ///
    /// Returns None when the request can never fit or no buffer can take it.
    /// In that case the current buffer is left unchanged.
    pub fn allocate(&self, size: u64, alignment: u64) -> Option<StagingAllocation> {
        self.allocate_with(size, alignment, |_| true)
    }

    /// Like `allocate`, but a rollover only resets buffers `may_reset` accepts
    ///
    /// Buffers whose contents are still needed are skipped instead of being
    /// recycled. `may_reset` runs under the ring lock and must not call back
    /// into the allocator.
    pub fn allocate_with(
        &self,
        size: u64,
        alignment: u64,
        may_reset: impl Fn(usize) -> bool,
    ) -> Option<StagingAllocation> {
        if size == 0 || size > self.config.buffer_size || (alignment > 1 && !alignment.is_power_of_two()) {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            gpu_warn!(self.logger, SOURCE, "Rejected staging request: size {} alignment {}", size, alignment);
            return None;
        }

        let mut current = self.current.lock();
        let start = *current;
        if let Some(allocation) = self.buffers[start].allocate(size, alignment) {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            return Some(allocation);
        }

        let count = self.buffers.len();
        for step in 1..count {
            let candidate = (start + step) % count;
            if !may_reset(candidate) {
                continue;
            }
            let staging = &self.buffers[candidate];
            staging.reset();
            if let Some(allocation) = staging.allocate(size, alignment) {
                *current = candidate;
                self.allocations.fetch_add(1, Ordering::Relaxed);
                self.rollovers.fetch_add(1, Ordering::Relaxed);
                gpu_trace!(self.logger, SOURCE, "Rolled over from buffer {} to {}", start, candidate);
                return Some(allocation);
            }
        }

        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
        gpu_warn!(self.logger, SOURCE, "Staging exhausted: {} bytes requested", size);
        None
    }

    /// Move to the next buffer and reset it
    ///
    /// Call once per frame, after the GPU has consumed that buffer's uploads.
    pub fn advance(&self) {
        let mut current = self.current.lock();
        let next = (*current + 1) % self.buffers.len();
        self.buffers[next].reset();
        *current = next;
    }

    /// Reset every buffer and start over from the first one
    pub fn reset_all(&self) {
        let mut current = self.current.lock();
        for staging in &self.buffers {
            staging.reset();
        }
        *current = 0;
    }

    pub fn stats(&self) -> StagingStats {
        let current_buffer = self.current_index();
        StagingStats {
            buffer_count: self.buffers.len(),
            buffer_size: self.config.buffer_size,
            current_buffer,
            bytes_in_flight: self.buffers.iter().map(StagingBuffer::used).sum(),
            allocations: self.allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
        }
    }

    fn destroy_staging(factory: &dyn ResourceFactory, staging: StagingBuffer) {
        {
            let mut cursor = staging.cursor.lock();
            cursor.mapped = false;
            cursor.epoch += 1;
            staging.buffer.unmap();
        }
        factory.destroy_buffer(staging.buffer);
    }
}

impl Drop for RingStagingAllocator {
    fn drop(&mut self) {
        for staging in self.buffers.drain(..) {
            Self::destroy_staging(self.factory.as_ref(), staging);
        }
        gpu_trace!(self.logger, SOURCE, "Staging buffers destroyed");
    }
}

#[cfg(test)]
#[path = "ring_staging_tests.rs"]
mod tests;
