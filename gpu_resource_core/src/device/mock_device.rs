/// Mock device for unit tests (no GPU required)
///
/// Implements `ResourceFactory` with host memory so the pool, staging
/// allocator and resource manager can be tested without a graphics backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::Mutex;

use crate::device::{Buffer, BufferDesc, BufferUsage, ResourceFactory};
use crate::error::{Error, Result};

// ============================================================================
// Mock Buffer
// ============================================================================

#[derive(Debug)]
pub struct MockBuffer {
    pub id: u64,
    pub desc: BufferDesc,
    pub gpu_address: u64,
    memory: Mutex<Vec<u8>>,
    mapped: AtomicBool,
    pub map_calls: AtomicU64,
    pub unmap_calls: AtomicU64,
}

impl MockBuffer {
    pub fn new(id: u64, desc: BufferDesc, gpu_address: u64) -> Self {
        let memory = vec![0u8; desc.size as usize];
        Self {
            id,
            desc,
            gpu_address,
            memory: Mutex::new(memory),
            mapped: AtomicBool::new(false),
            map_calls: AtomicU64::new(0),
            unmap_calls: AtomicU64::new(0),
        }
    }

    /// Copy of the backing memory
    pub fn contents(&self) -> Vec<u8> {
        self.memory.lock().clone()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::SeqCst)
    }

    fn base_ptr(&self) -> *mut u8 {
        // The Vec is never resized, so the heap pointer is stable
        self.memory.lock().as_mut_ptr()
    }
}

impl Buffer for MockBuffer {
    fn size(&self) -> u64 {
        self.desc.size
    }

    fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    fn cpu_accessible(&self) -> bool {
        self.desc.cpu_accessible
    }

    fn name(&self) -> &str {
        &self.desc.name
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    fn map(&self) -> Result<*mut u8> {
        if !self.desc.cpu_accessible {
            return Err(Error::InvalidResource(format!(
                "Buffer {} is not CPU-accessible", self.id
            )));
        }
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        self.mapped.store(true, Ordering::SeqCst);
        Ok(self.base_ptr())
    }

    fn unmap(&self) {
        if self.mapped.swap(false, Ordering::SeqCst) {
            self.unmap_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mapped_ptr(&self) -> Option<*mut u8> {
        if self.is_mapped() {
            Some(self.base_ptr())
        } else {
            None
        }
    }

    fn update(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.desc.cpu_accessible {
            return Err(Error::InvalidResource("Buffer is not CPU-accessible".to_string()));
        }
        let end = offset as usize + data.len();
        let mut memory = self.memory.lock();
        if end > memory.len() {
            return Err(Error::InvalidResource(format!(
                "Write of {} bytes at {} exceeds buffer size {}", data.len(), offset, memory.len()
            )));
        }
        memory[offset as usize..end].copy_from_slice(data);
        Ok(())
    }
}

// ============================================================================
// Mock Device
// ============================================================================

pub struct MockDevice {
    next_id: AtomicU64,
    next_address: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    fail_creation: AtomicBool,
    /// Creation fails once this many buffers have been created
    fail_after: Mutex<Option<u64>>,
    /// Creation fails while this many buffers are alive
    live_limit: Mutex<Option<u64>>,
    /// Created buffers are clamped to this size
    size_cap: Mutex<Option<u64>>,
    destroyed_addresses: Mutex<Vec<u64>>,
    buffers: Mutex<Vec<Arc<MockBuffer>>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_address: AtomicU64::new(0x1000_0000),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            fail_creation: AtomicBool::new(false),
            fail_after: Mutex::new(None),
            live_limit: Mutex::new(None),
            size_cap: Mutex::new(None),
            destroyed_addresses: Mutex::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> u64 {
        self.created_count() - self.destroyed_count()
    }

    pub fn destroyed_addresses(&self) -> Vec<u64> {
        self.destroyed_addresses.lock().clone()
    }

    /// Concrete buffer behind a `dyn Buffer`, looked up by its unique address
    pub fn mock_buffer(&self, buffer: &Arc<dyn Buffer>) -> Option<Arc<MockBuffer>> {
        let address = buffer.gpu_address();
        self.buffers.lock().iter().find(|b| b.gpu_address == address).cloned()
    }

    pub fn set_fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    pub fn fail_after(&self, count: u64) {
        *self.fail_after.lock() = Some(count);
    }

    /// Report out of memory whenever `count` buffers are already alive
    pub fn set_live_limit(&self, count: u64) {
        *self.live_limit.lock() = Some(count);
    }

    /// Hand out buffers of at most `size` bytes, whatever was asked for
    pub fn set_size_cap(&self, size: u64) {
        *self.size_cap.lock() = Some(size);
    }
}

impl ResourceFactory for MockDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn Buffer>> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(Error::OutOfMemory);
        }
        if let Some(limit) = *self.fail_after.lock() {
            if self.created_count() >= limit {
                return Err(Error::OutOfMemory);
            }
        }
        if let Some(limit) = *self.live_limit.lock() {
            if self.live_count() >= limit {
                return Err(Error::OutOfMemory);
            }
        }

        let mut desc = desc.clone();
        if let Some(cap) = *self.size_cap.lock() {
            desc.size = desc.size.min(cap);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let span = (desc.size.max(1) + 255) & !255;
        let address = self.next_address.fetch_add(span, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        let buffer = Arc::new(MockBuffer::new(id, desc, address));
        self.buffers.lock().push(buffer.clone());
        Ok(buffer as Arc<dyn Buffer>)
    }

    fn destroy_buffer(&self, buffer: Arc<dyn Buffer>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.destroyed_addresses.lock().push(buffer.gpu_address());
    }
}
