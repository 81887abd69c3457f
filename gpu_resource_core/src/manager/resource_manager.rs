/// Front door for GPU buffer lifetimes.
///
/// Buffers come from the `ObjectPool`, are owned by a `HandleTable` and go
/// back to the pool when their last reference is released. Uploads are
/// copied into staging memory and queued as `PendingUpload`s for whoever
/// records the GPU copies.

use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;

use crate::device::{Buffer, BufferDesc, ResourceFactory};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleTable};
use crate::log::Logger;
use crate::pool::{ObjectPool, PoolConfig, PoolStats, PooledBuffer};
use crate::staging::{RingStagingAllocator, StagingAllocation, StagingConfig, StagingStats};
use crate::{gpu_debug, gpu_error, gpu_info, gpu_warn};

const SOURCE: &str = "gpucore::ResourceManager";

/// Handle to a buffer owned by a `ResourceManager`
pub type BufferHandle = Handle<PooledBuffer>;

// ===== CONFIG =====

/// Configuration of every component owned by the manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceManagerConfig {
    pub pool: PoolConfig,
    pub staging: StagingConfig,
}

impl ResourceManagerConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.staging.validate()
    }
}

// ===== UPLOADS =====

/// How an upload reached its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPath {
    /// Copied to staging memory; a `PendingUpload` was queued
    Staged,
    /// Staging was full, written straight into the CPU-visible destination
    Direct,
}

/// A staged copy waiting to be recorded on the GPU
///
/// Queued uploads are cancelled when their destination goes back to the
/// pool, so a recycled buffer never receives a previous owner's bytes.
#[derive(Clone)]
pub struct PendingUpload {
    /// Source range in staging memory
    pub staging: StagingAllocation,
    pub destination: Arc<dyn Buffer>,
    /// Byte offset in the destination
    pub dst_offset: u64,
}

impl PendingUpload {
    /// Bytes to copy
    pub fn size(&self) -> u64 {
        self.staging.size
    }
}

impl fmt::Debug for PendingUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingUpload")
            .field("staging", &self.staging)
            .field("destination", &format_args!("{:#x}", self.destination.gpu_address()))
            .field("dst_offset", &self.dst_offset)
            .finish()
    }
}

// ===== STATS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceManagerStats {
    pub pool: PoolStats,
    /// Valid buffer handles
    pub live_buffers: usize,
    /// Destroyed buffers still referenced somewhere
    pub pending_destroy: usize,
    pub staging: StagingStats,
    pub pending_uploads: usize,
}

// ===== MANAGER =====

/// Owns pooled buffers behind handles and stages their uploads
///
/// Every method takes `&self`; the manager can be shared across threads.
/// Staging an upload holds the upload queue lock while it checks the handle
/// and writes the staging range; nothing takes those locks in the other order.
pub struct ResourceManager {
    buffers: HandleTable<PooledBuffer>,
    staging: RingStagingAllocator,
    uploads: Arc<Mutex<Vec<PendingUpload>>>,
    pool: Arc<ObjectPool>,
    logger: Arc<dyn Logger>,
}

impl ResourceManager {
    /// Create the pool and the staging ring on top of `factory`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for unusable settings and the factory's
    /// error if a staging buffer cannot be created.
    pub fn new(
        factory: Arc<dyn ResourceFactory>,
        config: ResourceManagerConfig,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        if let Err(e) = config.validate() {
            gpu_error!(logger, SOURCE, "Invalid configuration: {}", e);
            return Err(e);
        }

        let pool = Arc::new(ObjectPool::new(factory.clone(), config.pool.clone(), logger.clone())?);
        let staging = RingStagingAllocator::new(factory, config.staging.clone(), logger.clone())?;

        let uploads = Arc::new(Mutex::new(Vec::new()));
        let returns = Arc::clone(&pool);
        let queued = Arc::clone(&uploads);
        let release_logger = logger.clone();
        let buffers = HandleTable::with_destructor(logger.clone(), move |buffer: PooledBuffer| {
            let cancelled = cancel_uploads_to(&queued, buffer.buffer());
            if cancelled > 0 {
                gpu_debug!(release_logger, SOURCE, "Cancelled {} pending uploads to a released buffer", cancelled);
            }
            returns.release(buffer);
        });

        gpu_info!(
            logger,
            SOURCE,
            "Initialized: {} staging buffers of {} bytes, pooling {}",
            config.staging.buffer_count,
            config.staging.buffer_size,
            if config.pool.pooling_enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            buffers,
            staging,
            uploads,
            pool,
            logger,
        })
    }

    // ===== BUFFERS =====

    /// Create a buffer, reusing a pooled one when possible
    ///
    /// The returned handle holds one reference.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            gpu_error!(self.logger, SOURCE, "Cannot create zero-sized buffer '{}'", desc.name);
            return Err(Error::InvalidResource(format!("Buffer '{}' has zero size", desc.name)));
        }
        let pooled = self.pool.acquire(desc).map_err(|e| {
            gpu_error!(self.logger, SOURCE, "Failed to create buffer '{}': {}", desc.name, e);
            e
        })?;
        let handle = self.buffers.create(pooled);
        gpu_debug!(self.logger, SOURCE, "Created buffer '{}' ({} bytes) as {:?}", desc.name, desc.size, handle);
        Ok(handle)
    }

    /// The underlying buffer, None if the handle is stale or destroyed
    pub fn buffer(&self, handle: BufferHandle) -> Option<Arc<dyn Buffer>> {
        self.buffers.with(handle, |pooled| pooled.buffer().clone())
    }

    /// Size the buffer was requested with (the pooled buffer may be larger)
    pub fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.buffers.with(handle, PooledBuffer::requested_size)
    }

    pub fn is_valid(&self, handle: BufferHandle) -> bool {
        self.buffers.is_valid(handle)
    }

    pub fn add_ref(&self, handle: BufferHandle) -> bool {
        self.buffers.add_ref(handle)
    }

    /// Drop a reference; the last one returns the buffer to the pool
    pub fn release(&self, handle: BufferHandle) -> bool {
        self.buffers.release(handle)
    }

    /// Invalidate the handle and drop the creator's reference
    ///
    /// Holders of extra references can still release them; the buffer goes
    /// back to the pool with the last one.
    pub fn destroy_buffer(&self, handle: BufferHandle) -> bool {
        if !self.buffers.invalidate(handle) {
            gpu_warn!(self.logger, SOURCE, "destroy_buffer on invalid {:?}", handle);
            return false;
        }
        self.buffers.release(handle)
    }

    // ===== UPLOADS =====

    /// Copy `data` to `offset` in the buffer
    ///
    /// The bytes go through staging memory when there is room. Staging
    /// buffers holding queued uploads are never recycled for new ones, so
    /// until `take_pending_uploads` drains the queue the ring can run out.
    /// When staging is exhausted, CPU-visible destinations are written
    /// directly and device-local ones fail with `Error::StagingExhausted`,
    /// which callers can retry after draining the queue and `advance_frame`.
    pub fn upload(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<UploadPath> {
        let (destination, size) = self
            .buffers
            .with(handle, |pooled| (pooled.buffer().clone(), pooled.requested_size()))
            .ok_or_else(|| Error::InvalidHandle(format!("{:?}", handle)))?;

        let len = data.len() as u64;
        if len == 0 {
            return Err(Error::InvalidResource("Empty upload".to_string()));
        }
        if offset.checked_add(len).map_or(true, |end| end > size) {
            gpu_error!(
                self.logger,
                SOURCE,
                "Upload of {} bytes at offset {} exceeds buffer size {}",
                len,
                offset,
                size
            );
            return Err(Error::InvalidResource(format!(
                "Upload of {} bytes at offset {} exceeds buffer size {}",
                len, offset, size
            )));
        }

        let busy = self.queued_staging_buffers();
        let alignment = self.staging.config().alignment;
        let staged = match self.staging.allocate_with(len, alignment, |index| !busy.contains(&index)) {
            Some(staging) => self.queue_staged(handle, staging, &destination, offset, data)?,
            None => false,
        };
        if staged {
            return Ok(UploadPath::Staged);
        }

        if destination.cpu_accessible() {
            destination.update(offset, data)?;
            gpu_debug!(self.logger, SOURCE, "Staging full, wrote {} bytes directly to {:?}", len, handle);
            Ok(UploadPath::Direct)
        } else {
            gpu_warn!(self.logger, SOURCE, "Staging exhausted, upload to {:?} rejected", handle);
            Err(Error::StagingExhausted(len))
        }
    }

    /// Staging buffers that queued uploads still read from
    fn queued_staging_buffers(&self) -> Vec<usize> {
        let mut busy: Vec<usize> = self
            .uploads
            .lock()
            .iter()
            .map(|upload| upload.staging.buffer_index)
            .collect();
        busy.sort_unstable();
        busy.dedup();
        busy
    }

    /// Write `data` to the staging range and queue the copy
    ///
    /// Returns Ok(false) without writing when the range shares a buffer with
    /// queued uploads from another epoch of that buffer, or the buffer was
    /// reset since the range was handed out.
    fn queue_staged(
        &self,
        handle: BufferHandle,
        staging: StagingAllocation,
        destination: &Arc<dyn Buffer>,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<bool> {
        let mut uploads = self.uploads.lock();
        // Released meanwhile: the destination may already be back in the pool
        if !self.buffers.is_valid(handle) {
            return Err(Error::InvalidHandle(format!("{:?}", handle)));
        }
        let clobbers = uploads.iter().any(|upload| {
            upload.staging.buffer_index == staging.buffer_index && upload.staging.epoch != staging.epoch
        });
        if clobbers || !staging.write(0, data) {
            drop(uploads);
            gpu_debug!(
                self.logger,
                SOURCE,
                "Staging buffer {} still holds queued uploads, {:?} not staged",
                staging.buffer_index,
                handle
            );
            return Ok(false);
        }
        uploads.push(PendingUpload {
            staging,
            destination: Arc::clone(destination),
            dst_offset,
        });
        Ok(true)
    }

    /// `upload` for slices of plain-old-data values
    pub fn upload_typed<T: bytemuck::Pod>(
        &self,
        handle: BufferHandle,
        offset: u64,
        data: &[T],
    ) -> Result<UploadPath> {
        self.upload(handle, offset, bytemuck::cast_slice(data))
    }

    /// Hand all queued uploads to the caller, oldest first
    pub fn take_pending_uploads(&self) -> Vec<PendingUpload> {
        std::mem::take(&mut *self.uploads.lock())
    }

    pub fn pending_upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Move the staging ring to its next buffer
    ///
    /// The caller guarantees the GPU finished reading that buffer.
    pub fn advance_frame(&self) {
        self.staging.advance();
    }

    // ===== POOL =====

    /// Destroy pooled buffers beyond `max_per_bucket` per bucket
    pub fn trim_pools(&self, max_per_bucket: usize) -> usize {
        self.pool.trim_pools(max_per_bucket)
    }

    /// Warm the pool for `desc`
    pub fn preallocate(&self, desc: &BufferDesc, count: usize) -> usize {
        self.pool.preallocate(desc, count)
    }

    // ===== DIAGNOSTICS =====

    pub fn staging(&self) -> &RingStagingAllocator {
        &self.staging
    }

    pub fn stats(&self) -> ResourceManagerStats {
        ResourceManagerStats {
            pool: self.pool.stats(),
            live_buffers: self.buffers.active_count(),
            pending_destroy: self.buffers.pending_destroy_count(),
            staging: self.staging.stats(),
            pending_uploads: self.pending_upload_count(),
        }
    }

    /// Log a one-line summary at info severity
    pub fn log_stats(&self) {
        let stats = self.stats();
        gpu_info!(
            self.logger,
            SOURCE,
            "buffers: {} live, {} pending destroy | pool: {} active, {} pooled, {} bytes, hit rate {:.1}% | staging: {} bytes in flight, {} failed | uploads: {} pending",
            stats.live_buffers,
            stats.pending_destroy,
            stats.pool.active,
            stats.pool.pooled,
            stats.pool.bytes_allocated,
            stats.pool.hit_rate() * 100.0,
            stats.staging.bytes_in_flight,
            stats.staging.failed_allocations,
            stats.pending_uploads
        );
    }

    /// Destroy every buffer, pooled object and staging buffer
    pub fn shutdown(self) {
        gpu_info!(self.logger, SOURCE, "Shutting down");
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let discarded = self.take_pending_uploads().len();
        if discarded > 0 {
            gpu_warn!(self.logger, SOURCE, "Discarding {} pending uploads", discarded);
        }
        let leaked = self.buffers.destroy_all();
        if leaked > 0 {
            gpu_warn!(self.logger, SOURCE, "{} buffers still alive at shutdown", leaked);
        }
        self.pool.clear();
    }
}

/// Drop queued uploads targeting `buffer`, returning how many were removed
fn cancel_uploads_to(uploads: &Mutex<Vec<PendingUpload>>, buffer: &Arc<dyn Buffer>) -> usize {
    let mut uploads = uploads.lock();
    let before = uploads.len();
    uploads.retain(|upload| !std::ptr::addr_eq(Arc::as_ptr(&upload.destination), Arc::as_ptr(buffer)));
    before - uploads.len()
}

#[cfg(test)]
#[path = "resource_manager_tests.rs"]
mod tests;
