//! Size-bucketed recycling pool for GPU buffers.
//!
//! Buffers whose size falls inside the pooled range are created at the size
//! of their power-of-two bucket and parked in a FIFO queue when returned, so
//! the next request for the same (usage, bucket, access) shape reuses them
//! instead of going back to the device. Everything else bypasses the pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::device::{Buffer, BufferDesc, BufferUsage, ResourceFactory};
use crate::error::{Error, Result};
use crate::log::Logger;
use crate::{gpu_bail, gpu_debug, gpu_trace, gpu_warn};

const SOURCE: &str = "gpucore::ObjectPool";

/// Smallest bucket handed out by the pool
pub const MIN_BUCKET_SIZE: u64 = 1024;

// ===== CONFIG =====

/// Pool tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Requests smaller than this bypass the pool
    pub min_pooled_size: u64,
    /// Requests larger than this bypass the pool
    pub max_pooled_size: u64,
    /// Returned objects beyond this count per bucket are destroyed
    pub max_pooled_per_bucket: usize,
    pub pooling_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pooled_size: 1024,
            max_pooled_size: 64 * 1024 * 1024,
            max_pooled_per_bucket: 8,
            pooling_enabled: true,
        }
    }
}

impl PoolConfig {
    /// Check the size range is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_pooled_size == 0 {
            return Err(Error::InvalidConfig("max_pooled_size must be non-zero".to_string()));
        }
        if self.min_pooled_size > self.max_pooled_size {
            return Err(Error::InvalidConfig(format!(
                "min_pooled_size ({}) exceeds max_pooled_size ({})",
                self.min_pooled_size, self.max_pooled_size
            )));
        }
        Ok(())
    }
}

// ===== KEYS =====

/// Identifies a bucket of interchangeable buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub usage: BufferUsage,
    pub size_bucket: u64,
    pub cpu_accessible: bool,
}

/// Smallest power of two >= max(1 KiB, size), clamped at `max_size`
pub fn size_bucket(size: u64, max_size: u64) -> u64 {
    let bucket = size
        .max(MIN_BUCKET_SIZE)
        .checked_next_power_of_two()
        .unwrap_or(u64::MAX);
    bucket.min(max_size)
}

// ===== POOLED BUFFER =====

/// A buffer on loan from an `ObjectPool`
///
/// Give it back with `ObjectPool::release`. Pooled buffers may be larger
/// than requested; `requested_size` keeps the original request.
pub struct PooledBuffer {
    buffer: Arc<dyn Buffer>,
    key: Option<PoolKey>,
    requested_size: u64,
}

impl PooledBuffer {
    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    /// Bucket the buffer belongs to, None for buffers that bypassed the pool
    pub fn key(&self) -> Option<PoolKey> {
        self.key
    }

    pub fn is_pooled(&self) -> bool {
        self.key.is_some()
    }

    pub fn requested_size(&self) -> u64 {
        self.requested_size
    }

    /// Actual size of the underlying buffer
    pub fn capacity(&self) -> u64 {
        self.buffer.size()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("gpu_address", &self.buffer.gpu_address())
            .field("capacity", &self.buffer.size())
            .field("requested_size", &self.requested_size)
            .field("key", &self.key)
            .finish()
    }
}

// ===== STATS =====

/// Pool counters, consistent with each other at every snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_destroyed: u64,
    /// Buffers currently on loan
    pub active: u64,
    /// Buffers parked in buckets
    pub pooled: u64,
    /// Bytes of every live buffer, on loan or parked
    pub bytes_allocated: u64,
    /// Bytes of buffers on loan
    pub bytes_in_use: u64,
    pub peak_bytes_in_use: u64,
    pub hits: u64,
    pub misses: u64,
}

impl PoolStats {
    /// Fraction of pooled acquisitions served from a bucket
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn on_created(&mut self, size: u64) {
        self.total_created += 1;
        self.bytes_allocated += size;
    }

    fn on_destroyed(&mut self, size: u64) {
        self.total_destroyed += 1;
        self.bytes_allocated -= size;
    }

    fn on_lent(&mut self, size: u64) {
        self.active += 1;
        self.bytes_in_use += size;
        self.peak_bytes_in_use = self.peak_bytes_in_use.max(self.bytes_in_use);
    }

    fn on_returned(&mut self, size: u64) {
        self.active -= 1;
        self.bytes_in_use -= size;
    }
}

// ===== POOL =====

struct PoolState {
    buckets: FxHashMap<PoolKey, VecDeque<Arc<dyn Buffer>>>,
    stats: PoolStats,
}

/// Recycles buffers by (usage, size bucket, access) key
pub struct ObjectPool {
    factory: Arc<dyn ResourceFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    logger: Arc<dyn Logger>,
}

impl ObjectPool {
    pub fn new(
        factory: Arc<dyn ResourceFactory>,
        config: PoolConfig,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        config.validate()?;
        gpu_debug!(logger, SOURCE, "Created pool: {:?}", config);
        Ok(Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                buckets: FxHashMap::default(),
                stats: PoolStats::default(),
            }),
            logger,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Bucket for `desc`, None if the request bypasses the pool
    pub fn key_for(&self, desc: &BufferDesc) -> Option<PoolKey> {
        let pooled = self.config.pooling_enabled
            && desc.size >= self.config.min_pooled_size
            && desc.size <= self.config.max_pooled_size;
        pooled.then(|| PoolKey {
            usage: desc.usage,
            size_bucket: size_bucket(desc.size, self.config.max_pooled_size),
            cpu_accessible: desc.cpu_accessible,
        })
    }

    /// Get a buffer matching `desc`, reusing a pooled one when possible
    pub fn acquire(&self, desc: &BufferDesc) -> Result<PooledBuffer> {
        let Some(key) = self.key_for(desc) else {
            let buffer = self.create_reclaiming(desc)?;
            let mut state = self.state.lock();
            state.stats.on_created(buffer.size());
            state.stats.on_lent(buffer.size());
            return Ok(PooledBuffer { buffer, key: None, requested_size: desc.size });
        };

        {
            let mut state = self.state.lock();
            let reused = state.buckets.get_mut(&key).and_then(|queue| queue.pop_front());
            if let Some(buffer) = reused {
                state.stats.hits += 1;
                state.stats.pooled -= 1;
                state.stats.on_lent(buffer.size());
                drop(state);
                gpu_trace!(self.logger, SOURCE, "Hit {:?}", key);
                return Ok(PooledBuffer { buffer, key: Some(key), requested_size: desc.size });
            }
        }

        let buffer = self.create_reclaiming(&Self::bucket_desc(desc, &key))?;
        {
            let mut state = self.state.lock();
            state.stats.misses += 1;
            state.stats.on_created(buffer.size());
            state.stats.on_lent(buffer.size());
        }
        gpu_debug!(self.logger, SOURCE, "Miss {:?}, created {} bytes", key, buffer.size());
        Ok(PooledBuffer { buffer, key: Some(key), requested_size: desc.size })
    }

    /// Give a buffer back; it is parked for reuse or destroyed
    pub fn release(&self, pooled: PooledBuffer) {
        let PooledBuffer { buffer, key, .. } = pooled;
        let size = buffer.size();
        let victim = {
            let mut state = self.state.lock();
            state.stats.on_returned(size);
            let victim = match key {
                Some(key) if self.config.pooling_enabled => {
                    let queue = state.buckets.entry(key).or_default();
                    if queue.len() < self.config.max_pooled_per_bucket {
                        queue.push_back(buffer);
                        None
                    } else {
                        Some(buffer)
                    }
                }
                _ => Some(buffer),
            };
            if victim.is_some() {
                state.stats.on_destroyed(size);
            } else {
                state.stats.pooled += 1;
            }
            victim
        };
        if let Some(buffer) = victim {
            gpu_trace!(self.logger, SOURCE, "Destroying returned buffer ({} bytes)", size);
            self.factory.destroy_buffer(buffer);
        }
    }

    /// Create up to `count` buffers for the bucket of `desc` ahead of time
    ///
    /// Stops early when the bucket is full or creation fails. Returns how
    /// many buffers were added.
    pub fn preallocate(&self, desc: &BufferDesc, count: usize) -> usize {
        let Some(key) = self.key_for(desc) else {
            return 0;
        };
        let bucket_desc = Self::bucket_desc(desc, &key);
        let mut added = 0;
        while added < count {
            if self.pooled_count(&key) >= self.config.max_pooled_per_bucket {
                break;
            }
            let buffer = match self.create_checked(&bucket_desc) {
                Ok(buffer) => buffer,
                Err(e) => {
                    gpu_warn!(self.logger, SOURCE, "Preallocation of {:?} stopped: {}", key, e);
                    break;
                }
            };

            let mut state = self.state.lock();
            state.stats.on_created(buffer.size());
            let queue = state.buckets.entry(key).or_default();
            if queue.len() >= self.config.max_pooled_per_bucket {
                // Filled by a concurrent release meanwhile
                state.stats.on_destroyed(buffer.size());
                drop(state);
                self.factory.destroy_buffer(buffer);
                break;
            }
            queue.push_back(buffer);
            state.stats.pooled += 1;
            added += 1;
        }
        gpu_debug!(self.logger, SOURCE, "Preallocated {} buffers for {:?}", added, key);
        added
    }

    /// Destroy parked buffers until no bucket holds more than `max_per_bucket`
    ///
    /// Empty buckets are dropped. Returns how many buffers were destroyed.
    pub fn trim_pools(&self, max_per_bucket: usize) -> usize {
        let victims: Vec<Arc<dyn Buffer>> = {
            let mut state = self.state.lock();
            let mut victims = Vec::new();
            for queue in state.buckets.values_mut() {
                while queue.len() > max_per_bucket {
                    if let Some(buffer) = queue.pop_front() {
                        victims.push(buffer);
                    }
                }
            }
            state.buckets.retain(|_, queue| !queue.is_empty());
            for buffer in &victims {
                state.stats.pooled -= 1;
                state.stats.on_destroyed(buffer.size());
            }
            victims
        };

        let count = victims.len();
        for buffer in victims {
            self.factory.destroy_buffer(buffer);
        }
        if count > 0 {
            gpu_debug!(self.logger, SOURCE, "Trimmed {} pooled buffers", count);
        }
        count
    }

    /// Destroy every parked buffer
    pub fn clear(&self) -> usize {
        self.trim_pools(0)
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Number of buckets currently tracked
    pub fn bucket_count(&self) -> usize {
        self.state.lock().buckets.len()
    }

    /// Parked buffers in the bucket `desc` maps to
    pub fn pooled_count_for(&self, desc: &BufferDesc) -> usize {
        self.key_for(desc).map_or(0, |key| self.pooled_count(&key))
    }

    fn pooled_count(&self, key: &PoolKey) -> usize {
        self.state.lock().buckets.get(key).map_or(0, VecDeque::len)
    }

    /// Create through the factory, rejecting buffers smaller than asked for
    fn create_checked(&self, desc: &BufferDesc) -> Result<Arc<dyn Buffer>> {
        let buffer = self.factory.create_buffer(desc)?;
        let size = buffer.size();
        if size < desc.size {
            self.factory.destroy_buffer(buffer);
            gpu_bail!(
                self.logger,
                SOURCE,
                "Factory returned {} bytes for a {} byte buffer '{}'",
                size,
                desc.size,
                desc.name
            );
        }
        Ok(buffer)
    }

    /// `create_checked`, retried once after freeing parked buffers on out of memory
    fn create_reclaiming(&self, desc: &BufferDesc) -> Result<Arc<dyn Buffer>> {
        match self.create_checked(desc) {
            Err(Error::OutOfMemory) if self.stats().pooled > 0 => {
                let freed = self.clear();
                gpu_warn!(
                    self.logger,
                    SOURCE,
                    "Out of memory creating {} bytes, released {} pooled buffers",
                    desc.size,
                    freed
                );
                self.create_checked(desc)
            }
            result => result,
        }
    }

    fn bucket_desc(desc: &BufferDesc, key: &PoolKey) -> BufferDesc {
        BufferDesc { size: key.size_bucket, ..desc.clone() }
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        let active = self.stats().active;
        if active > 0 {
            gpu_warn!(self.logger, SOURCE, "Dropping pool with {} buffers still on loan", active);
        }
        self.clear();
    }
}

#[cfg(test)]
#[path = "object_pool_tests.rs"]
mod tests;
