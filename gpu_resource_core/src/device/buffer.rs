/// Buffer trait and buffer descriptor

use bitflags::bitflags;
use crate::error::Result;

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Vertex buffer
        const VERTEX = 1 << 0;
        /// Index buffer
        const INDEX = 1 << 1;
        /// Uniform/constant buffer
        const UNIFORM = 1 << 2;
        /// Storage buffer
        const STORAGE = 1 << 3;
        /// Indirect draw/dispatch arguments
        const INDIRECT = 1 << 4;
        /// Source of a copy (staging memory)
        const TRANSFER_SRC = 1 << 5;
        /// Destination of a copy
        const TRANSFER_DST = 1 << 6;
    }
}

/// Descriptor for creating a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Buffer usage
    pub usage: BufferUsage,
    /// Host-visible memory (mappable), device-local otherwise
    pub cpu_accessible: bool,
    /// Debug label
    pub name: String,
}

impl BufferDesc {
    /// Device-local buffer with an empty label
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            cpu_accessible: false,
            name: String::new(),
        }
    }

    /// Same description, host-visible
    pub fn cpu_accessible(mut self) -> Self {
        self.cpu_accessible = true;
        self
    }

    /// Same description with a debug label
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Buffer resource trait
///
/// Implemented by backend-specific buffer types. Buffers are created and
/// destroyed through a `ResourceFactory`, never directly by the core.
pub trait Buffer: Send + Sync {
    /// Size in bytes
    fn size(&self) -> u64;

    /// Usage flags the buffer was created with
    fn usage(&self) -> BufferUsage;

    /// Whether the memory can be mapped
    fn cpu_accessible(&self) -> bool;

    /// Debug label
    fn name(&self) -> &str {
        ""
    }

    /// Device address of the first byte
    fn gpu_address(&self) -> u64;

    /// Map the whole buffer and return the CPU pointer to its first byte
    ///
    /// Fails for device-local buffers. Mapping an already mapped buffer
    /// returns the same pointer.
    fn map(&self) -> Result<*mut u8>;

    /// Unmap the buffer. Pointers returned by `map` become invalid.
    fn unmap(&self);

    /// Raw pointer to currently mapped memory
    ///
    /// Returns None if the buffer is not mapped or not CPU-accessible.
    fn mapped_ptr(&self) -> Option<*mut u8>;

    /// Update buffer data
    ///
    /// # Arguments
    ///
    /// * `offset` - Offset into the buffer in bytes
    /// * `data` - Data to write
    fn update(&self, offset: u64, data: &[u8]) -> Result<()>;
}
