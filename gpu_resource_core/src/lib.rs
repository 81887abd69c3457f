/*!
# GPU Resource Core

Lifetime and slot management for GPU resources, independent of any graphics API.

The device itself stays behind two traits, `Buffer` and `ResourceFactory`;
a backend implements them and everything here works through them.

## Architecture

- **IndexAllocator**: best-fit range allocator over a fixed number of slots
- **HandleTable**: reference-counted owner of resources behind generational handles
- **ObjectPool**: size-bucketed recycling of buffers
- **RingStagingAllocator**: rotating CPU-writable staging memory for uploads
- **DescriptorTable**: descriptor heap slots with tags and weak back-references
- **ResourceManager**: pool, handles and staging combined behind one API

Every component takes an `Arc<dyn Logger>` at construction and is `Send + Sync`.
*/

pub mod error;
pub mod log;
pub mod device;
pub mod allocator;
pub mod handle;
pub mod pool;
pub mod staging;
pub mod descriptor;
pub mod manager;

// Main gpucore namespace module
pub mod gpucore {
    // Error types
    pub use crate::error::{Error, Result};

    // Device boundary
    pub use crate::device::{Buffer, BufferDesc, BufferUsage, ResourceFactory};

    // Components
    pub use crate::allocator::{IndexAllocator, IndexAllocatorStats, IntegrityViolation};
    pub use crate::handle::{Handle, HandleTable};
    pub use crate::pool::{ObjectPool, PoolConfig, PoolKey, PoolStats, PooledBuffer};
    pub use crate::staging::{
        RingStagingAllocator, StagingAllocation, StagingBuffer, StagingConfig, StagingStats,
    };
    pub use crate::descriptor::{DescriptorHeapType, DescriptorSlotInfo, DescriptorTable};
    pub use crate::manager::{
        BufferHandle, PendingUpload, ResourceManager, ResourceManagerConfig,
        ResourceManagerStats, UploadPath,
    };

    // Logging sub-module (types only; the gpu_* macros live at the crate root)
    pub mod log {
        pub use crate::log::{
            null_logger, DefaultLogger, FacadeLogger, LogEntry, LogSeverity, Logger, NullLogger,
        };
    }
}
