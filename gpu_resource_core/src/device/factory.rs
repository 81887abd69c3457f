/// ResourceFactory trait - boundary to the device API

use std::sync::Arc;

use crate::device::{Buffer, BufferDesc};
use crate::error::Result;

/// Creates and destroys GPU objects on behalf of the core
///
/// Implemented by the device layer (Vulkan, D3D12, ...). The object pool,
/// staging allocator and resource manager only ever reach the device through
/// this trait.
pub trait ResourceFactory: Send + Sync {
    /// Create a buffer
    ///
    /// # Arguments
    ///
    /// * `desc` - Buffer descriptor
    ///
    /// # Returns
    ///
    /// A shared pointer to the created buffer
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn Buffer>>;

    /// Destroy a buffer previously returned by `create_buffer`
    fn destroy_buffer(&self, buffer: Arc<dyn Buffer>);
}
