mod resource_manager;

pub use resource_manager::{
    BufferHandle, PendingUpload, ResourceManager, ResourceManagerConfig, ResourceManagerStats,
    UploadPath,
};
