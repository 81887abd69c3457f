mod ring_staging;

pub use ring_staging::{
    RingStagingAllocator, StagingAllocation, StagingBuffer, StagingConfig, StagingStats,
};
