mod object_pool;

pub use object_pool::{
    size_bucket, ObjectPool, PoolConfig, PoolKey, PoolStats, PooledBuffer, MIN_BUCKET_SIZE,
};
