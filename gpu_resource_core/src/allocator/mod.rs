//! Index allocation within a fixed capacity

mod index_allocator;

pub use index_allocator::{IndexAllocator, IndexAllocatorStats, IntegrityViolation};
