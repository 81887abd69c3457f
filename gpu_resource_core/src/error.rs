//! Error types for the GPU resource core
//!
//! Capacity exhaustion and stale handles are normally reported through
//! `Option`/`bool` return values. This type covers the paths that go through
//! the resource factory, configuration validation and the manager facade.

use std::fmt;

/// Result type for resource core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Resource core errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Backend-specific error reported by the resource factory
    BackendError(String),

    /// Out of GPU memory
    OutOfMemory,

    /// Invalid resource (wrong size, not CPU-accessible, out-of-range write...)
    InvalidResource(String),

    /// Initialization failed (staging buffers, manager construction)
    InitializationFailed(String),

    /// Handle is stale, destroyed or was never issued by this table
    InvalidHandle(String),

    /// Every staging buffer is full; carries the requested size in bytes
    StagingExhausted(u64),

    /// A configuration struct failed validation
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
            Error::InvalidResource(msg) => write!(f, "Invalid resource: {}", msg),
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
            Error::InvalidHandle(msg) => write!(f, "Invalid handle: {}", msg),
            Error::StagingExhausted(size) => {
                write!(f, "Staging memory exhausted ({} bytes requested)", size)
            }
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
