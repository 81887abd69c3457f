/// Device module - boundary types to the external device API

pub mod buffer;
pub mod factory;

pub use buffer::*;
pub use factory::*;

// Mock device for tests (no GPU required)
#[cfg(test)]
pub mod mock_device;

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
