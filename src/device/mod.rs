//! Raw, byte-addressed device backends consumed by the manager.

pub mod file;
pub mod memory;

use crate::types::DeviceId;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub use file::FileDevice;
pub use memory::MemoryDevice;

/// A randomly addressable storage medium.
///
/// Implementations own buffering and hardware alignment; callers only see
/// byte offsets. All I/O is asynchronous and fallible.
#[async_trait]
pub trait Device: Send + Sync + fmt::Debug {
    async fn open(&self) -> Result<(), DeviceError>;

    async fn close(&self) -> Result<(), DeviceError>;

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError>;

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    async fn sync(&self) -> Result<(), DeviceError>;

    /// Capacity in bytes.
    fn size(&self) -> u64;

    fn device_id(&self) -> DeviceId;
}

/// Shared handle to a device; the backend is released when the last clone drops.
pub type DeviceRef = Arc<dyn Device>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("range {offset:#x}+{len} exceeds device size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[error("device has no space left")]
    NoSpace,
    #[error("device is not open")]
    NotOpen,
    #[error("device is read-only")]
    ReadOnly,
}

pub(crate) fn check_bounds(offset: u64, len: u64, size: u64) -> Result<(), DeviceError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfRange { offset, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_reject_overflow_and_tail() {
        assert!(check_bounds(0, 4096, 4096).is_ok());
        assert!(matches!(
            check_bounds(4096, 1, 4096),
            Err(DeviceError::OutOfRange { .. })
        ));
        assert!(matches!(
            check_bounds(u64::MAX, 2, 4096),
            Err(DeviceError::OutOfRange { .. })
        ));
    }
}
