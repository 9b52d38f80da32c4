//! Heap-backed device used by tests and ephemeral stores.

use super::{check_bounds, Device, DeviceError};
use crate::types::DeviceId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A device whose contents live in memory for as long as the value does.
///
/// Closing and reopening keeps the contents, so a manager can be reopened
/// against the state a previous instance persisted.
#[derive(Debug)]
pub struct MemoryDevice {
    device_id: DeviceId,
    data: Mutex<Vec<u8>>,
    unmapped: Mutex<Vec<(u64, u64)>>,
    open: AtomicBool,
    read_only: AtomicBool,
    failing_writes: AtomicUsize,
    no_space_writes: AtomicUsize,
    failing_closes: AtomicUsize,
}

impl MemoryDevice {
    pub fn new(device_id: DeviceId, size: u64) -> Self {
        Self {
            device_id,
            data: Mutex::new(vec![0u8; size as usize]),
            unmapped: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
            no_space_writes: AtomicUsize::new(0),
            failing_closes: AtomicUsize::new(0),
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Makes reads overlapping `[offset, offset + len)` report the range as absent.
    pub fn unmap(&self, offset: u64, len: u64) {
        self.unmapped.lock().push((offset, len));
    }

    /// The next `count` writes fail with an I/O error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// The next `count` writes fail as if the medium were exhausted.
    pub fn exhaust_next_writes(&self, count: usize) {
        self.no_space_writes.store(count, Ordering::SeqCst);
    }

    /// The next `count` closes fail and leave the device open.
    pub fn fail_next_closes(&self, count: usize) {
        self.failing_closes.store(count, Ordering::SeqCst);
    }

    /// Copy of the raw contents, regardless of the open state.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrites raw bytes, bypassing the open state and fault injection.
    pub fn corrupt(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data.lock();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Device for MemoryDevice {
    async fn open(&self) -> Result<(), DeviceError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        if Self::take_fault(&self.failing_closes) {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected close failure",
            )));
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.ensure_open()?;
        check_bounds(offset, len as u64, self.size())?;
        let end = offset + len as u64;
        let absent = self
            .unmapped
            .lock()
            .iter()
            .any(|&(start, hole_len)| offset < start + hole_len && start < end);
        if absent {
            return Err(DeviceError::NotFound(format!(
                "range {offset:#x}+{len} is unmapped"
            )));
        }
        let data = self.data.lock();
        Ok(data[offset as usize..end as usize].to_vec())
    }

    async fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(DeviceError::ReadOnly);
        }
        check_bounds(offset, bytes.len() as u64, self.size())?;
        if Self::take_fault(&self.no_space_writes) {
            return Err(DeviceError::NoSpace);
        }
        if Self::take_fault(&self.failing_writes) {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        let mut data = self.data.lock();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn sync(&self) -> Result<(), DeviceError> {
        self.ensure_open()
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn device_id(&self) -> DeviceId {
        self.device_id
    }
}
