#![allow(dead_code)]

use rbm::{BlockRbManager, DeviceId, FormatOptions, MemoryDevice, RandomBlockManager};
use std::sync::Arc;

pub const MIB: u64 = 1 << 20;
pub const BLOCK: u64 = 4096;
pub const DEVICE: DeviceId = DeviceId(0);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Formats a fresh in-memory device of `size` bytes with 4 KiB blocks.
pub async fn formatted_memory(size: u64) -> (Arc<MemoryDevice>, BlockRbManager) {
    init_logging();
    let device = Arc::new(MemoryDevice::new(DEVICE, size));
    BlockRbManager::mkfs(device.as_ref(), FormatOptions::new(DEVICE, size))
        .await
        .expect("mkfs");
    let manager = BlockRbManager::new(device.clone());
    (device, manager)
}

/// Like [`formatted_memory`] but already open and shareable between tasks.
pub async fn opened_memory(size: u64) -> (Arc<MemoryDevice>, Arc<BlockRbManager>) {
    let (device, manager) = formatted_memory(size).await;
    manager.open().await.expect("open");
    (device, Arc::new(manager))
}
