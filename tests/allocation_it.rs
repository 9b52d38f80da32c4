#[path = "common/rbm.rs"]
mod common;

use common::{formatted_memory, init_logging, opened_memory, BLOCK, DEVICE, MIB};
use rbm::{
    to_absolute, AllocateError, BlockRbManager, CompleteAllocationError, ErrorKind, FormatOptions,
    FreeExtentError, MemoryDevice, OpenError, Paddr, RandomBlockManager, Transaction,
};
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test]
async fn fresh_megabyte_device_scenario() {
    let (_device, manager) = opened_memory(MIB).await;
    assert_eq!(manager.get_size(), MIB);
    assert_eq!(manager.get_block_size(), BLOCK);
    assert_eq!(manager.geometry().start_data_area, 8192);
    // [8 KiB, 1 MiB) holds 254 blocks; the first two carry the header and bitmap.
    assert_eq!(manager.get_free_blocks(), 254);

    let t = Transaction::new();
    let addr = manager.alloc_extent(&t, BLOCK).await.unwrap();
    assert_eq!(addr, Paddr::make_blk_paddr(DEVICE, 8192));
    assert_eq!(manager.get_free_blocks(), 254);
    manager.complete_allocation(&t).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 253);
}

#[tokio::test]
async fn abort_restores_free_space_exactly() {
    let (_device, manager) = opened_memory(MIB).await;
    let before = manager.get_free_blocks();

    let t = Transaction::new();
    let first = manager.alloc_extent(&t, 3 * BLOCK).await.unwrap();
    manager.alloc_extent(&t, 5000).await.unwrap();
    manager.abort_allocation(&t).await.unwrap();
    assert_eq!(manager.get_free_blocks(), before);

    let t2 = Transaction::new();
    let again = manager.alloc_extent(&t2, 3 * BLOCK).await.unwrap();
    assert_eq!(again, first);
}

#[tokio::test]
async fn sizes_round_up_to_whole_blocks() {
    let (_device, manager) = opened_memory(MIB).await;
    let t = Transaction::new();
    let a = manager.alloc_extent(&t, 1).await.unwrap();
    let b = manager.alloc_extent(&t, BLOCK + 1).await.unwrap();
    let c = manager.alloc_extent(&t, BLOCK).await.unwrap();
    assert_eq!(to_absolute(&b) - to_absolute(&a), BLOCK);
    assert_eq!(to_absolute(&c) - to_absolute(&b), 2 * BLOCK);
    manager.complete_allocation(&t).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 254 - 4);
}

#[tokio::test]
async fn zero_sized_allocation_is_invalid() {
    let (_device, manager) = opened_memory(MIB).await;
    let err = manager
        .alloc_extent(&Transaction::new(), 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn exhaustion_leaves_free_count_unchanged() {
    let (_device, manager) = opened_memory(MIB).await;
    let t = Transaction::new();
    manager.alloc_extent(&t, 254 * BLOCK).await.unwrap();
    let err = manager
        .alloc_extent(&Transaction::new(), BLOCK)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocateError::NoSpace { largest: 0, .. }));
    assert_eq!(manager.get_free_blocks(), 254);

    manager.abort_allocation(&t).await.unwrap();
    let err = manager
        .alloc_extent(&Transaction::new(), 255 * BLOCK)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSpace);
    assert_eq!(manager.get_free_blocks(), 254);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_never_share_blocks() {
    let (_device, manager) = opened_memory(MIB).await;
    let mut tasks = Vec::new();
    for worker in 0..8u64 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            let t = Transaction::new();
            let mut extents = Vec::new();
            for round in 0..6u64 {
                let len = ((worker + round) % 3 + 1) * BLOCK;
                let addr = manager.alloc_extent(&t, len).await.unwrap();
                extents.push((to_absolute(&addr), len));
            }
            if worker % 2 == 0 {
                manager.complete_allocation(&t).await.unwrap();
            }
            (worker % 2 == 0, extents)
        }));
    }

    let mut blocks = BTreeSet::new();
    let mut committed = 0;
    for task in tasks {
        let (completed, extents) = task.await.unwrap();
        for (offset, len) in extents {
            if completed {
                committed += len / BLOCK;
            }
            for block in (offset / BLOCK)..((offset + len) / BLOCK) {
                assert!(blocks.insert(block), "block {block} handed out twice");
            }
        }
    }
    assert_eq!(manager.get_free_blocks(), 254 - committed);
}

#[tokio::test]
async fn free_extent_returns_blocks_on_complete() {
    let (_device, manager) = opened_memory(MIB).await;
    let t = Transaction::new();
    let addr = manager.alloc_extent(&t, 4 * BLOCK).await.unwrap();
    manager.complete_allocation(&t).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 250);

    let release = Transaction::new();
    manager
        .free_extent(&release, &addr, 4 * BLOCK)
        .await
        .unwrap();
    assert_eq!(manager.get_free_blocks(), 250);
    manager.complete_allocation(&release).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 254);

    let reuse = Transaction::new();
    assert_eq!(manager.alloc_extent(&reuse, BLOCK).await.unwrap(), addr);
}

#[tokio::test]
async fn free_extent_then_abort_keeps_blocks_allocated() {
    let (_device, manager) = opened_memory(MIB).await;
    let t = Transaction::new();
    let addr = manager.alloc_extent(&t, 2 * BLOCK).await.unwrap();
    manager.complete_allocation(&t).await.unwrap();

    let release = Transaction::new();
    manager
        .free_extent(&release, &addr, 2 * BLOCK)
        .await
        .unwrap();
    manager.abort_allocation(&release).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 252);

    // Still allocated, so a second release is accepted.
    let again = Transaction::new();
    manager.free_extent(&again, &addr, 2 * BLOCK).await.unwrap();
}

#[tokio::test]
async fn free_extent_rejects_unallocated_and_foreign_ranges() {
    let (_device, manager) = opened_memory(MIB).await;
    let t = Transaction::new();
    let reserved = manager.alloc_extent(&t, BLOCK).await.unwrap();
    assert!(matches!(
        manager.free_extent(&t, &reserved, BLOCK).await,
        Err(FreeExtentError::NotFound { .. })
    ));
    assert!(matches!(
        manager.free_extent(&t, &Paddr::Null, BLOCK).await,
        Err(FreeExtentError::InvalidArgument(_))
    ));
    let bitmap_block = Paddr::make_blk_paddr(DEVICE, BLOCK);
    assert!(matches!(
        manager.free_extent(&t, &bitmap_block, BLOCK).await,
        Err(FreeExtentError::OutOfRange { .. })
    ));
}

#[tokio::test]
async fn failed_complete_can_be_retried() {
    let (device, manager) = opened_memory(MIB).await;
    let t = Transaction::new();
    manager.alloc_extent(&t, BLOCK).await.unwrap();

    device.fail_next_writes(1);
    let err = manager.complete_allocation(&t).await.unwrap_err();
    assert!(matches!(err, CompleteAllocationError::Io(_)));
    assert_eq!(manager.get_free_blocks(), 254);

    manager.complete_allocation(&t).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 253);
}

#[tokio::test]
async fn committed_allocations_survive_reopen() {
    let (_device, manager) = formatted_memory(MIB).await;
    manager.open().await.unwrap();
    let t = Transaction::new();
    let committed = manager.alloc_extent(&t, 2 * BLOCK).await.unwrap();
    manager.complete_allocation(&t).await.unwrap();
    let pending = Transaction::new();
    manager.alloc_extent(&pending, 8 * BLOCK).await.unwrap();
    manager.close().await.unwrap();

    manager.open().await.unwrap();
    assert_eq!(manager.get_free_blocks(), 252);
    let next = manager
        .alloc_extent(&Transaction::new(), BLOCK)
        .await
        .unwrap();
    assert_eq!(to_absolute(&next), to_absolute(&committed) + 2 * BLOCK);
}

#[tokio::test]
async fn boxed_manager_is_usable_through_the_trait() {
    let (_device, manager) = formatted_memory(MIB).await;
    let manager = manager.into_ref();
    manager.open().await.unwrap();
    let t = Transaction::new();
    manager.alloc_extent(&t, BLOCK).await.unwrap();
    manager.complete_allocation(&t).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 253);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn non_zero_start_offsets_the_whole_layout() {
    init_logging();
    let start = 4 * BLOCK;
    let device = Arc::new(MemoryDevice::new(DEVICE, MIB));
    let header = BlockRbManager::mkfs(
        device.as_ref(),
        FormatOptions::new(DEVICE, MIB).with_start(start),
    )
    .await
    .unwrap();
    assert_eq!(header.start, start);
    assert_eq!(header.start_data_area, 0x6000);

    let manager = BlockRbManager::new(device.clone()).with_start(start);
    manager.open().await.unwrap();
    assert_eq!(manager.header().await, Some(header));
    assert_eq!(manager.get_free_blocks(), 250);
    let t = Transaction::new();
    let addr = manager.alloc_extent(&t, BLOCK).await.unwrap();
    assert_eq!(addr, Paddr::make_blk_paddr(DEVICE, 0x6000));
    manager.complete_allocation(&t).await.unwrap();
    manager.close().await.unwrap();

    let reopened = BlockRbManager::new(device).with_start(start);
    reopened.open().await.unwrap();
    assert_eq!(reopened.get_free_blocks(), 249);
    let next = reopened
        .alloc_extent(&Transaction::new(), BLOCK)
        .await
        .unwrap();
    assert_eq!(to_absolute(&next), 0x7000);
}

#[tokio::test]
async fn header_recorded_for_another_start_is_rejected() {
    init_logging();
    let device = Arc::new(MemoryDevice::new(DEVICE, MIB));
    let header = BlockRbManager::mkfs(
        device.as_ref(),
        FormatOptions::new(DEVICE, MIB).with_start(4 * BLOCK),
    )
    .await
    .unwrap();
    // A valid header, but it describes a layout anchored at 16 KiB.
    device.corrupt(0, &header.encode_reserved());

    let manager = BlockRbManager::new(device);
    let err = manager.open().await.unwrap_err();
    assert!(matches!(err, OpenError::InvalidArgument(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(manager.get_size(), 0);
}
