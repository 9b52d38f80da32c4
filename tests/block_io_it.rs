#[path = "common/rbm.rs"]
mod common;

use common::{opened_memory, BLOCK, DEVICE, MIB};
use rbm::{ErrorKind, Paddr, RandomBlockManager, ReadError, Transaction, WriteError};

#[tokio::test]
async fn written_blocks_read_back() {
    let (_device, manager) = opened_memory(MIB).await;
    let t = Transaction::new();
    let addr = manager.alloc_extent(&t, 2 * BLOCK).await.unwrap();

    let payload: Vec<u8> = (0..2 * BLOCK).map(|i| (i % 251) as u8).collect();
    manager.write(&addr, &payload).await.unwrap();
    manager.complete_allocation(&t).await.unwrap();

    let mut out = vec![0u8; payload.len()];
    manager.read(&addr, &mut out).await.unwrap();
    assert_eq!(out, payload);
}

#[tokio::test]
async fn misaligned_io_is_rejected() {
    let (_device, manager) = opened_memory(MIB).await;
    let aligned = Paddr::make_blk_paddr(DEVICE, 8192);
    let misaligned = Paddr::make_blk_paddr(DEVICE, 8192 + 512);

    let mut buf = vec![0u8; BLOCK as usize];
    let err = manager.read(&misaligned, &mut buf).await.unwrap_err();
    assert!(matches!(err, ReadError::InvalidArgument(_)));
    let err = manager.write(&misaligned, &buf).await.unwrap_err();
    assert!(matches!(err, WriteError::InvalidArgument(_)));

    let mut short = vec![0u8; 100];
    let err = manager.read(&aligned, &mut short).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = manager.write(&aligned, &short).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn io_outside_the_data_area_is_out_of_range() {
    let (_device, manager) = opened_memory(MIB).await;
    let buf = vec![0u8; 2 * BLOCK as usize];

    let header = Paddr::make_blk_paddr(DEVICE, 0);
    let err = manager.write(&header, &buf[..BLOCK as usize]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);

    let straddles_end = Paddr::make_blk_paddr(DEVICE, MIB - BLOCK);
    let err = manager.write(&straddles_end, &buf).await.unwrap_err();
    assert!(matches!(err, WriteError::OutOfRange { .. }));

    let last = Paddr::make_blk_paddr(DEVICE, MIB - BLOCK);
    manager.write(&last, &buf[..BLOCK as usize]).await.unwrap();
}

#[tokio::test]
async fn writes_do_not_require_an_allocation() {
    // Allocation bookkeeping and block I/O are independent; callers own the pairing.
    let (_device, manager) = opened_memory(MIB).await;
    let addr = Paddr::make_blk_paddr(DEVICE, 64 * BLOCK);
    manager.write(&addr, &[7u8; BLOCK as usize]).await.unwrap();
    assert_eq!(manager.get_free_blocks(), 254);
}

#[tokio::test]
async fn device_level_no_space_is_not_an_allocation_failure() {
    let (device, manager) = opened_memory(MIB).await;
    let addr = Paddr::make_blk_paddr(DEVICE, 8192);
    device.exhaust_next_writes(1);
    let err = manager.write(&addr, &[0u8; BLOCK as usize]).await.unwrap_err();
    assert!(matches!(err, WriteError::NoSpace));
    assert_eq!(err.kind(), ErrorKind::NoSpace);
}
