//! Free-space bookkeeping for the data area.
//!
//! Three structures cooperate:
//!
//! * [`AllocationBitmap`]: the persisted truth, one bit per device block.
//! * [`FreeExtents`]: runs that are clear in the bitmap *and* not claimed by
//!   any live reservation. Every allocation is carved from here, so two
//!   transactions can never be handed overlapping blocks.
//! * [`ReservationLedger`]: per-transaction claims and pending releases,
//!   folded into the bitmap only by [`BlockAllocator::complete`].

pub mod bitmap;
pub mod extents;
pub mod reservation;

pub use bitmap::{bitmap_region_len, AllocationBitmap};
pub use extents::FreeExtents;
pub use reservation::{Reservation, ReservationLedger};

use crate::device::{Device, DeviceError};
use crate::error::{
    AbortAllocationError, AllocateError, CompleteAllocationError, FreeExtentError,
};
use crate::header::RbmMetadataHeader;
use crate::transaction::TransactionId;
use crate::types::{AbsAddr, BlkNo};
use log::error;
use std::collections::BTreeSet;
use std::ops::Range;

#[derive(Debug)]
pub struct BlockAllocator {
    block_size: u64,
    data_blocks: Range<BlkNo>,
    bitmap: AllocationBitmap,
    free: FreeExtents,
    ledger: ReservationLedger,
    persisted_free: u64,
    sync_on_complete: bool,
}

impl BlockAllocator {
    /// Rebuilds allocator state from a bitmap already read off the device.
    pub fn new(
        header: &RbmMetadataHeader,
        bitmap: AllocationBitmap,
        sync_on_complete: bool,
    ) -> Self {
        let block_size = header.block_size;
        let data_blocks =
            (u64::from(header.start_data_area) / block_size)..(header.size / block_size);
        let free = FreeExtents::from_runs(bitmap.clear_runs(data_blocks.clone()));
        let persisted_free = free.total();
        Self {
            block_size,
            data_blocks,
            bitmap,
            free,
            ledger: ReservationLedger::new(),
            persisted_free,
            sync_on_complete,
        }
    }

    /// Reads the bitmap region described by `header` and builds the allocator.
    pub async fn load(
        device: &dyn Device,
        header: &RbmMetadataHeader,
        sync_on_complete: bool,
    ) -> Result<Self, DeviceError> {
        let region_start = header.start + header.block_size;
        let region_len = bitmap_region_len(header.size, header.block_size);
        let bits = device.read(region_start, region_len as usize).await?;
        let bitmap = AllocationBitmap::from_region(
            bits,
            header.size / header.block_size,
            header.block_size,
            region_start,
        );
        Ok(Self::new(header, bitmap, sync_on_complete))
    }

    /// Free blocks as of the last completed transaction.
    pub fn free_blocks(&self) -> u64 {
        self.persisted_free
    }

    /// Blocks neither allocated nor reserved right now.
    pub fn available_blocks(&self) -> u64 {
        self.free.total()
    }

    pub fn bitmap(&self) -> &AllocationBitmap {
        &self.bitmap
    }

    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    /// Claims the lowest-addressed run of blocks covering `bytes` for `txn`.
    pub fn allocate(&mut self, txn: TransactionId, bytes: u64) -> Result<AbsAddr, AllocateError> {
        if bytes == 0 {
            return Err(AllocateError::InvalidArgument(
                "allocation size must be non-zero".into(),
            ));
        }
        let count = bytes.div_ceil(self.block_size);
        let Some(first) = self.free.first_fit(count) else {
            return Err(AllocateError::NoSpace {
                requested: count.saturating_mul(self.block_size),
                largest: self.free.largest() * self.block_size,
            });
        };
        self.free.remove(first, count);
        self.ledger.reserve(txn, first, count);
        Ok(first * self.block_size)
    }

    /// Records that `txn` releases the allocated extent `[addr, addr + len)`.
    pub fn release(
        &mut self,
        txn: TransactionId,
        addr: AbsAddr,
        len: u64,
    ) -> Result<(), FreeExtentError> {
        if len == 0 || addr % self.block_size != 0 || len % self.block_size != 0 {
            return Err(FreeExtentError::InvalidArgument(format!(
                "extent {addr:#x}+{len} is not aligned to block size {}",
                self.block_size
            )));
        }
        let blocks = self
            .blocks_in_data_area(addr, len)
            .ok_or(FreeExtentError::OutOfRange { addr, len })?;
        if !self.bitmap.all_set(blocks.clone()) {
            return Err(FreeExtentError::NotFound { addr, len });
        }
        if self.ledger.is_releasing(blocks.clone()) {
            return Err(FreeExtentError::InvalidArgument(format!(
                "extent {addr:#x}+{len} is already being released"
            )));
        }
        self.ledger.release(txn, blocks.start, blocks.end - blocks.start);
        Ok(())
    }

    /// Drops every claim and pending release of `txn`.
    ///
    /// Returns the number of blocks handed back to the free pool.
    pub fn abort(&mut self, txn: TransactionId) -> Result<u64, AbortAllocationError> {
        let Some(reservation) = self.ledger.take(txn) else {
            return Ok(0);
        };
        for &(first, count) in &reservation.extents {
            self.free.insert(first, count);
        }
        Ok(reservation.reserved_blocks())
    }

    /// Folds the reservation of `txn` into the bitmap and persists it.
    ///
    /// On failure the in-memory bitmap is restored and the reservation stays
    /// live, so the caller may retry or abort.
    pub async fn complete(
        &mut self,
        device: &dyn Device,
        txn: TransactionId,
    ) -> Result<Reservation, CompleteAllocationError> {
        let Some(reservation) = self.ledger.take(txn) else {
            return Err(CompleteAllocationError::InvalidArgument(format!(
                "{txn} holds no reservation"
            )));
        };
        if let Err(err) = self.check_reservation(&reservation) {
            self.ledger.restore(txn, reservation);
            return Err(err);
        }

        let previous = self.bitmap.clone();
        let mut touched = BTreeSet::new();
        for &(first, count) in &reservation.extents {
            self.bitmap.set_range(first..first + count, true);
            touched.extend(self.bitmap.covering_blocks(first..first + count));
        }
        for &(first, count) in &reservation.releases {
            self.bitmap.set_range(first..first + count, false);
            touched.extend(self.bitmap.covering_blocks(first..first + count));
        }

        if let Err(err) = self.persist(device, &touched).await {
            error!(
                "event=rbm_bitmap_persist_failed txn={} blocks={} error={}",
                txn,
                touched.len(),
                err
            );
            self.bitmap = previous;
            if let Err(rollback) = self.persist(device, &touched).await {
                error!(
                    "event=rbm_bitmap_rollback_failed txn={} error={}",
                    txn, rollback
                );
            }
            self.ledger.restore(txn, reservation);
            return Err(err.into());
        }

        for &(first, count) in &reservation.releases {
            self.free.insert(first, count);
        }
        self.persisted_free = self.persisted_free + reservation.released_blocks()
            - reservation.reserved_blocks();
        Ok(reservation)
    }

    /// Forgets every live reservation, returning claimed runs to the free pool.
    pub fn clear_reservations(&mut self) {
        for (_, reservation) in self.ledger.drain() {
            for (first, count) in reservation.extents {
                self.free.insert(first, count);
            }
        }
    }

    fn check_reservation(
        &self,
        reservation: &Reservation,
    ) -> Result<(), CompleteAllocationError> {
        for &(first, count) in &reservation.extents {
            if first < self.data_blocks.start || first + count > self.data_blocks.end {
                return Err(CompleteAllocationError::OutOfRange {
                    addr: first * self.block_size,
                    len: count * self.block_size,
                });
            }
        }
        for &(first, count) in &reservation.releases {
            if !self.bitmap.all_set(first..first + count) {
                return Err(CompleteAllocationError::NotFound {
                    addr: first * self.block_size,
                    len: count * self.block_size,
                });
            }
        }
        Ok(())
    }

    async fn persist(
        &self,
        device: &dyn Device,
        touched: &BTreeSet<u64>,
    ) -> Result<(), DeviceError> {
        for &index in touched {
            let (offset, bytes) = self.bitmap.block(index);
            device.write(offset, bytes).await?;
        }
        if self.sync_on_complete {
            device.sync().await?;
        }
        Ok(())
    }

    fn blocks_in_data_area(&self, addr: AbsAddr, len: u64) -> Option<Range<BlkNo>> {
        let first = addr / self.block_size;
        let end = first.checked_add(len / self.block_size)?;
        (first >= self.data_blocks.start && end <= self.data_blocks.end).then_some(first..end)
    }
}
