use crate::transaction::TransactionId;
use crate::types::BlkNo;
use std::collections::HashMap;
use std::ops::Range;

/// Blocks tagged to one transaction and not yet reflected in the bitmap.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Runs claimed by `alloc_extent`, as `(first, count)`.
    pub extents: Vec<(BlkNo, u64)>,
    /// Allocated runs the transaction will release on completion.
    pub releases: Vec<(BlkNo, u64)>,
}

impl Reservation {
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty() && self.releases.is_empty()
    }

    pub fn reserved_blocks(&self) -> u64 {
        self.extents.iter().map(|(_, count)| count).sum()
    }

    pub fn released_blocks(&self) -> u64 {
        self.releases.iter().map(|(_, count)| count).sum()
    }
}

/// Live reservations keyed by transaction.
///
/// Entries are created lazily by the first claim or release and removed
/// exactly once, by [`ReservationLedger::take`].
#[derive(Debug, Default)]
pub struct ReservationLedger {
    entries: HashMap<TransactionId, Reservation>,
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, txn: TransactionId, first: BlkNo, count: u64) {
        self.entries
            .entry(txn)
            .or_default()
            .extents
            .push((first, count));
    }

    pub fn release(&mut self, txn: TransactionId, first: BlkNo, count: u64) {
        self.entries
            .entry(txn)
            .or_default()
            .releases
            .push((first, count));
    }

    /// Whether any transaction already plans to release a block in `blocks`.
    pub fn is_releasing(&self, blocks: Range<BlkNo>) -> bool {
        self.entries
            .values()
            .flat_map(|reservation| reservation.releases.iter())
            .any(|&(first, count)| first < blocks.end && blocks.start < first + count)
    }

    pub fn get(&self, txn: TransactionId) -> Option<&Reservation> {
        self.entries.get(&txn)
    }

    pub fn take(&mut self, txn: TransactionId) -> Option<Reservation> {
        self.entries.remove(&txn)
    }

    /// Puts back a reservation whose completion failed.
    pub fn restore(&mut self, txn: TransactionId, reservation: Reservation) {
        self.entries.insert(txn, reservation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (TransactionId, Reservation)> + '_ {
        self.entries.drain()
    }
}
