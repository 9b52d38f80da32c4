//! Persisted allocation bitmap.
//!
//! One bit per device block, indexed by absolute block number
//! (`offset / block_size`). A set bit marks the block allocated. The bitmap
//! lives in whole blocks between the header block and the data area, so a
//! change to any bit is persisted by rewriting the block that holds it.

use crate::types::{AbsAddr, BlkNo};
use std::ops::Range;

/// Bytes reserved for the bitmap of a `size`-byte device, rounded up to whole blocks.
pub fn bitmap_region_len(size: u64, block_size: u64) -> u64 {
    let blocks = size / block_size;
    let bytes = blocks.div_ceil(8);
    bytes.div_ceil(block_size) * block_size
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationBitmap {
    bits: Vec<u8>,
    total_blocks: u64,
    block_size: u64,
    region_start: AbsAddr,
}

impl AllocationBitmap {
    /// Wraps the raw bitmap region read from the device at `region_start`.
    pub fn from_region(
        bits: Vec<u8>,
        total_blocks: u64,
        block_size: u64,
        region_start: AbsAddr,
    ) -> Self {
        Self {
            bits,
            total_blocks,
            block_size,
            region_start,
        }
    }

    /// An all-clear bitmap covering `total_blocks` blocks.
    pub fn empty(total_blocks: u64, block_size: u64, region_start: AbsAddr) -> Self {
        let len = bitmap_region_len(total_blocks * block_size, block_size);
        Self::from_region(vec![0u8; len as usize], total_blocks, block_size, region_start)
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn region_start(&self) -> AbsAddr {
        self.region_start
    }

    pub fn is_set(&self, blk: BlkNo) -> bool {
        self.bits[(blk / 8) as usize] & (1 << (blk % 8)) != 0
    }

    pub fn all_set(&self, mut blocks: Range<BlkNo>) -> bool {
        blocks.all(|blk| self.is_set(blk))
    }

    pub fn any_set(&self, mut blocks: Range<BlkNo>) -> bool {
        blocks.any(|blk| self.is_set(blk))
    }

    pub fn set_range(&mut self, blocks: Range<BlkNo>, allocated: bool) {
        for blk in blocks {
            let mask = 1u8 << (blk % 8);
            let byte = &mut self.bits[(blk / 8) as usize];
            if allocated {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }

    pub fn count_clear(&self, blocks: Range<BlkNo>) -> u64 {
        blocks.filter(|&blk| !self.is_set(blk)).count() as u64
    }

    /// Maximal runs of clear bits within `blocks`, as `(first, count)`.
    pub fn clear_runs(&self, blocks: Range<BlkNo>) -> Vec<(BlkNo, u64)> {
        let mut runs = Vec::new();
        let mut current: Option<(BlkNo, u64)> = None;
        for blk in blocks {
            if self.is_set(blk) {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
            } else {
                match current.as_mut() {
                    Some((_, count)) => *count += 1,
                    None => current = Some((blk, 1)),
                }
            }
        }
        runs.extend(current);
        runs
    }

    /// Indices of the bitmap blocks holding the bits of `blocks`.
    pub fn covering_blocks(&self, blocks: Range<BlkNo>) -> Range<u64> {
        if blocks.is_empty() {
            return 0..0;
        }
        let bits_per_block = self.block_size * 8;
        (blocks.start / bits_per_block)..((blocks.end - 1) / bits_per_block + 1)
    }

    /// Device offset and contents of bitmap block `index`.
    pub fn block(&self, index: u64) -> (AbsAddr, &[u8]) {
        let start = (index * self.block_size) as usize;
        let end = start + self.block_size as usize;
        (
            self.region_start + index * self.block_size,
            &self.bits[start..end],
        )
    }
}
