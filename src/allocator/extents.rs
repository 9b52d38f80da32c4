use crate::types::BlkNo;
use std::collections::BTreeMap;

/// In-memory index of free block runs, keyed by first block.
///
/// Adjacent runs are merged on insert, so the map never holds two touching
/// extents and the first run that fits is also the lowest-addressed one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeExtents {
    runs: BTreeMap<BlkNo, u64>,
    total: u64,
}

impl FreeExtents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_runs(runs: impl IntoIterator<Item = (BlkNo, u64)>) -> Self {
        let mut extents = Self::new();
        for (start, count) in runs {
            extents.insert(start, count);
        }
        extents
    }

    /// Free blocks across every run.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn largest(&self) -> u64 {
        self.runs.values().copied().max().unwrap_or(0)
    }

    pub fn runs(&self) -> impl Iterator<Item = (BlkNo, u64)> + '_ {
        self.runs.iter().map(|(&start, &count)| (start, count))
    }

    pub fn contains(&self, start: BlkNo, count: u64) -> bool {
        match self.runs.range(..=start).next_back() {
            Some((&run_start, &run_count)) => start + count <= run_start + run_count,
            None => false,
        }
    }

    /// Lowest-addressed run that holds `count` blocks.
    pub fn first_fit(&self, count: u64) -> Option<BlkNo> {
        self.runs
            .iter()
            .find(|(_, run_count)| **run_count >= count)
            .map(|(&start, _)| start)
    }

    /// Returns `[start, start + count)` to the index, merging with neighbours.
    ///
    /// Panics if the range overlaps a free run; callers only return blocks
    /// they previously took out.
    pub fn insert(&mut self, start: BlkNo, count: u64) {
        if count == 0 {
            return;
        }
        let mut first = start;
        let mut end = start + count;
        if let Some((&prev_start, &prev_count)) = self.runs.range(..=start).next_back() {
            assert!(
                prev_start + prev_count <= start,
                "blocks {start}+{count} already free in run {prev_start}+{prev_count}"
            );
            if prev_start + prev_count == start {
                self.runs.remove(&prev_start);
                first = prev_start;
            }
        }
        if let Some((&next_start, &next_count)) = self.runs.range(start..).next() {
            assert!(
                next_start >= end,
                "blocks {start}+{count} already free in run {next_start}+{next_count}"
            );
            if next_start == end {
                self.runs.remove(&next_start);
                end += next_count;
            }
        }
        self.runs.insert(first, end - first);
        self.total += count;
    }

    /// Carves `[start, start + count)` out of the run containing it.
    ///
    /// Returns `false` and leaves the index untouched when the range is not
    /// entirely free.
    pub fn remove(&mut self, start: BlkNo, count: u64) -> bool {
        if count == 0 {
            return true;
        }
        let Some((&run_start, &run_count)) = self.runs.range(..=start).next_back() else {
            return false;
        };
        let run_end = run_start + run_count;
        let end = start + count;
        if end > run_end {
            return false;
        }
        self.runs.remove(&run_start);
        if run_start < start {
            self.runs.insert(run_start, start - run_start);
        }
        if end < run_end {
            self.runs.insert(end, run_end - end);
        }
        self.total -= count;
        true
    }
}
