//! Sets of half-open LSN ranges.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::types::Lsn;

/// A sorted set of non-overlapping, non-adjacent half-open LSN ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsnRanges {
    ranges: Vec<Range<Lsn>>,
}

impl LsnRanges {
    /// Returns an empty set.
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Contiguous ranges in ascending order.
    pub fn ranges(&self) -> &[Range<Lsn>] {
        &self.ranges
    }

    /// True if no LSN is covered.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True if `range` shares at least one position with the set.
    pub fn overlaps(&self, range: &Range<Lsn>) -> bool {
        if range.start >= range.end {
            return false;
        }
        // first stored range that ends after range.start
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .map(|r| r.start < range.end)
            .unwrap_or(false)
    }

    /// Number of positions of `range` covered by the set.
    pub fn covered_len(&self, range: &Range<Lsn>) -> u64 {
        self.ranges
            .iter()
            .map(|r| {
                let start = r.start.max(range.start);
                let end = r.end.min(range.end);
                end.distance_from(start)
            })
            .sum()
    }
}

/// Collects possibly overlapping ranges and merges them into an [`LsnRanges`].
#[derive(Clone, Debug, Default)]
pub struct LsnRangeAccum {
    pending: Vec<Range<Lsn>>,
}

impl LsnRangeAccum {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Adds a range; empty ranges are ignored.
    pub fn add_range(&mut self, range: Range<Lsn>) {
        if range.start < range.end {
            self.pending.push(range);
        }
    }

    /// Sorts and merges the collected ranges.
    pub fn to_ranges(mut self) -> LsnRanges {
        self.pending.sort_by_key(|r| r.start);
        let mut merged: Vec<Range<Lsn>> = Vec::with_capacity(self.pending.len());
        for range in self.pending {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    if range.end > last.end {
                        last.end = range.end;
                    }
                }
                _ => merged.push(range),
            }
        }
        LsnRanges { ranges: merged }
    }
}
