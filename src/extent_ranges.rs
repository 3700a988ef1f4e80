//! Set algebra over block ranges.
//!
//! An [`ExtentRangeSet`] is a collection of blocks stored as sorted, disjoint
//! extents. Blocks are added and removed with set union and set difference.
//! Sparse hole extents are ignored so that a hole is never mistaken for free
//! space.
use std::collections::BTreeMap;
use std::fmt;
use log::{debug, warn};
use crate::extent::{extents_overlap, extents_overlap_or_touch, Extent};

#[derive(Debug, Clone)]
pub struct ExtentRangeSet {
    // start block -> number of blocks
    extents: BTreeMap<u64, u64>,
    blocks: u64,
    merge_touching: bool,
}

impl Default for ExtentRangeSet {
    fn default() -> Self {
        ExtentRangeSet::new()
    }
}

impl PartialEq for ExtentRangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.extents == other.extents
    }
}

impl Eq for ExtentRangeSet {}

impl fmt::Display for ExtentRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, extent) in self.extents().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", extent)?;
        }
        write!(f, "}} ({} blocks)", self.blocks)
    }
}

impl FromIterator<Extent> for ExtentRangeSet {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        let mut ranges = ExtentRangeSet::new();
        for extent in iter {
            ranges.add_extent(extent);
        }
        ranges
    }
}

impl ExtentRangeSet {
    pub fn new() -> Self {
        ExtentRangeSet::with_merge_touching(true)
    }

    /// When `merge_touching` is false, extents that only touch are kept apart:
    /// [5-9] and [10-14] stay two extents. Overlapping extents are always merged.
    pub fn with_merge_touching(merge_touching: bool) -> Self {
        ExtentRangeSet {
            extents: BTreeMap::new(),
            blocks: 0,
            merge_touching,
        }
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// number of stored extents
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// stored extents in ascending start block order
    pub fn extents(&self) -> impl DoubleEndedIterator<Item = Extent> + '_ {
        self.extents.iter().map(|(&start, &num)| Extent::new(start, num))
    }

    pub fn to_vec(&self) -> Vec<Extent> {
        self.extents().collect()
    }

    pub fn add_block(&mut self, block: u64) {
        self.add_extent(Extent::new(block, 1));
    }

    pub fn subtract_block(&mut self, block: u64) {
        self.subtract_extent(&Extent::new(block, 1));
    }

    /// Extents running past the last addressable block are ignored
    pub fn add_extent(&mut self, extent: Extent) {
        if extent.is_empty() || extent.is_sparse_hole() {
            return;
        }
        if extent.checked_end_block().is_none() {
            warn!("ignoring extent {} past the last block", extent);
            return;
        }
        let mut merged_start = extent.start_block;
        let mut merged_end = extent.end_block();
        let mut absorbed = Vec::new();
        for (&start, &num) in self.extents.range(..=extent.end_block()).rev() {
            let stored = Extent::new(start, num);
            let joins = if self.merge_touching {
                extents_overlap_or_touch(&stored, &extent)
            } else {
                extents_overlap(&stored, &extent)
            };
            if !joins {
                if stored.end_block() <= extent.start_block {
                    break;
                }
                continue;
            }
            merged_start = merged_start.min(stored.start_block);
            merged_end = merged_end.max(stored.end_block());
            absorbed.push(stored);
        }
        for stored in absorbed {
            self.extents.remove(&stored.start_block);
            self.blocks -= stored.num_blocks;
        }
        self.extents.insert(merged_start, merged_end - merged_start);
        self.blocks += merged_end - merged_start;
        self.check_invariants();
    }

    pub fn subtract_extent(&mut self, extent: &Extent) {
        if extent.is_empty() || extent.is_sparse_hole() {
            return;
        }
        if extent.checked_end_block().is_none() {
            warn!("ignoring extent {} past the last block", extent);
            return;
        }
        let hit: Vec<Extent> = self
            .extents
            .range(..extent.end_block())
            .rev()
            .map(|(&start, &num)| Extent::new(start, num))
            .take_while(|stored| stored.end_block() > extent.start_block)
            .collect();
        for stored in hit {
            self.extents.remove(&stored.start_block);
            self.blocks -= stored.num_blocks;
            if stored.start_block < extent.start_block {
                let head = extent.start_block - stored.start_block;
                self.extents.insert(stored.start_block, head);
                self.blocks += head;
            }
            if stored.end_block() > extent.end_block() {
                let tail = stored.end_block() - extent.end_block();
                self.extents.insert(extent.end_block(), tail);
                self.blocks += tail;
            }
        }
        self.check_invariants();
    }

    pub fn add_extents(&mut self, extents: &[Extent]) {
        for extent in extents {
            self.add_extent(*extent);
        }
    }

    pub fn subtract_extents(&mut self, extents: &[Extent]) {
        for extent in extents {
            self.subtract_extent(extent);
        }
    }

    pub fn add_ranges(&mut self, ranges: &ExtentRangeSet) {
        for extent in ranges.extents() {
            self.add_extent(extent);
        }
    }

    pub fn subtract_ranges(&mut self, ranges: &ExtentRangeSet) {
        for extent in ranges.extents() {
            self.subtract_extent(&extent);
        }
    }

    pub fn contains_block(&self, block: u64) -> bool {
        self.extents
            .range(..=block)
            .next_back()
            .map_or(false, |(&start, &num)| Extent::new(start, num).contains_block(block))
    }

    /// true if any block of `extent` is in the set
    pub fn overlaps_with_extent(&self, extent: &Extent) -> bool {
        if extent.is_empty() {
            return false;
        }
        self.extents
            .range(..extent.end_block())
            .next_back()
            .map_or(false, |(&start, &num)| start.saturating_add(num) > extent.start_block)
    }

    /// Ordered extents covering exactly `count` blocks, taken from the lowest
    /// blocks of the set. The set itself is not modified.
    /// Returns None if the set holds fewer than `count` blocks.
    pub fn get_extents_for_block_count(&self, count: u64) -> Option<Vec<Extent>> {
        if count > self.blocks {
            return None;
        }
        let mut out = Vec::new();
        let mut remaining = count;
        for extent in self.extents() {
            if remaining == 0 {
                break;
            }
            let take = extent.num_blocks.min(remaining);
            out.push(Extent::new(extent.start_block, take));
            remaining -= take;
        }
        Some(out)
    }

    /// Overlap segments between `extent` and the set, clipped to `extent`, ascending.
    pub fn get_intersecting_extents(&self, extent: &Extent) -> Vec<Extent> {
        if extent.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<Extent> = self
            .extents
            .range(..extent.end_block())
            .rev()
            .map(|(&start, &num)| Extent::new(start, num))
            .take_while(|stored| stored.end_block() > extent.start_block)
            .map(|stored| get_overlap_extent(&stored, extent))
            .collect();
        out.reverse();
        out
    }

    /// Log the set at debug level
    pub fn dump(&self) {
        debug!("extent range set: {}", self);
    }

    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            let sum: u64 = self.extents.values().sum();
            debug_assert_eq!(sum, self.blocks, "block counter out of sync");
            let mut prev_end: Option<u64> = None;
            for (&start, &num) in &self.extents {
                debug_assert!(num > 0, "zero length extent stored");
                if let Some(end) = prev_end {
                    if self.merge_touching {
                        debug_assert!(start > end, "touching extents not merged");
                    } else {
                        debug_assert!(start >= end, "overlapping extents stored");
                    }
                }
                prev_end = Some(start.saturating_add(num));
            }
        }
    }
}

/// Overlap of two extents, empty extent when they do not overlap
pub fn get_overlap_extent(a: &Extent, b: &Extent) -> Extent {
    let start = a.start_block.max(b.start_block);
    let end = a.end_block().min(b.end_block());
    if start >= end {
        return Extent::new(0, 0);
    }
    Extent::new(start, end - start)
}

/// Remove every block in `ranges` from `extents`, keeping the order of what is left.
pub fn filter_extent_ranges(extents: &[Extent], ranges: &ExtentRangeSet) -> Vec<Extent> {
    let mut out = Vec::new();
    for extent in extents {
        let mut cursor = extent.start_block;
        for hole in ranges.get_intersecting_extents(extent) {
            if hole.start_block > cursor {
                out.push(Extent::new(cursor, hole.start_block - cursor));
            }
            cursor = hole.end_block();
        }
        if cursor < extent.end_block() {
            out.push(Extent::new(cursor, extent.end_block() - cursor));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn set_of(extents: &[(u64, u64)]) -> ExtentRangeSet {
        extents.iter().map(|&(s, n)| Extent::new(s, n)).collect()
    }

    fn pairs(ranges: &ExtentRangeSet) -> Vec<(u64, u64)> {
        ranges.extents().map(|e| (e.start_block, e.num_blocks)).collect()
    }

    #[test]
    fn add_merges_overlapping_and_touching() {
        let mut ranges = set_of(&[(0, 5), (10, 5)]);
        ranges.add_extent(Extent::new(5, 5));
        assert_eq!(pairs(&ranges), vec![(0, 15)]);
        assert_eq!(ranges.blocks(), 15);

        ranges.add_extent(Extent::new(20, 2));
        ranges.add_extent(Extent::new(3, 19));
        assert_eq!(pairs(&ranges), vec![(0, 22)]);
    }

    #[test]
    fn touching_extents_stay_apart_without_merge() {
        let mut ranges = ExtentRangeSet::with_merge_touching(false);
        ranges.add_extent(Extent::new(5, 5));
        ranges.add_extent(Extent::new(10, 5));
        assert_eq!(pairs(&ranges), vec![(5, 5), (10, 5)]);
        ranges.add_extent(Extent::new(8, 4));
        assert_eq!(pairs(&ranges), vec![(5, 10)]);
    }

    #[test]
    fn holes_and_empty_extents_are_ignored() {
        let mut ranges = ExtentRangeSet::new();
        ranges.add_extent(Extent::new(crate::extent::SPARSE_HOLE, 10));
        ranges.add_extent(Extent::new(4, 0));
        assert!(ranges.is_empty());
        assert_eq!(ranges.blocks(), 0);
    }

    #[test]
    fn subtract_splits_partial_overlaps() {
        let mut ranges = set_of(&[(0, 10), (20, 10)]);
        ranges.subtract_extent(&Extent::new(5, 20));
        assert_eq!(pairs(&ranges), vec![(0, 5), (25, 5)]);
        ranges.subtract_extent(&Extent::new(26, 2));
        assert_eq!(pairs(&ranges), vec![(0, 5), (25, 1), (28, 2)]);
        ranges.subtract_block(0);
        assert_eq!(pairs(&ranges), vec![(1, 4), (25, 1), (28, 2)]);
        assert_eq!(ranges.blocks(), 7);
    }

    #[test]
    fn add_then_subtract_restores_set() {
        let before = set_of(&[(0, 4), (100, 8)]);
        let mut ranges = before.clone();
        ranges.add_extent(Extent::new(40, 10));
        ranges.subtract_extent(&Extent::new(40, 10));
        assert_eq!(ranges, before);
        assert_eq!(ranges.blocks(), before.blocks());
    }

    #[test]
    fn extents_past_last_block_are_ignored() {
        let mut ranges = set_of(&[(0, 4)]);
        ranges.add_extent(Extent::new(u64::MAX - 2, 5));
        assert_eq!(pairs(&ranges), vec![(0, 4)]);
        ranges.subtract_extent(&Extent::new(2, u64::MAX));
        assert_eq!(pairs(&ranges), vec![(0, 4)]);
        ranges.add_extent(Extent::new(u64::MAX - 5, 5));
        assert_eq!(ranges.blocks(), 9);
        assert!(ranges.contains_block(u64::MAX - 1));
    }

    #[test]
    fn membership_queries() {
        let ranges = set_of(&[(10, 5), (30, 1)]);
        assert!(ranges.contains_block(10));
        assert!(ranges.contains_block(14));
        assert!(!ranges.contains_block(15));
        assert!(ranges.contains_block(30));
        assert!(!ranges.contains_block(0));

        assert!(ranges.overlaps_with_extent(&Extent::new(0, 11)));
        assert!(!ranges.overlaps_with_extent(&Extent::new(15, 15)));
        assert!(ranges.overlaps_with_extent(&Extent::new(15, 16)));
        assert!(!ranges.overlaps_with_extent(&Extent::new(12, 0)));
    }

    #[test]
    fn extents_for_block_count() {
        let ranges = set_of(&[(10, 5), (30, 10), (50, 1)]);
        assert_eq!(
            ranges.get_extents_for_block_count(8).unwrap(),
            vec![Extent::new(10, 5), Extent::new(30, 3)]
        );
        assert_eq!(ranges.get_extents_for_block_count(0).unwrap(), vec![]);
        assert_eq!(ranges.get_extents_for_block_count(16).unwrap().len(), 3);
        assert!(ranges.get_extents_for_block_count(17).is_none());
    }

    #[test]
    fn intersecting_extents_are_clipped() {
        let ranges = set_of(&[(0, 10), (20, 10), (40, 10)]);
        assert_eq!(
            ranges.get_intersecting_extents(&Extent::new(5, 20)),
            vec![Extent::new(5, 5), Extent::new(20, 5)]
        );
        assert!(ranges.get_intersecting_extents(&Extent::new(10, 10)).is_empty());
    }

    #[test]
    fn filter_keeps_order() {
        let ranges = set_of(&[(3, 2), (20, 1)]);
        let filtered = filter_extent_ranges(&[Extent::new(18, 4), Extent::new(1, 6)], &ranges);
        assert_eq!(
            filtered,
            vec![
                Extent::new(18, 2),
                Extent::new(21, 1),
                Extent::new(1, 2),
                Extent::new(5, 2)
            ]
        );
    }

    #[test]
    fn bulk_ranges() {
        let mut ranges = set_of(&[(0, 10)]);
        ranges.add_ranges(&set_of(&[(10, 2), (30, 3)]));
        assert_eq!(pairs(&ranges), vec![(0, 12), (30, 3)]);
        ranges.subtract_ranges(&set_of(&[(0, 1), (31, 1)]));
        assert_eq!(pairs(&ranges), vec![(1, 11), (30, 1), (32, 1)]);
    }

    #[test]
    fn random_mutations_keep_block_count_and_membership() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for merge_touching in [true, false] {
            let mut ranges = ExtentRangeSet::with_merge_touching(merge_touching);
            let mut model = vec![false; 512];
            for _ in 0..2000 {
                let start = rng.gen_range(0..500u64);
                let len = rng.gen_range(0..12u64).min(512 - start);
                let extent = Extent::new(start, len);
                let add = rng.gen_bool(0.6);
                if add {
                    ranges.add_extent(extent);
                } else {
                    ranges.subtract_extent(&extent);
                }
                for b in start..start + len {
                    model[b as usize] = add;
                }
                let sum: u64 = ranges.extents().map(|e| e.num_blocks).sum();
                assert_eq!(sum, ranges.blocks());
                assert_eq!(ranges.blocks(), model.iter().filter(|&&b| b).count() as u64);
            }
            for (block, &present) in model.iter().enumerate() {
                assert_eq!(ranges.contains_block(block as u64), present);
            }
        }
    }
}
