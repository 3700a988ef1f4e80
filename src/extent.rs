use std::cmp::Ordering;
use std::fmt;
use serde::{Deserialize, Serialize};

/// Start block reserved for sparse holes, never stored as a real range
pub const SPARSE_HOLE: u64 = u64::MAX;

/// A half-open run of blocks `[start_block, start_block + num_blocks)`
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl Extent {
    pub fn new(start_block: u64, num_blocks: u64) -> Self {
        Extent { start_block, num_blocks }
    }
    /// first block past the extent, saturating at u64::MAX
    pub fn end_block(&self) -> u64 {
        self.start_block.saturating_add(self.num_blocks)
    }
    /// None when the extent runs past the last addressable block
    pub fn checked_end_block(&self) -> Option<u64> {
        self.start_block.checked_add(self.num_blocks)
    }
    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }
    pub fn is_sparse_hole(&self) -> bool {
        self.start_block == SPARSE_HOLE
    }
    pub fn contains_block(&self, block: u64) -> bool {
        block >= self.start_block && block < self.end_block()
    }
}

impl Ord for Extent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_block
            .cmp(&other.start_block)
            .then(self.num_blocks.cmp(&other.num_blocks))
    }
}
impl PartialOrd for Extent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Extent {
    fn eq(&self, other: &Self) -> bool {
        self.start_block == other.start_block && self.num_blocks == other.num_blocks
    }
}

impl Eq for Extent {}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.num_blocks == 1 {
            write!(f, "[{}]", self.start_block)
        } else {
            write!(f, "[{}-{}]", self.start_block, self.end_block().saturating_sub(1))
        }
    }
}

pub fn extent_for_range(start_block: u64, num_blocks: u64) -> Extent {
    Extent::new(start_block, num_blocks)
}

/// Extent covering `[start_bytes, start_bytes + size_bytes)`, rounded outwards to whole blocks
pub fn extent_for_bytes(block_size: u64, start_bytes: u64, size_bytes: u64) -> Extent {
    let start_block = start_bytes / block_size;
    let end_block = div_round_up(start_bytes.saturating_add(size_bytes), block_size);
    Extent::new(start_block, end_block - start_block)
}

/// true if the two extents share at least one block
pub fn extents_overlap(a: &Extent, b: &Extent) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.start_block < b.end_block() && b.start_block < a.end_block()
}

/// true if the two extents share a block or one ends where the other starts
pub fn extents_overlap_or_touch(a: &Extent, b: &Extent) -> bool {
    a.start_block <= b.end_block() && b.start_block <= a.end_block()
}

/// Sum of the block counts
pub fn total_blocks(extents: &[Extent]) -> u64 {
    extents.iter().fold(0, |sum, e| sum.saturating_add(e.num_blocks))
}

/// Append `num_blocks` blocks starting at `start_block`, growing the last extent when contiguous
pub fn append_blocks_to_extents(extents: &mut Vec<Extent>, start_block: u64, num_blocks: u64) {
    if num_blocks == 0 {
        return;
    }
    if let Some(last) = extents.last_mut() {
        if last.end_block() == start_block {
            last.num_blocks += num_blocks;
            return;
        }
    }
    extents.push(Extent::new(start_block, num_blocks));
}

pub fn div_round_up(value: u64, unit: u64) -> u64 {
    value / unit + u64::from(value % unit != 0)
}

/// round `value` up to the next multiple of `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    div_round_up(value, alignment) * alignment
}

///Takes a size and converts this to a size in IEEE-1541-2002 units (KiB, MiB, GiB, TiB, PiB, or EiB),precision 1
pub fn bytes2ieee(size: u64) -> String {
    let units = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut size = size as f64;
    let mut i = 0;
    while size >= 1024.0 && i < units.len() - 1 {
        size /= 1024.0;
        i += 1;
    }
    format!("{:.1}{}", size, units[i])
}
