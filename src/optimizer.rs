use log::debug;
use crate::error::PlanError;
use crate::extent::{append_blocks_to_extents, Extent};
use crate::extent_ranges::ExtentRangeSet;
use crate::manifest::{InstallOperation, OperationType};

/// Drop the parts of a SOURCE_COPY operation that copy a block onto itself.
///
/// Source and destination extents are paired by position. Wherever the
/// n-th source block equals the n-th destination block the copy is skipped;
/// the rest is returned with touching extents coalesced. An empty result
/// means the whole operation is a no-op.
pub fn optimize_source_copy(operation: &InstallOperation) -> Result<InstallOperation, PlanError> {
    if operation.op_type != OperationType::SourceCopy {
        return Err(PlanError::OptimizationNotApplicable("only SOURCE_COPY operations can be skipped"));
    }
    if operation.src_blocks() != operation.dst_blocks() {
        return Err(PlanError::OptimizationNotApplicable("source and destination lengths differ"));
    }
    if operation.src_extents.iter().chain(&operation.dst_extents).any(Extent::is_sparse_hole) {
        return Err(PlanError::OptimizationNotApplicable("sparse extents cannot be compared"));
    }
    if operation.src_extents.iter().chain(&operation.dst_extents).any(|e| e.checked_end_block().is_none()) {
        return Err(PlanError::OptimizationNotApplicable("extent runs past the last block"));
    }

    let mut optimized = InstallOperation::new(operation.op_type);
    let mut skipped = ExtentRangeSet::new();
    let (src, dst) = (&operation.src_extents, &operation.dst_extents);
    let (mut src_idx, mut dst_idx) = (0, 0);
    let (mut src_offset, mut dst_offset) = (0, 0);
    while src_idx < src.len() && dst_idx < dst.len() {
        let (s, d) = (&src[src_idx], &dst[dst_idx]);
        let run = (s.num_blocks - src_offset).min(d.num_blocks - dst_offset);
        let src_start = s.start_block + src_offset;
        let dst_start = d.start_block + dst_offset;
        if src_start == dst_start {
            skipped.add_extent(Extent::new(dst_start, run));
        } else {
            append_blocks_to_extents(&mut optimized.src_extents, src_start, run);
            append_blocks_to_extents(&mut optimized.dst_extents, dst_start, run);
        }
        src_offset += run;
        dst_offset += run;
        if src_offset == s.num_blocks {
            src_idx += 1;
            src_offset = 0;
        }
        if dst_offset == d.num_blocks {
            dst_idx += 1;
            dst_offset = 0;
        }
    }
    debug!("SOURCE_COPY: skipped {} of {} blocks", skipped.blocks(), operation.dst_blocks());
    skipped.dump();
    Ok(optimized)
}
