use crate::tensor::{Result, TensorError};
use std::ops::Range;

/// Checks that `denominator` divides `numerator` and returns the quotient.
pub fn divide(numerator: usize, denominator: usize) -> Result<usize> {
    if denominator == 0 || numerator % denominator != 0 {
        return Err(TensorError::InvalidConfig(format!(
            "{numerator} is not divisible by {denominator}"
        )));
    }
    Ok(numerator / denominator)
}

/// Rounds `vocab_size` up so that it splits evenly into `world_size` shards whose sizes are
/// multiples of `multiple`.
pub fn pad_vocab_size(vocab_size: usize, world_size: usize, multiple: usize) -> usize {
    let step = multiple.max(1) * world_size.max(1);
    vocab_size.div_ceil(step) * step
}

/// Splits a vocabulary into contiguous per-rank ranges.
pub struct VocabUtility;

impl VocabUtility {
    pub fn vocab_range_from_per_partition_vocab_size(
        per_partition_vocab_size: usize,
        rank: usize,
    ) -> Range<usize> {
        let first = rank * per_partition_vocab_size;
        first..first + per_partition_vocab_size
    }

    /// The ids `[rank * per, (rank + 1) * per)` owned by `rank`.
    pub fn vocab_range_from_global_vocab_size(
        global_vocab_size: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<Range<usize>> {
        let per = divide(global_vocab_size, world_size)?;
        Ok(Self::vocab_range_from_per_partition_vocab_size(per, rank))
    }
}
