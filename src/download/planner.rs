//! Block planner: partitions a resource into byte-range work units.

use tracing::debug;

use super::error::EngineError;

/// Lifecycle state of a block within one multi-block run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Waiting for a worker.
    Pending,
    /// Owned by a worker, request in flight.
    Fetching,
    /// All bytes written at the block's offset.
    Done,
    /// Retry budget exhausted (terminal).
    Failed,
}

/// A contiguous byte range fetched and written as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Position in write order; says nothing about execution order.
    pub index: usize,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range, inclusive.
    pub end: u64,
    /// Current state.
    pub state: BlockState,
    /// Attempts made so far.
    pub attempts: u32,
}

impl Block {
    /// Number of bytes covered by the block.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Blocks always cover at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value of the `Range` request header for this block.
    #[must_use]
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Splits `[0, total_size - 1]` into ordered, gapless, non-overlapping blocks.
///
/// The block count is `ceil(total_size / block_size)`; the last block is
/// truncated to end at `total_size - 1`.
///
/// # Errors
///
/// Returns [`EngineError::Planning`] when `total_size` or `block_size` is zero.
/// Zero-length resources never reach the planner.
///
/// ```
/// use funget::download::plan_blocks;
///
/// let blocks = plan_blocks(1000, 1024 * 1024).unwrap();
/// assert_eq!(blocks.len(), 1);
/// assert_eq!((blocks[0].start, blocks[0].end), (0, 999));
/// ```
pub fn plan_blocks(total_size: u64, block_size: u64) -> Result<Vec<Block>, EngineError> {
    if total_size == 0 || block_size == 0 {
        return Err(EngineError::Planning {
            total_size,
            block_size,
        });
    }

    let count = total_size.div_ceil(block_size).max(1);
    let blocks: Vec<Block> = (0..count)
        .map(|i| {
            let start = i * block_size;
            let end = start.saturating_add(block_size - 1).min(total_size - 1);
            Block {
                // Block counts are bounded by available memory long before usize.
                index: usize::try_from(i).unwrap_or(usize::MAX),
                start,
                end,
                state: BlockState::Pending,
                attempts: 0,
            }
        })
        .collect();

    debug!(total_size, block_size, blocks = blocks.len(), "planned blocks");
    Ok(blocks)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn assert_perfect_cover(blocks: &[Block], total: u64) {
        assert_eq!(blocks.first().unwrap().start, 0);
        assert_eq!(blocks.last().unwrap().end, total - 1);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start, "gap or overlap");
        }
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.index, i);
            assert!(block.start <= block.end);
            assert_eq!(block.state, BlockState::Pending);
        }
        assert_eq!(blocks.iter().map(Block::len).sum::<u64>(), total);
    }

    #[test]
    fn test_plan_covers_range_for_many_sizes() {
        for total in [1, 2, 7, 999, 1000, 1024, 4095, 4096, 4097, 1_000_003] {
            for block in [1, 3, 512, 1000, 1024, 4096, 10_000_000] {
                if total / block > 100_000 {
                    continue;
                }
                let blocks = plan_blocks(total, block).unwrap();
                assert_eq!(blocks.len() as u64, total.div_ceil(block));
                assert_perfect_cover(&blocks, total);
            }
        }
    }

    #[test]
    fn test_plan_ten_megabytes_in_one_megabyte_blocks() {
        let blocks = plan_blocks(10_485_760, 1_048_576).unwrap();
        assert_eq!(blocks.len(), 10);
        assert!(blocks.iter().all(|b| b.len() == 1_048_576));
        assert_perfect_cover(&blocks, 10_485_760);
    }

    #[test]
    fn test_small_resource_degenerates_to_single_block() {
        let blocks = plan_blocks(1000, 1_048_576).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!((blocks[0].start, blocks[0].end), (0, 999));
        assert_eq!(blocks[0].range_header(), "bytes=0-999");
    }

    #[test]
    fn test_last_block_does_not_overshoot() {
        let blocks = plan_blocks(2500, 1000).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!((blocks[2].start, blocks[2].end), (2000, 2499));
        assert_eq!(blocks[2].len(), 500);
    }

    #[test]
    fn test_zero_sizes_are_planning_errors() {
        assert!(matches!(
            plan_blocks(0, 1024),
            Err(EngineError::Planning { total_size: 0, .. })
        ));
        assert!(matches!(
            plan_blocks(1024, 0),
            Err(EngineError::Planning { block_size: 0, .. })
        ));
    }
}
