//! Shard sizing and index-range math.
//!
//! A shard is a contiguous half-open range of the logical flat vector,
//! assigned one-to-one to a global rank. All shards must have identical
//! size; an unequal final shard is unsupported and raises
//! [`GradsyncError::UnevenShard`] rather than silently truncating.

use crate::error::{GradsyncError, Result};
use std::ops::Range;

/// Size of every shard when `total_elements` is split across `num_ranks`.
///
/// Computed as `ceil(total / ranks)`. Fails when the total is not evenly
/// divisible: callers must pad the vector or choose the rank count
/// accordingly.
pub fn shard_size(total_elements: usize, num_ranks: usize) -> Result<usize> {
    if num_ranks == 0 {
        return Err(GradsyncError::Config("shard_size: num_ranks is zero".into()));
    }
    let size = total_elements.div_ceil(num_ranks);
    if size * num_ranks != total_elements {
        return Err(GradsyncError::UnevenShard {
            total_elements,
            num_ranks,
        });
    }
    Ok(size)
}

/// Index range `[begin, end)` of `rank`'s shard.
///
/// `begin = rank * size`, `end = min(begin + size, total_elements)`. The
/// clip never fires today because [`shard_size`] enforces uniform shards,
/// but the contract keeps the theoretical last shard well-defined.
pub fn shard_range(rank: usize, total_elements: usize, num_ranks: usize) -> Result<Range<usize>> {
    let size = shard_size(total_elements, num_ranks)?;
    let begin = rank * size;
    let end = (begin + size).min(total_elements);
    Ok(begin..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_tile_the_vector_exactly() {
        for &(total, ranks) in &[(4096usize, 4usize), (12, 3), (8, 1), (100, 10)] {
            let size = shard_size(total, ranks).unwrap();
            assert_eq!(size * ranks, total);

            let mut next = 0;
            for rank in 0..ranks {
                let r = shard_range(rank, total, ranks).unwrap();
                assert_eq!(r.start, next, "gap or overlap before rank {rank}");
                assert_eq!(r.len(), size);
                next = r.end;
            }
            assert_eq!(next, total);
        }
    }

    #[test]
    fn uneven_total_is_an_error() {
        let err = shard_size(10, 3).unwrap_err();
        match err {
            GradsyncError::UnevenShard {
                total_elements,
                num_ranks,
            } => {
                assert_eq!(total_elements, 10);
                assert_eq!(num_ranks, 3);
            }
            other => panic!("expected UnevenShard, got {other}"),
        }
        assert!(shard_range(1, 10, 3).is_err());
    }

    #[test]
    fn zero_ranks_is_a_config_error() {
        assert!(matches!(shard_size(8, 0), Err(GradsyncError::Config(_))));
    }

    #[test]
    fn shard_range_values() {
        assert_eq!(shard_range(0, 4096, 4).unwrap(), 0..1024);
        assert_eq!(shard_range(3, 4096, 4).unwrap(), 3072..4096);
    }
}
