//! Pure in-process collective fallback.
//!
//! Implements the collective contract by a direct parallel map-reduce
//! across local devices, staged through host memory. Valid only when
//! exactly one process participates; the communicator enforces that before
//! selecting this backend. All work is synchronous, so `synchronize` and
//! `barrier` are no-ops.

use super::{CollectiveBackend, ReduceOp, ShardSlice};
use crate::device::FlatBuffer;
use crate::error::{GradsyncError, Result};
use rayon::prelude::*;

pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_shard_len(range_len: usize, shard_elems: usize) -> Result<()> {
    if range_len != shard_elems {
        return Err(GradsyncError::Config(format!(
            "shard slice of {range_len} elements does not match shard size {shard_elems}"
        )));
    }
    Ok(())
}

impl CollectiveBackend for LocalBackend {
    fn reduce_scatter(
        &self,
        send: &[&dyn FlatBuffer],
        recv: &[ShardSlice<'_>],
        shard_elems: usize,
        op: ReduceOp,
    ) -> Result<()> {
        let ReduceOp::Sum = op;
        if send.len() != recv.len() {
            return Err(GradsyncError::Config(format!(
                "reduce_scatter: {} send buffers but {} recv slices",
                send.len(),
                recv.len()
            )));
        }

        // Each device sums its own shard range over every send buffer.
        // Ranges are disjoint across devices, so the writes never overlap.
        recv.par_iter().try_for_each(|slice| -> Result<()> {
            check_shard_len(slice.range.len(), shard_elems)?;
            let mut acc = vec![0.0f32; shard_elems];
            let mut tmp = vec![0.0f32; shard_elems];
            for buf in send {
                buf.copy_to_host(slice.range.clone(), &mut tmp)?;
                for (a, t) in acc.iter_mut().zip(&tmp) {
                    *a += t;
                }
            }
            slice.buffer.copy_from_host(slice.range.clone(), &acc)
        })
    }

    fn all_gather(
        &self,
        send: &[ShardSlice<'_>],
        recv: &[&dyn FlatBuffer],
        shard_elems: usize,
    ) -> Result<()> {
        if send.len() != recv.len() {
            return Err(GradsyncError::Config(format!(
                "all_gather: {} send slices but {} recv buffers",
                send.len(),
                recv.len()
            )));
        }
        for slice in send {
            check_shard_len(slice.range.len(), shard_elems)?;
        }

        // Stage every rank's shard once, then fan the copies out per device.
        let mut shards: Vec<Vec<f32>> = Vec::with_capacity(send.len());
        for slice in send {
            let mut data = vec![0.0f32; shard_elems];
            slice.buffer.copy_to_host(slice.range.clone(), &mut data)?;
            shards.push(data);
        }

        recv.par_iter().try_for_each(|buf| -> Result<()> {
            for (slice, data) in send.iter().zip(&shards) {
                buf.copy_from_host(slice.range.clone(), data)?;
            }
            Ok(())
        })
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostBuffer;

    #[test]
    fn reduce_scatter_sums_into_disjoint_shards() {
        // Two devices, 4 elements, shard size 2. Device values: all 1.0 and
        // all 2.0; every shard position should end up holding 3.0.
        let a = HostBuffer::from_vec(vec![1.0; 4]);
        let b = HostBuffer::from_vec(vec![2.0; 4]);
        let backend = LocalBackend::new();

        let send: Vec<&dyn crate::device::FlatBuffer> = vec![&a, &b];
        let recv = vec![
            ShardSlice { buffer: &a, range: 0..2 },
            ShardSlice { buffer: &b, range: 2..4 },
        ];
        backend.reduce_scatter(&send, &recv, 2, ReduceOp::Sum).unwrap();

        assert_eq!(a.snapshot()[0..2], [3.0, 3.0]);
        assert_eq!(b.snapshot()[2..4], [3.0, 3.0]);
    }

    #[test]
    fn all_gather_replicates_every_shard() {
        let a = HostBuffer::from_vec(vec![1.0, 1.0, 9.0, 9.0]);
        let b = HostBuffer::from_vec(vec![9.0, 9.0, 2.0, 2.0]);
        let backend = LocalBackend::new();

        let send = vec![
            ShardSlice { buffer: &a, range: 0..2 },
            ShardSlice { buffer: &b, range: 2..4 },
        ];
        let recv: Vec<&dyn crate::device::FlatBuffer> = vec![&a, &b];
        backend.all_gather(&send, &recv, 2).unwrap();

        assert_eq!(a.snapshot(), vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(b.snapshot(), vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn mismatched_shard_size_is_rejected() {
        let a = HostBuffer::zeros(4);
        let backend = LocalBackend::new();
        let send: Vec<&dyn crate::device::FlatBuffer> = vec![&a];
        let recv = vec![ShardSlice { buffer: &a, range: 0..2 }];
        assert!(backend.reduce_scatter(&send, &recv, 3, ReduceOp::Sum).is_err());
    }
}
