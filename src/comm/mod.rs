//! Collective communication backend abstraction.
//!
//! Provides a trait over reduce-scatter / all-gather / barrier primitives
//! across a fixed participant set, with two implementations:
//! [`LocalBackend`] (pure in-process fallback, single process only) and
//! `NcclBackend` (NCCL over CUDA devices, behind the `nccl` feature).

pub mod local;
#[cfg(feature = "nccl")]
pub mod nccl;

pub use local::LocalBackend;
#[cfg(feature = "nccl")]
pub use nccl::{CudaBuffer, CudaDeviceContext, NcclBackend};

use crate::device::FlatBuffer;
use crate::error::Result;
use std::ops::Range;

/// Reduction applied by [`CollectiveBackend::reduce_scatter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
}

/// A contiguous view into a device buffer: one participant's shard.
pub struct ShardSlice<'a> {
    pub buffer: &'a dyn FlatBuffer,
    pub range: Range<usize>,
}

/// Collective primitives over the fixed participant set.
///
/// Both variants satisfy the same contract. Calls take the buffers of every
/// local device at once so the implementation can batch the per-device
/// launches inside one grouped operation boundary; devices sharing a
/// process must never block on each other outside a group. No participant
/// may proceed past a collective until all participants reach it: an absent
/// or hung participant hangs the whole group, with no timeout.
pub trait CollectiveBackend: Send + Sync {
    /// Sum every device's full send buffer across the entire participant
    /// set, writing each participant's assigned shard into its recv slice.
    ///
    /// `send[i]` and `recv[i]` belong to local device `i`; every recv range
    /// must have exactly `shard_elems` elements. Launches may be
    /// asynchronous; call [`CollectiveBackend::synchronize`] before reading
    /// the results.
    fn reduce_scatter(
        &self,
        send: &[&dyn FlatBuffer],
        recv: &[ShardSlice<'_>],
        shard_elems: usize,
        op: ReduceOp,
    ) -> Result<()>;

    /// Inverse of reduce-scatter: each participant's shard slice is
    /// broadcast to fill the corresponding region of every participant's
    /// recv buffer.
    fn all_gather(
        &self,
        send: &[ShardSlice<'_>],
        recv: &[&dyn FlatBuffer],
        shard_elems: usize,
    ) -> Result<()>;

    /// Block until every stream issued by this backend has completed.
    fn synchronize(&self) -> Result<()>;

    /// Block until all participants reach the barrier.
    fn barrier(&self) -> Result<()>;

    /// Backend name for log attribution.
    fn name(&self) -> &'static str;
}
