//! Per-device synchronization orchestration.
//!
//! The communicator owns the local device set, the collective backend
//! chosen at construction, and the worker pool used for the per-device
//! fan-out primitive. Every collective entry point follows the same fixed
//! pattern: synchronize device streams, issue one grouped set of async
//! launches through the backend, then block until every backend stream has
//! completed. Reordering across that boundary breaks shard correctness
//! because partially-written shard memory would be read.

use crate::comm::{CollectiveBackend, LocalBackend, ReduceOp, ShardSlice};
use crate::coord::Coordinator;
use crate::device::{DeviceContext, FlatBuffer};
use crate::error::{GradsyncError, Result};
use crate::rank::RankMapper;
use crate::shard;
use crate::state::{GatherGetFn, ScatterSetFn, StateAggregator, StateRecord};

use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;

/// Coordinates gradient reduce-scatter and parameter all-gather across a
/// fixed set of local devices, optionally spanning multiple processes.
///
/// The participant set is fixed for the communicator's lifetime. Callers
/// must not read or write a device's gradient or parameter buffer while a
/// collective involving that device is in flight.
pub struct Communicator {
    devices: Vec<Arc<dyn DeviceContext>>,
    backend: Box<dyn CollectiveBackend>,
    mapper: RankMapper,
    coordinator: Option<Arc<dyn Coordinator>>,
    state: StateAggregator,
    pool: rayon::ThreadPool,
}

impl Communicator {
    /// Construct over the local devices, selecting the collective backend:
    /// NCCL when the `nccl` feature is enabled and every device is a GPU,
    /// otherwise the in-process local fallback (which requires exactly one
    /// process).
    ///
    /// There is no partial-construction recovery: any validation or backend
    /// setup failure is returned and the communicator never exists.
    pub fn new(
        devices: Vec<Arc<dyn DeviceContext>>,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Result<Self> {
        let mapper = RankMapper::new(devices.len(), coordinator.clone());
        let backend = Self::select_backend(&devices, &mapper, &coordinator)?;
        Self::build(devices, coordinator, backend, mapper)
    }

    /// Construct with an explicitly chosen collective backend.
    pub fn with_backend(
        devices: Vec<Arc<dyn DeviceContext>>,
        coordinator: Option<Arc<dyn Coordinator>>,
        backend: Box<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let mapper = RankMapper::new(devices.len(), coordinator.clone());
        Self::build(devices, coordinator, backend, mapper)
    }

    fn build(
        devices: Vec<Arc<dyn DeviceContext>>,
        coordinator: Option<Arc<dyn Coordinator>>,
        backend: Box<dyn CollectiveBackend>,
        mapper: RankMapper,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(GradsyncError::Config(
                "communicator requires at least one device".into(),
            ));
        }
        let data_size = devices[0].grads().len();
        for device in &devices {
            if device.grads().len() != data_size || device.params().len() != data_size {
                return Err(GradsyncError::Config(format!(
                    "device {} buffers do not match the shared vector length {data_size}",
                    device.ordinal()
                )));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(devices.len())
            .build()
            .map_err(|e| GradsyncError::Config(format!("worker pool creation failed: {e}")))?;
        let state = StateAggregator::new(devices.len(), coordinator.clone());

        // Barriers bracket the log line so multi-process output groups.
        if let Some(c) = &coordinator {
            c.barrier()?;
        }
        tracing::info!(
            backend = backend.name(),
            local_devices = devices.len(),
            total_ranks = mapper.total_ranks(),
            coordinator = %coordinator.as_ref().map(|c| c.id_str()).unwrap_or_default(),
            "communicator constructed"
        );
        if let Some(c) = &coordinator {
            c.barrier()?;
        }

        Ok(Self {
            devices,
            backend,
            mapper,
            coordinator,
            state,
            pool,
        })
    }

    fn select_backend(
        devices: &[Arc<dyn DeviceContext>],
        mapper: &RankMapper,
        coordinator: &Option<Arc<dyn Coordinator>>,
    ) -> Result<Box<dyn CollectiveBackend>> {
        #[cfg(feature = "nccl")]
        {
            use crate::device::DeviceKind;
            if !devices.is_empty() && devices.iter().all(|d| d.kind() == DeviceKind::Gpu) {
                let global_ranks: Vec<usize> =
                    (0..devices.len()).map(|i| mapper.global_rank(i)).collect();
                let backend = crate::comm::NcclBackend::new(
                    devices,
                    mapper.total_ranks(),
                    &global_ranks,
                    coordinator.as_ref(),
                )?;
                return Ok(Box::new(backend));
            }
        }
        #[cfg(not(feature = "nccl"))]
        let _ = (devices, mapper);

        if coordinator.as_ref().map_or(false, |c| c.num_processes() > 1) {
            return Err(GradsyncError::Config(
                "the local collective backend supports exactly one process; \
                 multi-process topologies need a cross-device backend"
                    .into(),
            ));
        }
        Ok(Box::new(LocalBackend::new()))
    }

    pub fn num_local_devices(&self) -> usize {
        self.devices.len()
    }

    /// Total length of the flat parameter/gradient vector.
    pub fn data_size(&self) -> usize {
        self.devices[0].grads().len()
    }

    /// Set each device active and drain its compute stream.
    fn synchronize_devices(&self) -> Result<()> {
        for device in &self.devices {
            device.set_active()?;
            device.synchronize_stream()?;
        }
        Ok(())
    }

    fn local_ranges(&self, total: usize) -> Result<Vec<Range<usize>>> {
        (0..self.devices.len())
            .map(|i| self.mapper.local_shard_range(i, total))
            .collect()
    }

    /// Reduce-scatter every device's gradients and zero the positions
    /// outside each device's own shard.
    ///
    /// Afterwards each gradient buffer meaningfully holds only this
    /// device's shard (the sum across all participants of the pre-call
    /// values at those positions); everything else is zero.
    pub fn reduce_and_reset_grads(&self) -> Result<()> {
        let _span = tracing::debug_span!("reduce_and_reset_grads").entered();
        self.synchronize_devices()?;

        let total = self.data_size();
        let shard_elems = shard::shard_size(total, self.mapper.total_ranks())?;
        let ranges = self.local_ranges(total)?;

        let send: Vec<&dyn FlatBuffer> = self.devices.iter().map(|d| d.grads()).collect();
        let recv: Vec<ShardSlice<'_>> = self
            .devices
            .iter()
            .zip(&ranges)
            .map(|(d, r)| ShardSlice {
                buffer: d.grads(),
                range: r.clone(),
            })
            .collect();
        for slice in &recv {
            if slice.range.len() != shard_elems {
                return Err(GradsyncError::Config(format!(
                    "unexpected shard subrange size {} (want {shard_elems})",
                    slice.range.len()
                )));
            }
        }

        self.backend.reduce_scatter(&send, &recv, shard_elems, ReduceOp::Sum)?;
        self.backend.synchronize()?;

        // Reset everything outside the shard we reduced into.
        self.for_each_device_all(
            |i, range| {
                let grads = self.devices[i].grads();
                if range.start > 0 {
                    grads.fill(0..range.start, 0.0)?;
                }
                if range.end < total {
                    grads.fill(range.end..total, 0.0)?;
                }
                Ok(true)
            },
            true,
        )?;
        Ok(())
    }

    /// All-gather so every device's parameter buffer is fully populated
    /// from all ranks' shards.
    pub fn all_gather_params(&self) -> Result<()> {
        let _span = tracing::debug_span!("all_gather_params").entered();
        self.synchronize_devices()?;

        let total = self.data_size();
        let shard_elems = shard::shard_size(total, self.mapper.total_ranks())?;
        let ranges = self.local_ranges(total)?;

        let send: Vec<ShardSlice<'_>> = self
            .devices
            .iter()
            .zip(&ranges)
            .map(|(d, r)| ShardSlice {
                buffer: d.params(),
                range: r.clone(),
            })
            .collect();
        let recv: Vec<&dyn FlatBuffer> = self.devices.iter().map(|d| d.params()).collect();

        self.backend.all_gather(&send, &recv, shard_elems)?;
        self.backend.synchronize()
    }

    /// Run `func(device_index, shard_range)` once per local device and fold
    /// the results with `acc` in device-index order starting from `init`.
    ///
    /// With `parallel` and more than one device the per-device tasks run on
    /// the communicator's worker pool (one slot per device); otherwise they
    /// run sequentially on the calling thread. Every task has completed
    /// when this returns. This is the only supported way to issue
    /// per-device parallel work through the communicator.
    pub fn for_each_device<R, F, A>(&self, func: F, mut acc: A, init: R, parallel: bool) -> Result<R>
    where
        R: Send,
        F: Fn(usize, Range<usize>) -> Result<R> + Send + Sync,
        A: FnMut(&mut R, R),
    {
        let total = self.data_size();
        let ranges = self.local_ranges(total)?;
        let parallel = parallel && self.devices.len() > 1;

        let mut folded = init;
        if parallel {
            let results: Vec<Result<R>> = self.pool.install(|| {
                ranges
                    .par_iter()
                    .enumerate()
                    .map(|(i, range)| func(i, range.clone()))
                    .collect()
            });
            for result in results {
                acc(&mut folded, result?);
            }
        } else {
            for (i, range) in ranges.iter().enumerate() {
                acc(&mut folded, func(i, range.clone())?);
            }
        }
        Ok(folded)
    }

    /// Boolean all-true fold over [`Communicator::for_each_device`].
    pub fn for_each_device_all<F>(&self, func: F, parallel: bool) -> Result<bool>
    where
        F: Fn(usize, Range<usize>) -> Result<bool> + Send + Sync,
    {
        self.for_each_device(func, |all, one| *all = *all && one, true, parallel)
    }

    /// Swap distributed parameter shards with the full parameter vector.
    ///
    /// Deliberately not built; the semantics are unspecified. Fails loudly
    /// so a caller cannot mistake it for a no-op.
    pub fn swap_sharded_params(&self, _shards: &[&dyn FlatBuffer]) -> Result<()> {
        Err(GradsyncError::Unimplemented("swap_sharded_params"))
    }

    /// Slice a full state record into per-device byte shards.
    /// See [`StateAggregator::scatter`].
    pub fn scatter_state(&self, data: &StateRecord, set_fn: &ScatterSetFn<'_>) -> Result<()> {
        self.state.scatter(data, set_fn)
    }

    /// Collect per-device state shards into one record, identical on every
    /// process. See [`StateAggregator::gather`].
    pub fn gather_state(&self, get_fn: &GatherGetFn<'_>) -> Result<StateRecord> {
        self.state.gather(get_fn)
    }

    /// Block until all participants reach this point.
    pub fn barrier(&self) -> Result<()> {
        self.backend.barrier()?;
        if let Some(c) = &self.coordinator {
            c.barrier()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    struct FixedCoordinator {
        rank: usize,
        procs: usize,
    }

    impl Coordinator for FixedCoordinator {
        fn my_rank(&self) -> usize {
            self.rank
        }
        fn num_processes(&self) -> usize {
            self.procs
        }
        fn barrier(&self) -> Result<()> {
            Ok(())
        }
        fn broadcast_bytes(&self, _data: &mut Vec<u8>, _root: usize) -> Result<()> {
            Ok(())
        }
        fn id_str(&self) -> String {
            format!("fixed[{}/{}]", self.rank, self.procs)
        }
    }

    fn host_devices(n: usize, len: usize) -> Vec<Arc<dyn DeviceContext>> {
        (0..n)
            .map(|i| Arc::new(HostDevice::new(i, len)) as Arc<dyn DeviceContext>)
            .collect()
    }

    #[test]
    fn empty_device_set_is_rejected() {
        assert!(Communicator::new(Vec::new(), None).is_err());
    }

    #[test]
    fn mismatched_buffer_lengths_are_rejected() {
        let devices: Vec<Arc<dyn DeviceContext>> = vec![
            Arc::new(HostDevice::new(0, 8)),
            Arc::new(HostDevice::new(1, 16)),
        ];
        assert!(Communicator::new(devices, None).is_err());
    }

    #[cfg(not(feature = "nccl"))]
    #[test]
    fn local_backend_refuses_multiple_processes() {
        let coordinator = Arc::new(FixedCoordinator { rank: 0, procs: 2 });
        let err = Communicator::new(host_devices(2, 8), Some(coordinator))
            .err()
            .unwrap();
        assert!(matches!(err, GradsyncError::Config(_)));
    }

    #[test]
    fn single_process_coordinator_uses_local_backend() {
        let coordinator = Arc::new(FixedCoordinator { rank: 0, procs: 1 });
        let comm = Communicator::new(host_devices(2, 8), Some(coordinator)).unwrap();
        assert_eq!(comm.num_local_devices(), 2);
        assert_eq!(comm.data_size(), 8);
        comm.barrier().unwrap();
    }

    #[test]
    fn swap_sharded_params_fails_loudly() {
        let comm = Communicator::new(host_devices(2, 8), None).unwrap();
        let err = comm.swap_sharded_params(&[]).unwrap_err();
        assert!(matches!(err, GradsyncError::Unimplemented(_)));
    }
}
