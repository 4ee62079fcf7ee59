//! Local-device-index to global-rank mapping.
//!
//! With multi-process coordination active, the participant set is
//! `(processes) x (devices per process)` and local devices occupy
//! consecutive global ranks in process order. Without a coordinator the
//! mapping is the identity over local devices.

use crate::coord::Coordinator;
use crate::error::Result;
use crate::shard;
use std::ops::Range;
use std::sync::Arc;

/// Maps local device indices to global ranks over a fixed topology.
///
/// Every cooperating process must have the same `devices_per_process`; the
/// participant set is fixed for the lifetime of the mapper.
#[derive(Clone)]
pub struct RankMapper {
    devices_per_process: usize,
    coordinator: Option<Arc<dyn Coordinator>>,
}

impl RankMapper {
    pub fn new(devices_per_process: usize, coordinator: Option<Arc<dyn Coordinator>>) -> Self {
        Self {
            devices_per_process,
            coordinator,
        }
    }

    /// Global rank of a local device index.
    pub fn global_rank(&self, local_device: usize) -> usize {
        match &self.coordinator {
            Some(c) => c.my_rank() * self.devices_per_process + local_device,
            None => local_device,
        }
    }

    /// Total number of participants across all processes.
    pub fn total_ranks(&self) -> usize {
        match &self.coordinator {
            Some(c) => c.num_processes() * self.devices_per_process,
            None => self.devices_per_process,
        }
    }

    /// Shard index range owned by a local device, over a vector of
    /// `total_elements`.
    pub fn local_shard_range(&self, local_device: usize, total_elements: usize) -> Result<Range<usize>> {
        shard::shard_range(self.global_rank(local_device), total_elements, self.total_ranks())
    }
}
