//! Cross-process coordination interface.
//!
//! Rank discovery, barriers and broadcasts are consumed through the small
//! [`Coordinator`] trait; the multi-process wrapper itself (MPI launch,
//! universe lifetime) lives outside this crate. When no coordinator is
//! present, everything degrades to a single-process identity mapping with
//! no collaborator calls.

use crate::error::Result;

/// Capability set of the multi-process coordination collaborator.
///
/// `barrier` and `broadcast_bytes` are synchronous: they block the calling
/// thread until every process reaches the corresponding call. A missing or
/// hung process therefore hangs the group; there is no timeout.
pub trait Coordinator: Send + Sync {
    /// This process's rank within the process group.
    fn my_rank(&self) -> usize;

    /// Total number of cooperating processes.
    fn num_processes(&self) -> usize;

    /// Block until all processes reach the barrier.
    fn barrier(&self) -> Result<()>;

    /// Broadcast `data` from `root` to every process.
    ///
    /// On non-root processes `data` is resized to the root's payload length
    /// before being filled, so receivers need not know the size up front.
    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> Result<()>;

    /// Short identity string for log attribution (e.g. "mpi[1/3]").
    fn id_str(&self) -> String;
}

#[cfg(feature = "distributed")]
pub use self::mpi_impl::MpiCoordinator;

#[cfg(feature = "distributed")]
mod mpi_impl {
    use super::Coordinator;
    use crate::error::{GradsyncError, Result};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI-backed process coordinator over the world communicator.
    ///
    /// The caller must initialize MPI (`mpi::initialize()`) before
    /// constructing this and must keep the universe alive for as long as
    /// the coordinator is used.
    pub struct MpiCoordinator;

    impl MpiCoordinator {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for MpiCoordinator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Coordinator for MpiCoordinator {
        fn my_rank(&self) -> usize {
            SimpleCommunicator::world().rank() as usize
        }

        fn num_processes(&self) -> usize {
            SimpleCommunicator::world().size() as usize
        }

        fn barrier(&self) -> Result<()> {
            SimpleCommunicator::world().barrier();
            Ok(())
        }

        fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> Result<()> {
            let world = SimpleCommunicator::world();
            if root >= world.size() as usize {
                return Err(GradsyncError::Coordination(format!(
                    "broadcast root {root} out of range for {} processes",
                    world.size()
                )));
            }
            let root_proc = world.process_at_rank(root as i32);

            // Length travels first so receivers can size their buffer.
            let mut len = data.len() as u64;
            root_proc.broadcast_into(&mut len);
            if world.rank() as usize != root {
                data.resize(len as usize, 0);
            }
            if len > 0 {
                root_proc.broadcast_into(&mut data[..]);
            }
            Ok(())
        }

        fn id_str(&self) -> String {
            let world = SimpleCommunicator::world();
            format!("mpi[{}/{}]", world.rank(), world.size())
        }
    }
}
