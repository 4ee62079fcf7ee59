//! Distributed gradient synchronization for multi-device, multi-process
//! training.
//!
//! Each device owns a disjoint, equally-sized shard of one large flat
//! parameter/gradient vector. Gradients are reduce-scattered so every
//! device ends up holding the cross-participant sum over its own shard;
//! updated parameters are all-gathered back so every device holds the full
//! vector again. Sharded optimizer state is gathered into (and scattered
//! from) one contiguous record around checkpoint boundaries.
//!
//! The collective primitives sit behind [`comm::CollectiveBackend`]:
//! [`comm::LocalBackend`] is a pure in-process fallback for a single
//! process with one or more devices, and `comm::NcclBackend` (feature
//! `nccl`) drives NCCL over CUDA devices. Multi-process rank discovery,
//! barriers and broadcasts come through [`coord::Coordinator`]; the MPI
//! implementation is behind the `distributed` feature.

pub mod comm;
pub mod communicator;
pub mod coord;
pub mod device;
pub mod error;
pub mod rank;
pub mod shard;
pub mod state;

pub use communicator::Communicator;
pub use error::{GradsyncError, Result};
