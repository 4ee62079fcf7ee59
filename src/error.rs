use thiserror::Error;

/// Errors surfaced by the gradient-synchronization layer.
///
/// None of these are recoverable from inside the crate: a failed collective
/// leaves the participant group in an undefined synchronization state, so
/// nothing here is caught and retried. Callers typically log and terminate.
#[derive(Debug, Error)]
pub enum GradsyncError {
    /// The flat vector cannot be split into equal shards. All shards must
    /// have identical size; callers pad the vector or pick a rank count
    /// that divides it evenly.
    #[error("uneven shard: {total_elements} elements cannot be split into {num_ranks} equal shards")]
    UnevenShard {
        total_elements: usize,
        num_ranks: usize,
    },

    /// Invalid topology or device configuration detected at construction
    /// or at a collective call boundary.
    #[error("configuration error: {0}")]
    Config(String),

    /// A collective backend call failed (e.g. an NCCL result code).
    #[error("collective backend error: {0}")]
    Backend(String),

    /// A cross-process coordination call (barrier, broadcast) failed.
    #[error("coordination error: {0}")]
    Coordination(String),

    /// An operation that is deliberately not built yet, as opposed to one
    /// that failed.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, GradsyncError>;
