//! Error types for sweep sessions and the block catalog.

use std::io;

use thiserror::Error;

use crate::sweep::SweepPhase;

/// Errors reported by the collector and its sweep session.
///
/// Every variant except [`SweepError::BlockAllocation`] and
/// [`SweepError::ObjectTooLarge`] describes a misuse of the collection
/// cycle protocol rather than a runtime condition.
#[derive(Error, Debug)]
pub enum SweepError {
    /// `begin_sweep` was called while a session is attached.
    #[error("a sweep session is already attached to this collector")]
    SessionActive,

    /// A session operation was called with no attached session.
    #[error("no sweep session is attached to this collector")]
    NoActiveSession,

    /// A session operation was called out of order.
    #[error("invalid sweep phase transition from {from:?} to {to:?}")]
    InvalidPhase {
        /// Phase the session was in.
        from: SweepPhase,
        /// Phase the call tried to enter.
        to: SweepPhase,
    },

    /// Sweep was started while finalized objects were still being disposed.
    #[error("cannot flush disposed objects while dispose is in progress")]
    DisposeInProgress,

    /// The operation needs the heap, which is currently owned by the background sweeper.
    #[error("the heap is owned by the background sweeper")]
    BackgroundSweepActive,

    /// No size class can hold an object of this size.
    #[error("object size {0} exceeds the largest medium size class")]
    ObjectTooLarge(usize),

    /// Mapping pages for a new heap block failed.
    #[error("failed to map heap block pages: {0}")]
    BlockAllocation(#[from] io::Error),

    /// The background sweeper thread could not be started.
    #[error("failed to spawn the background sweeper thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    /// The background sweeper thread exited without returning the heap.
    #[error("background sweeper thread terminated unexpectedly")]
    BackgroundWorkerLost,

    /// The heap was lost with the background sweeper. Only
    /// [`Collector::shutdown`](crate::Collector::shutdown) recovers.
    #[error("the heap was lost with the background sweeper; shut the collector down")]
    HeapLost,
}

/// Result alias for sweep operations.
pub type Result<T> = std::result::Result<T, SweepError>;
