//! Sweep session, partial-collect heuristic and background sweeper.

mod background;
pub mod partial;
mod session;

pub use background::BackgroundSweeper;
pub(crate) use background::SweepJob;
pub use partial::{PartialCollectState, PartialRejection};
pub use session::{PartialDecision, SweepSession};

/// Lifecycle of a sweep session.
///
/// ```text
/// Idle → Began → ExecutingForeground ⇄ … → Finished → Ended
///              ↘ ExecutingBackground ↗
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepPhase {
    Idle,
    Began,
    ExecutingForeground,
    ExecutingBackground,
    Finished,
    Ended,
}

impl SweepPhase {
    /// Check whether `self → to` is allowed.
    #[must_use]
    pub const fn is_valid_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Began)
                | (
                    Self::Began | Self::ExecutingForeground,
                    Self::ExecutingForeground | Self::ExecutingBackground
                )
                | (
                    Self::ExecutingForeground | Self::ExecutingBackground,
                    Self::Finished
                )
                | (Self::Finished, Self::Ended)
        )
    }

    /// Whether the session has swept and may no longer be driven.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished | Self::Ended)
    }
}
