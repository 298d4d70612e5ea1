//! Sweep tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for sweep sessions. Without it the same functions
//! exist as no-ops so call sites need no `cfg`.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tracing::{span, Level};

    use crate::sweep::{PartialRejection, SweepPhase};

    /// Identifier correlating every event of one sweep session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SweepId(pub u64);

    static NEXT_SWEEP_ID: AtomicU64 = AtomicU64::new(1);

    pub fn next_sweep_id() -> SweepId {
        SweepId(NEXT_SWEEP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection cycle.
    pub fn trace_collection(kind: &str) -> span::EnteredSpan {
        span!(Level::DEBUG, "sweep_collect", kind = kind).entered()
    }

    pub fn log_phase_transition(id: SweepId, from: SweepPhase, to: SweepPhase) {
        tracing::debug!(sweep_id = id.0, from = ?from, to = ?to, "phase_transition");
    }

    pub fn log_partial_mode(id: SweepId, entered: bool, rescan_root_bytes: usize) {
        tracing::debug!(
            sweep_id = id.0,
            entered,
            rescan_root_bytes,
            "partial_mode"
        );
    }

    pub fn log_partial_approved(id: SweepId, efficacy: f64, new_page_count: usize) {
        tracing::debug!(
            sweep_id = id.0,
            efficacy,
            new_page_count,
            "partial_approved"
        );
    }

    pub fn log_partial_rejected(id: SweepId, reason: &PartialRejection) {
        tracing::debug!(sweep_id = id.0, reason = reason.as_str(), detail = %reason, "partial_rejected");
    }

    pub fn log_write_watch_failure(id: SweepId, error: &std::io::Error) {
        tracing::warn!(sweep_id = id.0, %error, "write_watch_reset_failed");
    }

    pub fn log_background_handoff(id: SweepId, to_worker: bool) {
        tracing::debug!(sweep_id = id.0, to_worker, "background_handoff");
    }

    pub fn log_sweep_end(id: SweepId, bytes_freed: usize, blocks_swept: usize) {
        tracing::debug!(sweep_id = id.0, bytes_freed, blocks_swept, "sweep_end");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use crate::sweep::{PartialRejection, SweepPhase};

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SweepId(pub u64);

    pub fn next_sweep_id() -> SweepId {
        SweepId(0)
    }

    #[inline]
    pub fn log_phase_transition(_id: SweepId, _from: SweepPhase, _to: SweepPhase) {}

    #[inline]
    pub fn log_partial_mode(_id: SweepId, _entered: bool, _rescan_root_bytes: usize) {}

    #[inline]
    pub fn log_partial_approved(_id: SweepId, _efficacy: f64, _new_page_count: usize) {}

    #[inline]
    pub fn log_partial_rejected(_id: SweepId, _reason: &PartialRejection) {}

    #[inline]
    pub fn log_write_watch_failure(_id: SweepId, _error: &std::io::Error) {}

    #[inline]
    pub fn log_background_handoff(_id: SweepId, _to_worker: bool) {}

    #[inline]
    pub fn log_sweep_end(_id: SweepId, _bytes_freed: usize, _blocks_swept: usize) {}
}

pub use internal::SweepId;
