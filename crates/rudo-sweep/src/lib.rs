//! Sweep engine for a generational, partially concurrent mark-sweep
//! collector.
//!
//! `rudo-sweep` owns a heap of fixed-size blocks split into buckets by
//! object kind, size tier and size class, and sweeps them after an
//! external mark phase. Each cycle runs through a [`SweepSession`] that
//! moves blocks between the catalog and its own pending lists, optionally
//! on a background thread, and keeps the byte accounting that drives the
//! **partial-collect** heuristic: whether the next cycles may skip full
//! collection and reuse only the pages that are worth it.
//!
//! # Features
//!
//! - **Phase-checked sessions**: `begin → sweep → finish → end`, misuse is
//!   reported as [`SweepError`]
//! - **Background sweeping**: the catalog is handed to a worker thread and
//!   back, the mutator keeps allocating into fresh blocks
//! - **Partial collection**: efficacy, rescan cost and allocation pressure
//!   decide per cycle (see [`partial`])
//! - **Finalization**: dead finalizable objects wait for dispose before
//!   their slots are reused
//!
//! # Quick Start
//!
//! ```
//! use rudo_sweep::{CollectOptions, Collector, ObjectKind, SweepConfig};
//!
//! let mut collector = Collector::new(SweepConfig::default());
//! let root = collector.alloc(ObjectKind::Normal, 48).unwrap();
//! for _ in 0..100 {
//!     collector.alloc(ObjectKind::Leaf, 32).unwrap();
//! }
//!
//! let metrics = collector
//!     .collect_with(CollectOptions::full(), |c| c.mark(root))
//!     .unwrap();
//! assert_eq!(metrics.bytes_freed, 100 * 32);
//! ```
//!
//! # Driving a cycle step by step
//!
//! ```
//! use rudo_sweep::{CollectionKind, Collector, ObjectKind, SweepConfig};
//!
//! let mut collector = Collector::new(SweepConfig::default());
//! let obj = collector.alloc(ObjectKind::Normal, 64).unwrap();
//!
//! collector.prepare_collection(CollectionKind::Full).unwrap();
//! collector.mark(obj);
//! collector.begin_sweep(1024 * 1024, true).unwrap();
//! collector.start_background_sweep().unwrap();
//! // The mutator may allocate here; it gets fresh blocks.
//! let _new = collector.alloc(ObjectKind::Normal, 64).unwrap();
//! collector.wait_for_background_sweep().unwrap();
//! let metrics = collector.end_sweep().unwrap();
//! assert!(metrics.partial);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod collector;
pub mod config;
pub mod error;
mod metrics;
pub mod sweep;
mod tracing;

/// Block heap internals.
///
/// This module is public for testing and advanced use cases.
/// Most users should go through [`Collector`].
pub mod heap;

pub use collector::{CollectOptions, CollectionKind, Collector, ShutdownReport};
pub use config::{PartialCollectConfig, SweepConfig};
pub use error::{Result, SweepError};
pub use heap::{ObjectKind, ObjectRef};
pub use metrics::{global_metrics, GlobalMetrics, PhaseTimer, SweepHistory, SweepMetrics};
pub use sweep::{partial, PartialDecision, SweepPhase, SweepSession};
pub use tracing::SweepId;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::config::SweepConfig;

    /// A configuration with a fixed 4 KiB page size and accounting
    /// verification on, so tests behave the same on every platform.
    #[must_use]
    pub fn test_config() -> SweepConfig {
        SweepConfig {
            page_size: 4096,
            verify_accounting: true,
            ..SweepConfig::default()
        }
    }
}
