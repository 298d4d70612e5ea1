//! Sweep metrics and statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::sweep::PartialDecision;

/// Statistics of one sweep session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepMetrics {
    /// Time from `begin` to `end`.
    pub duration: Duration,
    /// Time spent in the mutator-thread sweep passes.
    pub foreground_duration: Duration,
    /// Time spent on the background sweeper, `finish` included.
    pub background_duration: Duration,
    /// Time spent in `finish` when it ran on the mutator thread.
    pub finish_duration: Duration,
    /// Blocks analyzed by this session.
    pub blocks_swept: usize,
    /// Blocks found without live objects.
    pub blocks_emptied: usize,
    /// Deferred blocks reused by partial-mode page reuse.
    pub blocks_reused: usize,
    /// New blocks merged into the catalog when the session ended.
    pub blocks_merged: usize,
    /// Empty blocks kept mapped in the pool.
    pub blocks_pooled: usize,
    /// Empty blocks returned to the OS.
    pub blocks_unmapped: usize,
    /// Bytes reclaimed by the session.
    pub bytes_freed: usize,
    /// Dead finalizable objects queued for dispose.
    pub objects_finalized: usize,
    /// Whether the first pass ran on the background sweeper.
    pub background: bool,
    /// Whether the session swept in partial mode.
    pub partial: bool,
    /// Outcome of the partial-collect heuristic.
    pub partial_decision: PartialDecision,
    /// Rescaled efficacy used by an approved recompute.
    pub efficacy: f64,
}

impl Default for SweepMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            foreground_duration: Duration::ZERO,
            background_duration: Duration::ZERO,
            finish_duration: Duration::ZERO,
            blocks_swept: 0,
            blocks_emptied: 0,
            blocks_reused: 0,
            blocks_merged: 0,
            blocks_pooled: 0,
            blocks_unmapped: 0,
            bytes_freed: 0,
            objects_finalized: 0,
            background: false,
            partial: false,
            partial_decision: PartialDecision::NotPartial,
            efficacy: 0.0,
        }
    }
}

/// Accumulates phase durations of a sweep session.
///
/// A phase may be entered several times (the foreground pass runs once
/// for the finalizable and medium buckets and again for the small ones
/// when nothing is offloaded); durations add up.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Time spent in passes on the mutator thread.
    pub foreground: Duration,
    /// Time spent on the background sweeper.
    pub background: Duration,
    /// Time spent in `finish` on the mutator thread.
    pub finish: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            foreground: Duration::ZERO,
            background: Duration::ZERO,
            finish: Duration::ZERO,
            current_start: None,
        }
    }

    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn elapsed(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    pub fn end_foreground(&mut self) {
        let elapsed = self.elapsed();
        self.foreground += elapsed;
    }

    pub fn end_background(&mut self) {
        let elapsed = self.elapsed();
        self.background += elapsed;
    }

    pub fn end_finish(&mut self) {
        let elapsed = self.elapsed();
        self.finish += elapsed;
    }
}

/// Process-level cumulative sweep statistics.
///
/// # Example
///
/// ```
/// use rudo_sweep::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Total sweeps: {}", metrics.total_sweeps());
/// println!("Total bytes freed: {}", metrics.total_bytes_freed());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    sweeps: AtomicUsize,
    partial_sweeps: AtomicUsize,
    background_sweeps: AtomicUsize,
    partial_rejections: AtomicUsize,
    write_watch_failures: AtomicUsize,
    blocks_swept: AtomicUsize,
    bytes_freed: AtomicUsize,
    sweep_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sweeps: AtomicUsize::new(0),
            partial_sweeps: AtomicUsize::new(0),
            background_sweeps: AtomicUsize::new(0),
            partial_rejections: AtomicUsize::new(0),
            write_watch_failures: AtomicUsize::new(0),
            blocks_swept: AtomicUsize::new(0),
            bytes_freed: AtomicUsize::new(0),
            sweep_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn total_sweeps(&self) -> usize {
        self.sweeps.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_partial_sweeps(&self) -> usize {
        self.partial_sweeps.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_background_sweeps(&self) -> usize {
        self.background_sweeps.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_partial_rejections(&self) -> usize {
        self.partial_rejections.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_write_watch_failures(&self) -> usize {
        self.write_watch_failures.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_blocks_swept(&self) -> usize {
        self.blocks_swept.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_bytes_freed(&self) -> usize {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    /// Total time spent sweeping, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_sweep_ns(&self) -> u64 {
        self.sweep_ns.load(Ordering::Relaxed)
    }

    fn record(&self, metrics: &SweepMetrics) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        if metrics.partial {
            self.partial_sweeps.fetch_add(1, Ordering::Relaxed);
        }
        if metrics.background {
            self.background_sweeps.fetch_add(1, Ordering::Relaxed);
        }
        match metrics.partial_decision {
            PartialDecision::Rejected(_) => {
                self.partial_rejections.fetch_add(1, Ordering::Relaxed);
            }
            PartialDecision::WriteWatchFailed => {
                self.write_watch_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.blocks_swept
            .fetch_add(metrics.blocks_swept, Ordering::Relaxed);
        self.bytes_freed
            .fetch_add(metrics.bytes_freed, Ordering::Relaxed);
        self.sweep_ns.fetch_add(
            metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Cumulative statistics over every collector in the process.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Fold a finished session into the process-level counters.
pub(crate) fn record_metrics(metrics: &SweepMetrics) {
    GLOBAL_METRICS.record(metrics);
}

const HISTORY_SIZE: usize = 64;

/// The most recent sweep sessions of one collector, oldest dropped first.
#[derive(Debug, Clone, Default)]
pub struct SweepHistory {
    entries: VecDeque<SweepMetrics>,
    total: usize,
}

impl SweepHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: SweepMetrics) {
        if self.entries.len() == HISTORY_SIZE {
            self.entries.pop_front();
        }
        self.entries.push_back(metrics);
        self.total += 1;
    }

    /// Sessions recorded so far, including those no longer retained.
    #[must_use]
    pub const fn total_recorded(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn last(&self) -> Option<&SweepMetrics> {
        self.entries.back()
    }

    /// Up to `n` most recent entries, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<SweepMetrics> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).copied().collect()
    }

    #[must_use]
    pub fn average_duration(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total_ns: u128 = recent.iter().map(|m| m.duration.as_nanos()).sum();
        Duration::from_nanos(
            (total_ns / recent.len() as u128)
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }

    #[must_use]
    pub fn max_duration(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
