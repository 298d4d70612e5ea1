//! The collector: owns the heap, the allocator and the cycle state, and
//! drives a sweep session through its phases.
//!
//! A cycle looks like this:
//!
//! ```text
//! prepare_collection ─▶ mark ─▶ begin_sweep ─▶ sweep ──────────────────────────▶ end_sweep
//!                                           └▶ start_background_sweep ─▶ wait ─┘
//! ```
//!
//! [`Collector::collect`] runs the whole cycle in one call.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::SweepConfig;
use crate::error::{Result, SweepError};
use crate::heap::{
    AllocationCounters, Allocator, BlockId, DisposeBatch, DisposeQueues, HeapBlockMap, HeapInfo,
    HeapStats, ObjectKind, ObjectRef,
};
use crate::metrics::{record_metrics, SweepHistory, SweepMetrics};
use crate::sweep::{BackgroundSweeper, PartialCollectState, SweepJob, SweepSession};

/// Which kind of collection a cycle performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// Everything allocated so far is collected.
    #[default]
    Full,
    /// Continue partial mode; only new objects and reused pages are
    /// considered. Treated as [`CollectionKind::Full`] outside partial mode.
    Partial,
}

impl CollectionKind {
    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
        }
    }
}

/// Options of a whole collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOptions {
    /// Full or partial request.
    pub kind: CollectionKind,
    /// Estimated bytes of roots to rescan if the cycle runs partially.
    pub rescan_root_bytes: usize,
    /// Recompute the partial-collect thresholds after the sweep.
    pub adjust_heuristics: bool,
    /// Offload the first sweep pass to the background sweeper. Always
    /// done when [`SweepConfig::background_sweep`] is set.
    pub background: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            kind: CollectionKind::Full,
            rescan_root_bytes: 0,
            adjust_heuristics: true,
            background: false,
        }
    }
}

impl CollectOptions {
    /// A full collection with default options.
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }

    /// A partial collection request with the given rescan estimate.
    #[must_use]
    pub fn partial(rescan_root_bytes: usize) -> Self {
        Self {
            kind: CollectionKind::Partial,
            rescan_root_bytes,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_rescan_root_bytes(mut self, bytes: usize) -> Self {
        self.rescan_root_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_adjust_heuristics(mut self, adjust: bool) -> Self {
        self.adjust_heuristics = adjust;
        self
    }

    #[must_use]
    pub const fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

/// What [`Collector::shutdown`] released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Blocks still held by an attached session.
    pub session_blocks: usize,
    /// Blocks filed in the catalog or pooled.
    pub heap_blocks: usize,
    /// Current and new blocks of the allocator.
    pub allocator_blocks: usize,
    /// Finalized objects never disposed.
    pub undisposed_objects: usize,
}

impl ShutdownReport {
    /// Every block released.
    #[must_use]
    pub const fn total_blocks(&self) -> usize {
        self.session_blocks + self.heap_blocks + self.allocator_blocks
    }
}

/// A mark-sweep collector over a block heap.
///
/// # Examples
///
/// ```
/// use rudo_sweep::{CollectOptions, Collector, ObjectKind, SweepConfig};
///
/// let mut collector = Collector::new(SweepConfig::default());
/// let keep = collector.alloc(ObjectKind::Normal, 64).unwrap();
/// let _drop = collector.alloc(ObjectKind::Normal, 64).unwrap();
///
/// let metrics = collector
///     .collect_with(CollectOptions::full(), |c| c.mark(keep))
///     .unwrap();
/// assert_eq!(metrics.bytes_freed, 64);
/// ```
#[derive(Debug)]
pub struct Collector {
    config: SweepConfig,
    /// `None` while the background sweeper owns it.
    heap: Option<Box<HeapInfo>>,
    allocator: Allocator,
    partial: PartialCollectState,
    dispose: Arc<DisposeQueues>,
    session: Option<SweepSession>,
    block_map: HeapBlockMap,
    sweeper: Option<BackgroundSweeper>,
    history: SweepHistory,
    last_visited: HashSet<BlockId>,
    /// Set from `prepare_collection` until `end_sweep`. The allocator only
    /// uses fresh blocks meanwhile.
    in_cycle: bool,
    /// The background sweeper died holding the heap.
    heap_lost: bool,
    shut_down: bool,
}

impl Collector {
    /// A collector with an empty heap.
    #[must_use]
    pub fn new(config: SweepConfig) -> Self {
        let block_map = HeapBlockMap::new();
        Self {
            heap: Some(Box::new(HeapInfo::new(&config, block_map.clone()))),
            allocator: Allocator::new(&config, block_map.clone()),
            partial: PartialCollectState::new(config.partial.enabled),
            dispose: Arc::new(DisposeQueues::new()),
            session: None,
            block_map,
            sweeper: None,
            history: SweepHistory::new(),
            last_visited: HashSet::new(),
            in_cycle: false,
            heap_lost: false,
            shut_down: false,
            config,
        }
    }

    /// Allocate a zeroed object of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`SweepError::ObjectTooLarge`] when no size class fits and
    /// [`SweepError::BlockAllocation`] when pages cannot be mapped.
    pub fn alloc(&mut self, kind: ObjectKind, size: usize) -> Result<ObjectRef> {
        let heap = if self.in_cycle {
            None
        } else {
            self.heap.as_deref_mut()
        };
        self.allocator.alloc(kind, size, heap)
    }

    /// Mark `obj` live for the current cycle.
    pub fn mark(&self, obj: ObjectRef) {
        self.block_map.mark(obj.addr());
    }

    /// Mark the object containing `addr`. Returns `false` if no block
    /// contains it.
    pub fn mark_address(&self, addr: usize) -> bool {
        self.block_map.mark(addr)
    }

    /// Start a collection cycle: hand every allocator block to the heap
    /// and clear the marks. Marking follows, then [`Self::begin_sweep`].
    ///
    /// # Errors
    ///
    /// [`SweepError::SessionActive`] while a session is attached and
    /// [`SweepError::BackgroundSweepActive`] while the heap is out and
    /// [`SweepError::HeapLost`] once the background sweeper died with it.
    pub fn prepare_collection(&mut self, kind: CollectionKind) -> Result<()> {
        if self.session.is_some() {
            return Err(SweepError::SessionActive);
        }
        let missing = self.missing_heap();
        let heap = self.heap.as_deref_mut().ok_or(missing)?;

        let kind = if self.partial.in_partial_collect_mode {
            kind
        } else {
            CollectionKind::Full
        };
        if kind == CollectionKind::Full {
            self.allocator.counters_mut().start_full_collection();
            if self.partial.in_partial_collect_mode {
                self.partial.exit_partial_mode();
                heap.reset_partial_collect();
            }
        }

        heap.merge_all(self.allocator.take_all_new_blocks());
        heap.merge_all(self.allocator.take_current_blocks());
        heap.clear_marks();
        self.in_cycle = true;
        Ok(())
    }

    /// Attach a new sweep session.
    ///
    /// # Errors
    ///
    /// [`SweepError::SessionActive`] if a session is attached,
    /// [`SweepError::BackgroundSweepActive`] if the background sweeper still
    /// holds the heap and [`SweepError::DisposeInProgress`] while a dispose
    /// batch is out.
    pub fn begin_sweep(&mut self, rescan_root_bytes: usize, adjust_heuristics: bool) -> Result<()> {
        if self.session.is_some() {
            return Err(SweepError::SessionActive);
        }
        if self.is_sweeping() {
            return Err(SweepError::BackgroundSweepActive);
        }
        let missing = self.missing_heap();
        let heap = self.heap.as_deref_mut().ok_or(missing)?;
        let session = SweepSession::begin(
            &self.config,
            heap,
            &mut self.allocator,
            &mut self.partial,
            &self.dispose,
            rescan_root_bytes,
            adjust_heuristics,
        )?;
        self.session = Some(session);
        self.in_cycle = true;
        Ok(())
    }

    /// Run every sweep pass and `finish` on the calling thread.
    ///
    /// # Errors
    ///
    /// [`SweepError::NoActiveSession`], [`SweepError::BackgroundSweepActive`]
    /// or [`SweepError::InvalidPhase`] if the session already swept.
    pub fn sweep(&mut self) -> Result<()> {
        let missing = self.missing_heap();
        let session = self.session.as_mut().ok_or(SweepError::NoActiveSession)?;
        let heap = self.heap.as_deref_mut().ok_or(missing)?;
        session.sweep_foreground(heap, &mut self.partial, &self.dispose)?;
        session.force_foreground();
        session.background_sweep(heap, &mut self.partial, &self.dispose)
    }

    /// Sweep the finalizable and medium buckets here, then hand the rest
    /// of the sweep to the background thread. The mutator may keep
    /// allocating; it only gets fresh blocks until the heap comes back.
    ///
    /// # Errors
    ///
    /// As [`Self::sweep`], plus [`SweepError::WorkerSpawn`] if the worker
    /// thread cannot be started.
    pub fn start_background_sweep(&mut self) -> Result<()> {
        if self.is_sweeping() {
            return Err(SweepError::BackgroundSweepActive);
        }
        let mut session = self.session.take().ok_or(SweepError::NoActiveSession)?;
        let Some(mut heap) = self.heap.take() else {
            self.session = Some(session);
            return Err(self.missing_heap());
        };

        let prepared = session
            .sweep_foreground(&mut heap, &mut self.partial, &self.dispose)
            .and_then(|()| self.ensure_sweeper());
        if let Err(err) = prepared {
            self.session = Some(session);
            self.heap = Some(heap);
            return Err(err);
        }

        let job = SweepJob {
            session,
            heap,
            partial: self.partial,
            dispose: Arc::clone(&self.dispose),
        };
        let Some(sweeper) = &self.sweeper else {
            self.restore(job);
            return Err(SweepError::BackgroundWorkerLost);
        };
        if let Err((job, err)) = sweeper.submit(job) {
            self.restore(job);
            return Err(err);
        }
        Ok(())
    }

    fn ensure_sweeper(&mut self) -> Result<()> {
        if self.sweeper.is_none() {
            self.sweeper = Some(BackgroundSweeper::spawn().map_err(SweepError::WorkerSpawn)?);
        }
        Ok(())
    }

    fn restore(&mut self, job: SweepJob) {
        self.session = Some(job.session);
        self.heap = Some(job.heap);
        self.partial = job.partial;
    }

    /// Wait for the background sweeper and take the heap back. Returns
    /// immediately when nothing is out.
    ///
    /// # Errors
    ///
    /// [`SweepError::BackgroundWorkerLost`] if the worker died, or the
    /// error the background pass itself reported. A lost worker takes the
    /// heap and session with it; operations needing the heap then return
    /// [`SweepError::HeapLost`] until [`Self::shutdown`] installs an empty one.
    pub fn wait_for_background_sweep(&mut self) -> Result<()> {
        let Some(sweeper) = &self.sweeper else {
            return Ok(());
        };
        if !sweeper.is_sweeping() {
            return Ok(());
        }
        let (job, outcome) = match sweeper.wait() {
            Ok(result) => result,
            Err(err) => {
                // The heap and session went down with the worker.
                self.sweeper = None;
                self.heap_lost = true;
                return Err(err);
            }
        };
        self.restore(job);
        outcome?;
        if let (Some(session), Some(heap)) = (self.session.as_mut(), self.heap.as_deref_mut()) {
            session.complete_write_watch_reset(heap, &mut self.partial);
        }
        Ok(())
    }

    /// The error for an operation that needs the heap while it is absent.
    fn missing_heap(&self) -> SweepError {
        if self.heap_lost {
            SweepError::HeapLost
        } else {
            SweepError::BackgroundSweepActive
        }
    }

    /// Detach the session, merge the blocks it held and the blocks created
    /// during the sweep, and release the empty ones.
    ///
    /// # Errors
    ///
    /// [`SweepError::NoActiveSession`] without an attached session and
    /// [`SweepError::InvalidPhase`] if it has not finished sweeping.
    pub fn end_sweep(&mut self) -> Result<SweepMetrics> {
        self.wait_for_background_sweep()?;
        let mut session = self.session.take().ok_or(SweepError::NoActiveSession)?;
        let missing = self.missing_heap();
        let Some(heap) = self.heap.as_deref_mut() else {
            self.session = Some(session);
            return Err(missing);
        };
        let metrics = match session.end(heap, &mut self.allocator) {
            Ok(metrics) => metrics,
            Err(err) => {
                self.session = Some(session);
                return Err(err);
            }
        };

        self.last_visited = session.take_visited_blocks();
        self.history.push(metrics);
        record_metrics(&metrics);
        self.in_cycle = false;
        Ok(metrics)
    }

    /// Run a whole cycle without marking anything.
    ///
    /// # Errors
    ///
    /// Any error of the individual cycle steps.
    pub fn collect(&mut self, options: CollectOptions) -> Result<SweepMetrics> {
        self.collect_with(options, |_| {})
    }

    /// Run a whole cycle, calling `mark` between preparation and sweep.
    ///
    /// # Errors
    ///
    /// Any error of the individual cycle steps.
    pub fn collect_with(
        &mut self,
        options: CollectOptions,
        mark: impl FnOnce(&Self),
    ) -> Result<SweepMetrics> {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_collection(options.kind.as_str());

        self.prepare_collection(options.kind)?;
        mark(self);
        self.begin_sweep(options.rescan_root_bytes, options.adjust_heuristics)?;
        if options.background || self.config.background_sweep {
            self.start_background_sweep()?;
            self.wait_for_background_sweep()?;
        } else {
            self.sweep()?;
        }
        self.end_sweep()
    }

    /// Take the finalized objects waiting for dispose.
    ///
    /// The next [`Self::begin_sweep`] fails with
    /// [`SweepError::DisposeInProgress`] until the batch is completed.
    pub fn take_pending_dispose(&self) -> DisposeBatch {
        self.dispose.begin_dispose()
    }

    /// Hand back a disposed batch. Its slots are reclaimed now if the heap
    /// is idle, otherwise at the next [`Self::begin_sweep`].
    pub fn complete_dispose(&mut self, batch: DisposeBatch) {
        self.dispose.complete_dispose(batch);
        if self.session.is_none() {
            if let Some(heap) = self.heap.as_deref_mut() {
                heap.transfer_disposed_objects(&self.dispose);
            }
        }
    }

    /// Run `dispose` over every finalized object and reclaim their slots.
    /// Returns how many objects were disposed.
    pub fn dispose_objects(&mut self, mut dispose: impl FnMut(ObjectRef)) -> usize {
        let batch = self.take_pending_dispose();
        for &obj in batch.objects() {
            dispose(obj);
        }
        let count = batch.len();
        self.complete_dispose(batch);
        count
    }

    /// Release every block the collector owns, including those held by an
    /// attached session. The collector stays usable with an empty heap.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.wait_for_background_sweep().is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("background sweeper lost during shutdown");
        }

        let mut report = ShutdownReport::default();
        if let Some(mut session) = self.session.take() {
            report.session_blocks = session.shutdown_cleanup();
        }
        if let Some(heap) = self.heap.as_deref_mut() {
            report.heap_blocks = heap.release_all();
        }
        report.allocator_blocks = self.allocator.release_all();
        report.undisposed_objects = self.dispose.pending_len() + self.dispose.disposed_len();
        self.dispose.clear();
        self.block_map.clear();
        if self.heap_lost {
            self.heap = Some(Box::new(HeapInfo::new(&self.config, self.block_map.clone())));
            self.heap_lost = false;
        }
        if self.partial.in_partial_collect_mode {
            self.partial.exit_partial_mode();
        }
        self.in_cycle = false;
        self.shut_down = true;
        report
    }

    // Inspection.

    /// Configuration the collector was built with.
    #[must_use]
    pub const fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Whether the collector is between partial collections.
    #[must_use]
    pub const fn in_partial_collect_mode(&self) -> bool {
        self.partial.in_partial_collect_mode
    }

    /// Bytes allocated since the last full collection that partial collections left uncollected.
    #[must_use]
    pub const fn partial_uncollected_alloc_bytes(&self) -> usize {
        self.partial.partial_uncollected_alloc_bytes
    }

    /// Bytes allocated since the last collection.
    #[must_use]
    pub const fn uncollected_alloc_bytes(&self) -> usize {
        self.allocator.counters().uncollected_alloc_bytes
    }

    /// The allocator's byte and page counters.
    #[must_use]
    pub const fn allocation_counters(&self) -> &AllocationCounters {
        self.allocator.counters()
    }

    /// Collector-wide partial-collect state. Stale while the background
    /// sweeper holds its copy.
    #[must_use]
    pub const fn partial_state(&self) -> &PartialCollectState {
        &self.partial
    }

    /// Whether the background sweeper holds the heap.
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .as_ref()
            .is_some_and(BackgroundSweeper::is_sweeping)
    }

    /// Whether a session is attached, including one out on the
    /// background sweeper.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.session.is_some() || self.is_sweeping()
    }

    /// The attached session, unless it is out on the background sweeper.
    #[must_use]
    pub const fn session(&self) -> Option<&SweepSession> {
        self.session.as_ref()
    }

    /// Catalog counts, or `None` while the heap is out.
    #[must_use]
    pub fn heap_stats(&self) -> Option<HeapStats> {
        self.heap.as_deref().map(HeapInfo::stats)
    }

    /// Whether block `id` is filed in the catalog.
    #[must_use]
    pub fn heap_contains(&self, id: BlockId) -> bool {
        self.heap.as_deref().is_some_and(|heap| heap.contains(id))
    }

    /// Whether block `id` is a current or new block of the allocator.
    #[must_use]
    pub fn allocator_owns(&self, id: BlockId) -> bool {
        self.allocator.owns(id)
    }

    /// Blocks analyzed by the last ended session.
    #[must_use]
    pub const fn visited_blocks(&self) -> &HashSet<BlockId> {
        &self.last_visited
    }

    /// Metrics of recent sessions.
    #[must_use]
    pub const fn history(&self) -> &SweepHistory {
        &self.history
    }

    /// Finalized objects waiting to be disposed.
    #[must_use]
    pub fn pending_dispose_count(&self) -> usize {
        self.dispose.pending_len()
    }

    /// Whether partial mode has used up its new-page budget.
    #[must_use]
    pub const fn collection_due(&self) -> bool {
        self.partial.in_partial_collect_mode
            && self.allocator.counters().uncollected_new_page_count
                >= self.partial.uncollected_new_page_count
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if !self.shut_down {
            self.shutdown();
        }
    }
}
