//! Per-cycle sweep session.
//!
//! A session is created by [`SweepSession::begin`] once marking is done
//! and lives until [`SweepSession::end`]. It owns every block it has taken
//! out of the catalog (pending merge, pending sweep and pending empty
//! lists) and carries the byte accounting the partial-collect heuristic
//! needs. The catalog and the heuristic state are passed in by reference
//! at each step, so the whole session can be moved to the background
//! sweeper together with them.

use std::collections::HashSet;
use std::time::Instant;

use super::partial::{
    recompute_thresholds, should_enter_partial_mode, HeuristicInputs, PartialCollectState,
    PartialRejection,
};
use super::SweepPhase;
use crate::config::SweepConfig;
use crate::error::{Result, SweepError};
use crate::heap::{
    AllocationCounters, Allocator, BlockId, BlockList, BucketKind, DisposeQueues, HeapBlock,
    HeapInfo,
};
use crate::metrics::{PhaseTimer, SweepMetrics};
use crate::tracing::internal::{self as trace, SweepId};

/// Outcome of the partial-collect decision of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum PartialDecision {
    /// The session did not sweep in partial mode.
    #[default]
    NotPartial,
    /// The recompute approved partial mode and produced new thresholds.
    Approved,
    /// Partial mode continued without recomputing the thresholds.
    KeptThresholds,
    /// The recompute refused partial mode.
    Rejected(PartialRejection),
    /// Write watch could not be reset; partial collection is now disabled.
    WriteWatchFailed,
}

#[derive(Debug, Default)]
struct BucketRecord {
    pending_sweep: BlockList,
    pending_empty: BlockList,
}

#[derive(Debug)]
struct KindRecord {
    pending_merge: BlockList,
    buckets: Vec<BucketRecord>,
}

#[derive(Debug)]
pub struct SweepSession {
    id: SweepId,
    phase: SweepPhase,
    config: SweepConfig,
    kinds: Vec<KindRecord>,

    rescan_root_bytes: usize,
    last_partial_uncollected_alloc_bytes: usize,
    next_partial_uncollected_alloc_bytes: usize,
    reuse_heap_block_count: usize,
    reuse_byte_count: usize,
    partial_unused_free_byte_count: usize,
    reuse_min_free_bytes: usize,

    background: bool,
    force_foreground: bool,
    in_partial_collect: bool,
    partial: bool,
    adjust_partial_heuristics: bool,
    has_pending_sweep_blocks: bool,
    has_pending_empty_blocks: bool,
    /// Set when `finish` ran off the mutator thread with write watch to reset.
    write_watch_reset_pending: bool,

    visited: HashSet<BlockId>,
    metrics: SweepMetrics,
    timer: PhaseTimer,
    started: Instant,
}

impl SweepSession {
    fn new(config: &SweepConfig, rescan_root_bytes: usize, adjust_partial_heuristics: bool) -> Self {
        Self {
            id: trace::next_sweep_id(),
            phase: SweepPhase::Idle,
            config: *config,
            kinds: BucketKind::ALL
                .iter()
                .map(|kind| KindRecord {
                    pending_merge: BlockList::new(),
                    buckets: (0..kind.bucket_count())
                        .map(|_| BucketRecord::default())
                        .collect(),
                })
                .collect(),
            rescan_root_bytes,
            last_partial_uncollected_alloc_bytes: 0,
            next_partial_uncollected_alloc_bytes: 0,
            reuse_heap_block_count: 0,
            reuse_byte_count: 0,
            partial_unused_free_byte_count: 0,
            reuse_min_free_bytes: 0,
            background: false,
            force_foreground: false,
            in_partial_collect: false,
            partial: false,
            adjust_partial_heuristics,
            has_pending_sweep_blocks: false,
            has_pending_empty_blocks: false,
            write_watch_reset_pending: false,
            visited: HashSet::new(),
            metrics: SweepMetrics::new(),
            timer: PhaseTimer::new(),
            started: Instant::now(),
        }
    }

    /// Start a sweep session.
    ///
    /// Flushes objects disposed since the last cycle back to their blocks,
    /// takes the allocator's new-block lists (those blocks are not swept
    /// this cycle) and decides whether the cycle sweeps in partial mode.
    ///
    /// # Errors
    ///
    /// [`SweepError::DisposeInProgress`] if a dispose batch is still out.
    pub(crate) fn begin(
        config: &SweepConfig,
        heap: &mut HeapInfo,
        allocator: &mut Allocator,
        partial: &mut PartialCollectState,
        dispose: &DisposeQueues,
        rescan_root_bytes: usize,
        adjust_partial_heuristics: bool,
    ) -> Result<Self> {
        if dispose.is_dispose_in_progress() {
            return Err(SweepError::DisposeInProgress);
        }
        heap.transfer_disposed_objects(dispose);

        let mut session = Self::new(config, rescan_root_bytes, adjust_partial_heuristics);
        session.transition(SweepPhase::Began)?;

        for kind in BucketKind::ALL {
            session.kinds[kind.index()].pending_merge = allocator.take_new_blocks(kind);
        }

        let enter = should_enter_partial_mode(
            partial,
            &config.partial,
            heap.unused_partial_collect_free_bytes(),
            rescan_root_bytes,
        );
        trace::log_partial_mode(session.id, enter, rescan_root_bytes);
        if enter {
            session.start_partial_collect_mode(partial, allocator.counters());
        } else if partial.in_partial_collect_mode {
            session.finish_partial_collect(heap, partial);
        }

        if session.in_partial_collect {
            allocator.counters_mut().reset_heuristic_counters();
        } else {
            allocator.counters_mut().reset_partial_heuristic_counters();
        }
        session.metrics.partial = session.partial;
        Ok(session)
    }

    fn start_partial_collect_mode(
        &mut self,
        partial: &mut PartialCollectState,
        counters: &AllocationCounters,
    ) {
        self.in_partial_collect = partial.in_partial_collect_mode;
        partial.in_partial_collect_mode = true;
        self.partial = true;

        self.check(
            self.in_partial_collect || partial.partial_uncollected_alloc_bytes == 0,
            || {
                format!(
                    "{} partial uncollected bytes left over from a full collection",
                    partial.partial_uncollected_alloc_bytes
                )
            },
        );
        self.last_partial_uncollected_alloc_bytes = partial.partial_uncollected_alloc_bytes;

        let mut current = counters.uncollected_alloc_bytes;
        self.check(current >= self.last_partial_uncollected_alloc_bytes, || {
            format!(
                "uncollected bytes {current} below last partial uncollected bytes {}",
                self.last_partial_uncollected_alloc_bytes
            )
        });
        if !self.in_partial_collect {
            current += counters.last_uncollected_alloc_bytes;
        }
        partial.partial_uncollected_alloc_bytes = current;
        self.next_partial_uncollected_alloc_bytes = current;
    }

    fn finish_partial_collect(&mut self, heap: &mut HeapInfo, partial: &mut PartialCollectState) {
        partial.exit_partial_mode();
        self.partial = false;
        let freed = heap.finish_partial_collect();
        self.metrics.bytes_freed += freed;
    }

    fn transition(&mut self, to: SweepPhase) -> Result<()> {
        if !self.phase.is_valid_transition(to) {
            return Err(SweepError::InvalidPhase {
                from: self.phase,
                to,
            });
        }
        trace::log_phase_transition(self.id, self.phase, to);
        self.phase = to;
        Ok(())
    }

    /// Panic with `what` when verification is on and `ok` does not hold.
    fn check(&self, ok: bool, what: impl FnOnce() -> String) {
        assert!(
            ok || !self.config.verify_accounting,
            "sweep accounting violated: {}",
            what()
        );
    }

    /// Sweep the finalizable and medium buckets on the calling thread.
    ///
    /// # Errors
    ///
    /// [`SweepError::InvalidPhase`] once the session has finished.
    pub(crate) fn sweep_foreground(
        &mut self,
        heap: &mut HeapInfo,
        partial: &mut PartialCollectState,
        dispose: &DisposeQueues,
    ) -> Result<()> {
        self.transition(SweepPhase::ExecutingForeground)?;
        self.timer.start();
        heap.sweep_foreground(self, partial, dispose);
        self.timer.end_foreground();
        Ok(())
    }

    /// Sweep the small non-finalizable buckets and finish the session.
    ///
    /// This is the pass the background sweeper runs. With
    /// [`force_foreground`](Self::force_foreground) set it runs the same
    /// way on the mutator thread.
    ///
    /// # Errors
    ///
    /// [`SweepError::InvalidPhase`] if the session already finished.
    pub(crate) fn background_sweep(
        &mut self,
        heap: &mut HeapInfo,
        partial: &mut PartialCollectState,
        dispose: &DisposeQueues,
    ) -> Result<()> {
        self.transition(SweepPhase::ExecutingBackground)?;
        self.begin_background(self.force_foreground);
        self.timer.start();
        heap.sweep_small_non_finalizable(self, partial, dispose);
        if self.background {
            self.finish(heap, partial)?;
            self.timer.end_background();
        } else {
            self.timer.end_foreground();
            self.timer.start();
            self.finish(heap, partial)?;
            self.timer.end_finish();
        }
        self.end_background();
        Ok(())
    }

    /// Run the background pass on the calling thread.
    pub(crate) fn force_foreground(&mut self) {
        self.force_foreground = true;
    }

    fn begin_background(&mut self, force_foreground: bool) {
        self.background = !force_foreground;
        self.metrics.background = self.background;
    }

    fn end_background(&mut self) {
        self.background = false;
    }

    #[must_use]
    pub const fn is_background(&self) -> bool {
        self.background
    }

    fn finish(&mut self, heap: &mut HeapInfo, partial: &mut PartialCollectState) -> Result<()> {
        self.transition(SweepPhase::Finished)?;
        self.check(self.partial == partial.in_partial_collect_mode, || {
            "partial mode changed outside the session".to_owned()
        });

        if partial.in_partial_collect_mode {
            if self.adjust_partial_heuristics(heap, partial) {
                partial.partial_uncollected_alloc_bytes = if self.in_partial_collect {
                    self.next_partial_uncollected_alloc_bytes
                } else {
                    0
                };
                heap.sweep_partial_reuse_pages(self);

                if !self.config.force_software_write_barrier {
                    if self.is_background() {
                        self.write_watch_reset_pending = true;
                    } else {
                        self.reset_write_watch(heap, partial);
                    }
                }
            } else {
                self.finish_partial_collect(heap, partial);
            }
        } else {
            self.check(partial.partial_uncollected_alloc_bytes == 0, || {
                format!(
                    "{} partial uncollected bytes outside partial mode",
                    partial.partial_uncollected_alloc_bytes
                )
            });
        }

        heap.sweep_pending_objects(self);
        Ok(())
    }

    /// Reset write watch over the reused pages. On failure partial
    /// collection is disabled for good and the set-aside blocks are swept.
    fn reset_write_watch(&mut self, heap: &mut HeapInfo, partial: &mut PartialCollectState) {
        if let Err(error) = heap.reset_write_watch() {
            trace::log_write_watch_failure(self.id, &error);
            partial.enabled = false;
            self.metrics.partial_decision = PartialDecision::WriteWatchFailed;
            self.finish_partial_collect(heap, partial);
        }
    }

    /// Run the write-watch reset a background `finish` left for the
    /// mutator thread.
    pub(crate) fn complete_write_watch_reset(
        &mut self,
        heap: &mut HeapInfo,
        partial: &mut PartialCollectState,
    ) {
        if std::mem::take(&mut self.write_watch_reset_pending) {
            self.reset_write_watch(heap, partial);
        }
    }

    /// Decide whether partial mode continues, storing new thresholds in
    /// `partial` on approval.
    fn adjust_partial_heuristics(
        &mut self,
        heap: &HeapInfo,
        partial: &mut PartialCollectState,
    ) -> bool {
        if !self.adjust_partial_heuristics {
            self.reuse_min_free_bytes = reuse_threshold(self.config.page_size, partial.last_efficacy);
            self.metrics.partial_decision = PartialDecision::KeptThresholds;
            return true;
        }

        let unused = heap.unused_partial_collect_free_bytes();
        self.check(self.in_partial_collect || unused == 0, || {
            format!("{unused} unused partial free bytes after a full collection")
        });
        let inputs = HeuristicInputs {
            new_object_alloc_bytes: self.new_object_alloc_bytes(partial),
            new_object_free_bytes: self.new_object_free_bytes(partial),
            reuse_heap_block_count: self.reuse_heap_block_count,
            reuse_byte_count: self.reuse_byte_count,
            rescan_root_bytes: self.rescan_root_bytes,
            next_partial_uncollected_alloc_bytes: self.next_partial_uncollected_alloc_bytes,
            unused_partial_collect_free_bytes: unused,
            in_partial_collect: self.in_partial_collect,
            page_size: self.config.page_size,
        };
        match recompute_thresholds(&inputs, &self.config.partial) {
            Ok(thresholds) => {
                trace::log_partial_approved(
                    self.id,
                    thresholds.efficacy,
                    thresholds.uncollected_new_page_count,
                );
                self.reuse_min_free_bytes = thresholds.reuse_min_free_bytes;
                partial.apply(&thresholds);
                self.metrics.efficacy = thresholds.efficacy;
                self.metrics.partial_decision = PartialDecision::Approved;
                true
            }
            Err(rejection) => {
                trace::log_partial_rejected(self.id, &rejection);
                self.metrics.partial_decision = PartialDecision::Rejected(rejection);
                false
            }
        }
    }

    /// Bytes allocated since the last partial collection.
    fn new_object_alloc_bytes(&self, partial: &PartialCollectState) -> usize {
        let total = partial.partial_uncollected_alloc_bytes;
        self.check(total >= self.last_partial_uncollected_alloc_bytes, || {
            format!(
                "partial uncollected bytes {total} shrank below {}",
                self.last_partial_uncollected_alloc_bytes
            )
        });
        total.saturating_sub(self.last_partial_uncollected_alloc_bytes)
    }

    /// Bytes of new objects this cycle freed.
    fn new_object_free_bytes(&self, partial: &PartialCollectState) -> usize {
        let total = partial.partial_uncollected_alloc_bytes;
        self.check(total >= self.next_partial_uncollected_alloc_bytes, || {
            format!(
                "partial uncollected bytes {total} below outstanding {}",
                self.next_partial_uncollected_alloc_bytes
            )
        });
        total.saturating_sub(self.next_partial_uncollected_alloc_bytes)
    }

    /// Close the session: merge every block it holds back into the
    /// catalog and release the empty ones.
    ///
    /// # Errors
    ///
    /// [`SweepError::InvalidPhase`] if the session has not finished.
    pub(crate) fn end(
        &mut self,
        heap: &mut HeapInfo,
        allocator: &mut Allocator,
    ) -> Result<SweepMetrics> {
        self.transition(SweepPhase::Ended)?;

        if self.in_partial_collect {
            allocator.counters_mut().uncollected_alloc_bytes +=
                self.next_partial_uncollected_alloc_bytes;
        }

        let mut merged = 0;
        let mut empty = BlockList::new();
        for record in &mut self.kinds {
            merged += heap.merge_all(record.pending_merge.take());
            for bucket in &mut record.buckets {
                debug_assert!(bucket.pending_sweep.is_empty());
                empty.append(&mut bucket.pending_empty);
            }
        }
        merged += heap.merge_all(allocator.take_all_new_blocks());
        self.has_pending_sweep_blocks = false;
        self.has_pending_empty_blocks = false;

        let (pooled, unmapped) = heap.release_empty_blocks(empty);
        heap.block_map().cleanup();

        self.metrics.blocks_merged = merged;
        self.metrics.blocks_pooled = pooled;
        self.metrics.blocks_unmapped = unmapped;
        self.metrics.blocks_swept = self.visited.len();
        self.metrics.foreground_duration = self.timer.foreground;
        self.metrics.background_duration = self.timer.background;
        self.metrics.finish_duration = self.timer.finish;
        self.metrics.duration = self.started.elapsed();
        trace::log_sweep_end(self.id, self.metrics.bytes_freed, self.metrics.blocks_swept);
        Ok(self.metrics)
    }

    /// Drop every block the session still holds. Returns how many were
    /// released.
    pub(crate) fn shutdown_cleanup(&mut self) -> usize {
        let mut released = 0;
        for (kind, record) in BucketKind::ALL.iter().zip(&mut self.kinds) {
            released += record.pending_merge.take().len();
            for bucket in &mut record.buckets {
                debug_assert!(!kind.kind.is_leaf() || bucket.pending_sweep.is_empty());
                released += bucket.pending_sweep.take().len();
                released += bucket.pending_empty.take().len();
            }
        }
        self.has_pending_sweep_blocks = false;
        self.has_pending_empty_blocks = false;
        released
    }

    // Bookkeeping used while buckets are swept.

    pub(crate) fn visit(&mut self, block: &HeapBlock) {
        let first = self.visited.insert(block.id());
        self.check(first, || format!("block {} swept twice", block.id().as_u64()));
    }

    pub(crate) const fn verify_accounting(&self) -> bool {
        self.config.verify_accounting
    }

    /// Whether partial mode is armed for this cycle.
    #[must_use]
    pub const fn in_partial_collect_mode(&self) -> bool {
        self.partial
    }

    /// Whether the collector was already in partial mode when the cycle began.
    #[must_use]
    pub const fn in_partial_collect(&self) -> bool {
        self.in_partial_collect
    }

    pub(crate) fn add_unaccounted_new_object_alloc_bytes(
        &mut self,
        block: &mut HeapBlock,
        partial: &mut PartialCollectState,
    ) {
        let bytes = block.take_unaccounted_alloc_bytes();
        if self.partial {
            partial.partial_uncollected_alloc_bytes += bytes;
            self.next_partial_uncollected_alloc_bytes += bytes;
        }
    }

    pub(crate) fn subtract_sweep_new_object_alloc_bytes(&mut self, bytes: usize) {
        let next = self.next_partial_uncollected_alloc_bytes;
        self.check(next >= bytes, || {
            format!("freed {bytes} new bytes but only {next} are outstanding")
        });
        self.check(
            next >= self.last_partial_uncollected_alloc_bytes + bytes,
            || {
                format!(
                    "freed {bytes} new bytes reach into the {} bytes of earlier cycles",
                    self.last_partial_uncollected_alloc_bytes
                )
            },
        );
        self.next_partial_uncollected_alloc_bytes = next.saturating_sub(bytes);
    }

    pub(crate) fn notify_allocable_objects(&mut self, block: &HeapBlock) {
        self.reuse_byte_count += block.expected_free_bytes();
        if !block.bucket().kind.is_leaf() {
            self.reuse_heap_block_count += 1;
        }
    }

    pub(crate) fn add_unused_free_byte_count(&mut self, bytes: usize) {
        self.partial_unused_free_byte_count += bytes;
    }

    pub(crate) const fn partial_unused_free_byte_count(&self) -> usize {
        self.partial_unused_free_byte_count
    }

    pub(crate) const fn reuse_min_free_bytes(&self) -> usize {
        self.reuse_min_free_bytes
    }

    pub(crate) fn defer_sweep(&mut self, block: HeapBlock) {
        let (kind, class) = (block.bucket(), block.size_class());
        self.kinds[kind.index()].buckets[class].pending_sweep.push(block);
        self.has_pending_sweep_blocks = true;
    }

    pub(crate) fn defer_empty(&mut self, block: HeapBlock) {
        let (kind, class) = (block.bucket(), block.size_class());
        self.kinds[kind.index()].buckets[class].pending_empty.push(block);
        self.has_pending_empty_blocks = true;
        self.metrics.blocks_emptied += 1;
    }

    pub(crate) fn take_pending_sweep(&mut self, kind: BucketKind, size_class: usize) -> BlockList {
        self.kinds[kind.index()].buckets[size_class]
            .pending_sweep
            .take()
    }

    pub(crate) const fn has_pending_sweep_blocks(&self) -> bool {
        self.has_pending_sweep_blocks
    }

    #[must_use]
    pub const fn has_pending_empty_blocks(&self) -> bool {
        self.has_pending_empty_blocks
    }

    pub(crate) fn record_swept(&mut self, freed: usize) {
        self.metrics.bytes_freed += freed;
    }

    pub(crate) fn record_reused(&mut self) {
        self.metrics.blocks_reused += 1;
    }

    pub(crate) fn record_finalized(&mut self, count: usize) {
        self.metrics.objects_finalized += count;
    }

    // Inspection.

    #[must_use]
    pub const fn id(&self) -> SweepId {
        self.id
    }

    #[must_use]
    pub const fn phase(&self) -> SweepPhase {
        self.phase
    }

    #[must_use]
    pub const fn rescan_root_bytes(&self) -> usize {
        self.rescan_root_bytes
    }

    #[must_use]
    pub const fn last_partial_uncollected_alloc_bytes(&self) -> usize {
        self.last_partial_uncollected_alloc_bytes
    }

    #[must_use]
    pub const fn next_partial_uncollected_alloc_bytes(&self) -> usize {
        self.next_partial_uncollected_alloc_bytes
    }

    #[must_use]
    pub const fn reuse_heap_block_count(&self) -> usize {
        self.reuse_heap_block_count
    }

    #[must_use]
    pub const fn reuse_byte_count(&self) -> usize {
        self.reuse_byte_count
    }

    /// Blocks analyzed so far.
    #[must_use]
    pub const fn visited_blocks(&self) -> &HashSet<BlockId> {
        &self.visited
    }

    pub(crate) fn take_visited_blocks(&mut self) -> HashSet<BlockId> {
        std::mem::take(&mut self.visited)
    }

    /// Blocks the session still holds, across all of its lists.
    #[must_use]
    pub fn held_block_count(&self) -> usize {
        self.kinds
            .iter()
            .map(|record| {
                record.pending_merge.len()
                    + record
                        .buckets
                        .iter()
                        .map(|b| b.pending_sweep.len() + b.pending_empty.len())
                        .sum::<usize>()
            })
            .sum()
    }

    #[must_use]
    pub const fn metrics(&self) -> &SweepMetrics {
        &self.metrics
    }
}

#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
fn reuse_threshold(page_size: usize, efficacy: f64) -> usize {
    (page_size as f64 * efficacy) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::heap::{HeapBlockMap, ObjectKind};

    struct Fixture {
        config: SweepConfig,
        heap: HeapInfo,
        allocator: Allocator,
        partial: PartialCollectState,
        dispose: DisposeQueues,
    }

    impl Fixture {
        fn new() -> Self {
            let config = crate::test_util::test_config();
            let map = HeapBlockMap::new();
            Self {
                heap: HeapInfo::new(&config, map.clone()),
                allocator: Allocator::new(&config, map),
                partial: PartialCollectState::default(),
                dispose: DisposeQueues::new(),
                config,
            }
        }

        fn begin(&mut self, rescan: usize) -> Result<SweepSession> {
            SweepSession::begin(
                &self.config,
                &mut self.heap,
                &mut self.allocator,
                &mut self.partial,
                &self.dispose,
                rescan,
                true,
            )
        }

        fn run(&mut self, session: &mut SweepSession) -> SweepMetrics {
            session
                .sweep_foreground(&mut self.heap, &mut self.partial, &self.dispose)
                .unwrap();
            session.force_foreground();
            session
                .background_sweep(&mut self.heap, &mut self.partial, &self.dispose)
                .unwrap();
            session.end(&mut self.heap, &mut self.allocator).unwrap()
        }
    }

    #[test]
    fn test_full_to_partial_accounting() {
        let mut f = Fixture::new();
        f.allocator.counters_mut().uncollected_alloc_bytes = 3000;
        f.allocator.counters_mut().last_uncollected_alloc_bytes = 1000;

        let session = f.begin(MIB).unwrap();
        assert!(session.in_partial_collect_mode());
        assert!(!session.in_partial_collect());
        assert!(f.partial.in_partial_collect_mode);
        assert_eq!(f.partial.partial_uncollected_alloc_bytes, 4000);
        assert_eq!(session.next_partial_uncollected_alloc_bytes(), 4000);
        assert_eq!(session.last_partial_uncollected_alloc_bytes(), 0);
    }

    #[test]
    fn test_high_rescan_leaves_partial_mode() {
        let mut f = Fixture::new();
        f.partial.in_partial_collect_mode = true;
        f.partial.partial_uncollected_alloc_bytes = 500;

        let session = f.begin(6 * MIB).unwrap();
        assert!(!session.in_partial_collect_mode());
        assert!(!f.partial.in_partial_collect_mode);
        assert_eq!(f.partial.partial_uncollected_alloc_bytes, 0);
    }

    #[test]
    fn test_phase_order_is_enforced() {
        let mut f = Fixture::new();
        let mut session = f.begin(0).unwrap();
        assert_eq!(session.phase(), SweepPhase::Began);
        let err = session.end(&mut f.heap, &mut f.allocator).unwrap_err();
        assert!(matches!(
            err,
            SweepError::InvalidPhase {
                from: SweepPhase::Began,
                to: SweepPhase::Ended
            }
        ));

        f.run(&mut session);
        assert_eq!(session.phase(), SweepPhase::Ended);
        let err = session
            .sweep_foreground(&mut f.heap, &mut f.partial, &f.dispose)
            .unwrap_err();
        assert!(matches!(err, SweepError::InvalidPhase { .. }));
    }

    /// Fill one 4 KiB block of 512-byte objects and start the next, so
    /// the first one is retired to the new-block list.
    fn retire_one_block(allocator: &mut Allocator, kind: ObjectKind) {
        for _ in 0..=(4096 / 512) {
            allocator.alloc(kind, 512, None).unwrap();
        }
    }

    #[test]
    fn test_new_blocks_wait_for_end() {
        let mut f = Fixture::new();
        retire_one_block(&mut f.allocator, ObjectKind::Normal);
        assert_eq!(f.allocator.new_block_count(), 1);

        let mut session = f.begin(0).unwrap();
        assert_eq!(f.allocator.new_block_count(), 0);
        assert_eq!(session.held_block_count(), 1);

        let metrics = f.run(&mut session);
        assert!(session.visited_blocks().is_empty());
        assert_eq!(metrics.blocks_merged, 1);
        assert_eq!(f.heap.stats().block_count, 1);
    }

    #[test]
    fn test_dead_blocks_are_emptied() {
        let mut f = Fixture::new();
        for _ in 0..4 {
            f.allocator.alloc(ObjectKind::Leaf, 32, None).unwrap();
        }
        f.heap.merge_all(f.allocator.take_current_blocks());

        let mut session = f.begin(6 * MIB).unwrap();
        let metrics = f.run(&mut session);
        assert_eq!(metrics.blocks_swept, 1);
        assert_eq!(metrics.blocks_emptied, 1);
        assert_eq!(metrics.bytes_freed, 4 * 32);
        assert_eq!(metrics.blocks_pooled, 1);
        assert_eq!(f.heap.stats().block_count, 0);
        assert_eq!(f.heap.stats().empty_block_count, 1);
    }

    #[test]
    fn test_shutdown_cleanup_releases_everything() {
        let mut f = Fixture::new();
        retire_one_block(&mut f.allocator, ObjectKind::Normal);
        retire_one_block(&mut f.allocator, ObjectKind::Leaf);

        let mut session = f.begin(0).unwrap();
        assert_eq!(session.held_block_count(), 2);
        assert_eq!(session.shutdown_cleanup(), 2);
        assert_eq!(session.held_block_count(), 0);
    }

    #[test]
    #[should_panic(expected = "sweep accounting violated")]
    fn test_over_subtraction_panics_when_verifying() {
        let mut f = Fixture::new();
        let mut session = f.begin(0).unwrap();
        session.subtract_sweep_new_object_alloc_bytes(1);
    }

    #[test]
    fn test_over_subtraction_saturates_without_verification() {
        let mut f = Fixture::new();
        f.config.verify_accounting = false;
        let mut session = f.begin(0).unwrap();
        session.subtract_sweep_new_object_alloc_bytes(1);
        assert_eq!(session.next_partial_uncollected_alloc_bytes(), 0);
    }

    #[test]
    fn test_dispose_in_progress_blocks_begin() {
        let mut f = Fixture::new();
        let batch = f.dispose.begin_dispose();
        assert!(matches!(f.begin(0), Err(SweepError::DisposeInProgress)));
        f.dispose.complete_dispose(batch);
        assert!(f.begin(0).is_ok());
    }
}
