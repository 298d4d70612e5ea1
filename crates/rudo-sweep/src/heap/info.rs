//! The heap block catalog: every bucket of every kind plus the pool of
//! empty blocks kept mapped for reuse.

use std::collections::HashSet;
use std::io;

use super::{
    BlockId, BlockList, BucketKind, DisposeQueues, HeapBlock, HeapBlockMap, HeapBucket, SizeTier,
};
use crate::config::SweepConfig;
use crate::sweep::{PartialCollectState, SweepSession};

/// Point-in-time counts over the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Blocks filed in buckets.
    pub block_count: usize,
    /// Blocks set aside by partial collection.
    pub partial_block_count: usize,
    /// Blocks waiting for finalized objects to be disposed.
    pub pending_dispose_block_count: usize,
    /// Blocks in the empty pool.
    pub empty_block_count: usize,
    /// Bytes in allocated slots.
    pub allocated_bytes: usize,
    /// Bytes in free slots.
    pub free_bytes: usize,
    /// Free bytes stranded in set-aside blocks.
    pub unused_partial_collect_free_bytes: usize,
}

#[derive(Debug)]
pub struct HeapInfo {
    buckets: Vec<Vec<HeapBucket>>,
    empty_blocks: Vec<BlockList>,
    block_map: HeapBlockMap,
    unused_partial_collect_free_bytes: usize,
    max_empty_blocks: usize,
}

const fn tier_index(tier: SizeTier) -> usize {
    match tier {
        SizeTier::Small => 0,
        SizeTier::Medium => 1,
    }
}

impl HeapInfo {
    #[must_use]
    pub fn new(config: &SweepConfig, block_map: HeapBlockMap) -> Self {
        let buckets = BucketKind::ALL
            .iter()
            .map(|&kind| {
                (0..kind.bucket_count())
                    .map(|class| HeapBucket::new(kind, class))
                    .collect()
            })
            .collect();
        Self {
            buckets,
            empty_blocks: SizeTier::ALL.iter().map(|_| BlockList::new()).collect(),
            block_map,
            unused_partial_collect_free_bytes: 0,
            max_empty_blocks: config.max_empty_blocks,
        }
    }

    #[must_use]
    pub fn bucket(&self, kind: BucketKind, size_class: usize) -> &HeapBucket {
        &self.buckets[kind.index()][size_class]
    }

    pub(crate) fn bucket_mut(&mut self, kind: BucketKind, size_class: usize) -> &mut HeapBucket {
        &mut self.buckets[kind.index()][size_class]
    }

    fn all_buckets(&self) -> impl Iterator<Item = &HeapBucket> {
        self.buckets.iter().flatten()
    }

    #[must_use]
    pub const fn unused_partial_collect_free_bytes(&self) -> usize {
        self.unused_partial_collect_free_bytes
    }

    #[must_use]
    pub const fn block_map(&self) -> &HeapBlockMap {
        &self.block_map
    }

    /// File a block back into its bucket.
    pub fn merge(&mut self, block: HeapBlock) {
        let (kind, class) = (block.bucket(), block.size_class());
        self.bucket_mut(kind, class).merge(block);
    }

    pub fn merge_all(&mut self, blocks: BlockList) -> usize {
        let mut count = 0;
        for block in blocks {
            self.merge(block);
            count += 1;
        }
        count
    }

    /// A block of the bucket with free slots, if any.
    pub fn take_allocable(&mut self, kind: BucketKind, size_class: usize) -> Option<HeapBlock> {
        self.bucket_mut(kind, size_class).take_allocable()
    }

    /// A pooled empty block re-laid out for `kind`/`size_class` and
    /// registered with the block map.
    pub fn take_empty(&mut self, kind: BucketKind, size_class: usize) -> Option<HeapBlock> {
        let mut block = self.empty_blocks[tier_index(kind.tier)].pop_front()?;
        block.reinit(kind, size_class);
        self.block_map.register(&block);
        Some(block)
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.all_buckets().any(|bucket| bucket.contains(id))
    }

    /// Ids of every block filed in a bucket.
    #[must_use]
    pub fn block_ids(&self) -> HashSet<BlockId> {
        self.all_buckets()
            .flat_map(HeapBucket::blocks)
            .map(HeapBlock::id)
            .collect()
    }

    /// Clear every mark bitmap before a new mark phase.
    pub fn clear_marks(&self) {
        for bucket in self.all_buckets() {
            bucket.clear_marks();
        }
    }

    fn sweep_kinds(
        &mut self,
        session: &mut SweepSession,
        partial: &mut PartialCollectState,
        dispose: &DisposeQueues,
        select: impl Fn(BucketKind) -> bool,
    ) {
        for kind in BucketKind::ALL.into_iter().filter(|&kind| select(kind)) {
            for bucket in &mut self.buckets[kind.index()] {
                bucket.sweep(session, partial, dispose);
            }
        }
    }

    /// First pass over the kinds that may be swept off the mutator thread.
    pub(crate) fn sweep_small_non_finalizable(
        &mut self,
        session: &mut SweepSession,
        partial: &mut PartialCollectState,
        dispose: &DisposeQueues,
    ) {
        self.sweep_kinds(session, partial, dispose, BucketKind::is_small_non_finalizable);
    }

    /// Finalizable and medium buckets, always swept on the mutator thread.
    pub(crate) fn sweep_foreground(
        &mut self,
        session: &mut SweepSession,
        partial: &mut PartialCollectState,
        dispose: &DisposeQueues,
    ) {
        self.sweep_kinds(session, partial, dispose, |kind| {
            !kind.is_small_non_finalizable()
        });
    }

    /// Reuse deferred blocks that free enough per page and set the rest
    /// aside. The bytes left in set-aside blocks become the heap's unused
    /// partial-collect free bytes.
    pub(crate) fn sweep_partial_reuse_pages(&mut self, session: &mut SweepSession) {
        let reuse_min = session.reuse_min_free_bytes();
        for kind in BucketKind::ALL {
            for class in 0..kind.bucket_count() {
                let pending = session.take_pending_sweep(kind, class);
                if pending.is_empty() {
                    continue;
                }
                let unused =
                    self.bucket_mut(kind, class)
                        .sweep_partial_reuse_pages(pending, reuse_min, session);
                session.add_unused_free_byte_count(unused);
            }
        }
        self.unused_partial_collect_free_bytes = session.partial_unused_free_byte_count();
    }

    /// Sweep whatever the session still holds deferred.
    pub(crate) fn sweep_pending_objects(&mut self, session: &mut SweepSession) {
        if !session.has_pending_sweep_blocks() {
            return;
        }
        for kind in BucketKind::ALL {
            for class in 0..kind.bucket_count() {
                for mut block in session.take_pending_sweep(kind, class) {
                    let freed = block.sweep();
                    session.record_swept(freed);
                    self.merge(block);
                }
            }
        }
    }

    /// Sweep every partial block back into normal allocation.
    pub(crate) fn finish_partial_collect(&mut self) -> usize {
        self.unused_partial_collect_free_bytes = 0;
        self.buckets
            .iter_mut()
            .flatten()
            .map(HeapBucket::finish_partial_collect)
            .sum()
    }

    /// Forget partial-collect bookkeeping without touching the blocks.
    pub(crate) fn reset_partial_collect(&mut self) {
        self.unused_partial_collect_free_bytes = 0;
    }

    /// Return the slots of disposed objects to their blocks. Returns the
    /// bytes reclaimed.
    pub(crate) fn transfer_disposed_objects(&mut self, dispose: &DisposeQueues) -> usize {
        let blocks: HashSet<BlockId> = dispose
            .take_disposed()
            .into_iter()
            .map(|obj| obj.block())
            .collect();
        let mut freed = 0;
        for id in blocks {
            freed += self
                .buckets
                .iter_mut()
                .flatten()
                .filter(|bucket| bucket.kind().kind.is_finalizable())
                .find_map(|bucket| bucket.transfer_disposed(id))
                .unwrap_or(0);
        }
        freed
    }

    /// Reset hardware write watch over every block mapped with it.
    pub(crate) fn reset_write_watch(&self) -> io::Result<usize> {
        let mut count = 0;
        for block in self.all_buckets().flat_map(HeapBucket::blocks) {
            if block.has_write_watch() {
                block.reset_write_watch()?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Move empty blocks to the pool, unmapping those beyond its limit.
    /// Returns `(pooled, unmapped)`.
    pub(crate) fn release_empty_blocks(&mut self, blocks: BlockList) -> (usize, usize) {
        let (mut pooled, mut unmapped) = (0, 0);
        for mut block in blocks {
            self.block_map.unregister(&block);
            block.clear_all_alloc_bytes();
            block.clear_marks();
            let pool = &mut self.empty_blocks[tier_index(block.bucket().tier)];
            if pool.len() < self.max_empty_blocks && block.discard().is_ok() {
                pool.push(block);
                pooled += 1;
            } else {
                #[cfg(feature = "tracing")]
                tracing::trace!(block = block.id().as_u64(), "unmapping empty block");
                unmapped += 1;
            }
        }
        (pooled, unmapped)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            empty_block_count: self.empty_blocks.iter().map(BlockList::len).sum(),
            unused_partial_collect_free_bytes: self.unused_partial_collect_free_bytes,
            ..HeapStats::default()
        };
        for bucket in self.all_buckets() {
            stats.block_count += bucket.block_count();
            stats.partial_block_count += bucket.partial_block_count();
            stats.pending_dispose_block_count += bucket.pending_dispose_block_count();
            for block in bucket.blocks() {
                stats.allocated_bytes += block.allocated_count() * block.object_size();
                stats.free_bytes += block.free_bytes();
            }
        }
        stats
    }

    /// Drop every block, pooled ones included. Returns how many were released.
    pub(crate) fn release_all(&mut self) -> usize {
        let mut count = 0;
        for bucket in self.buckets.iter_mut().flatten() {
            count += bucket.release_all();
        }
        for pool in &mut self.empty_blocks {
            count += pool.take().len();
        }
        self.unused_partial_collect_free_bytes = 0;
        count
    }
}
