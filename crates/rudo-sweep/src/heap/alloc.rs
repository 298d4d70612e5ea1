//! Mutator-side allocation front end.
//!
//! The allocator owns one current block per bucket and size class. Blocks
//! it has finished with are kept in per-kind new-block lists rather than
//! going straight back to the catalog, because the catalog may be in the
//! middle of a sweep (possibly on another thread). The collector merges
//! those lists back at well-defined points of the cycle.

use super::{
    BlockId, BlockList, BucketKind, HeapBlock, HeapBlockMap, HeapInfo, ObjectKind, ObjectRef,
    SizeTier,
};
use crate::config::SweepConfig;
use crate::error::{Result, SweepError};

/// Allocation volume since the last collection, driving the collection
/// heuristics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationCounters {
    /// Bytes reported by retired blocks since the counter was last reset.
    pub uncollected_alloc_bytes: usize,
    /// `uncollected_alloc_bytes` as it was when the last full collection started.
    pub last_uncollected_alloc_bytes: usize,
    /// Pages mapped for new blocks since the counter was last reset.
    pub uncollected_new_page_count: usize,
}

impl AllocationCounters {
    /// A full collection starts: everything allocated so far is about to
    /// be collected.
    pub fn start_full_collection(&mut self) {
        self.last_uncollected_alloc_bytes = self.uncollected_alloc_bytes;
        self.uncollected_alloc_bytes = 0;
    }

    /// Cleared after a partial collect; survivors are added back when
    /// the sweep ends.
    pub fn reset_heuristic_counters(&mut self) {
        self.uncollected_alloc_bytes = 0;
        self.uncollected_new_page_count = 0;
    }

    pub fn reset_partial_heuristic_counters(&mut self) {
        self.uncollected_new_page_count = 0;
    }
}

#[derive(Debug)]
pub struct Allocator {
    current: Vec<Vec<Option<HeapBlock>>>,
    new_blocks: Vec<BlockList>,
    counters: AllocationCounters,
    page_size: usize,
    write_watch: bool,
    block_map: HeapBlockMap,
}

impl Allocator {
    #[must_use]
    pub fn new(config: &SweepConfig, block_map: HeapBlockMap) -> Self {
        Self {
            current: BucketKind::ALL
                .iter()
                .map(|kind| (0..kind.bucket_count()).map(|_| None).collect())
                .collect(),
            new_blocks: BucketKind::ALL.iter().map(|_| BlockList::new()).collect(),
            counters: AllocationCounters::default(),
            page_size: config.page_size,
            write_watch: !config.force_software_write_barrier,
            block_map,
        }
    }

    #[must_use]
    pub const fn counters(&self) -> &AllocationCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut AllocationCounters {
        &mut self.counters
    }

    /// Allocate an object of `size` bytes.
    ///
    /// With `heap` available, partially free catalog blocks and pooled
    /// empty blocks are reused before new pages are mapped. Without it
    /// (the catalog is being swept) only fresh blocks are used.
    ///
    /// # Errors
    ///
    /// [`SweepError::ObjectTooLarge`] when no size class fits and
    /// [`SweepError::BlockAllocation`] when mapping a block fails.
    pub fn alloc(
        &mut self,
        kind: ObjectKind,
        size: usize,
        mut heap: Option<&mut HeapInfo>,
    ) -> Result<ObjectRef> {
        let (tier, class) = SizeTier::for_size(size).ok_or(SweepError::ObjectTooLarge(size))?;
        let bucket = BucketKind::new(kind, tier);

        if let Some(obj) = self.current[bucket.index()][class]
            .as_mut()
            .and_then(HeapBlock::alloc)
        {
            return Ok(obj);
        }

        loop {
            if let Some(full) = self.current[bucket.index()][class].take() {
                self.retire(full);
            }
            let mut block = self.acquire_block(bucket, class, heap.as_deref_mut())?;
            let obj = block.alloc();
            self.current[bucket.index()][class] = Some(block);
            if let Some(obj) = obj {
                return Ok(obj);
            }
        }
    }

    fn acquire_block(
        &mut self,
        bucket: BucketKind,
        class: usize,
        heap: Option<&mut HeapInfo>,
    ) -> Result<HeapBlock> {
        if let Some(heap) = heap {
            if let Some(block) = heap.take_allocable(bucket, class) {
                return Ok(block);
            }
            if let Some(block) = heap.take_empty(bucket, class) {
                self.counters.uncollected_new_page_count += block.page_count(self.page_size);
                return Ok(block);
            }
        }
        let block = HeapBlock::new(bucket, class, self.page_size, self.write_watch)?;
        self.block_map.register(&block);
        self.counters.uncollected_new_page_count += block.page_count(self.page_size);
        Ok(block)
    }

    /// A block the allocator is done with: its bytes are reported and it
    /// waits in the new-block list for the next merge.
    fn retire(&mut self, mut block: HeapBlock) {
        self.counters.uncollected_alloc_bytes += block.take_unaccounted_alloc_bytes();
        self.new_blocks[block.bucket().index()].push(block);
    }

    /// Take the new-block list of `kind`, leaving it empty.
    pub fn take_new_blocks(&mut self, kind: BucketKind) -> BlockList {
        self.new_blocks[kind.index()].take()
    }

    /// Take every new-block list.
    pub fn take_all_new_blocks(&mut self) -> BlockList {
        let mut all = BlockList::new();
        for list in &mut self.new_blocks {
            all.append(list);
        }
        all
    }

    /// Hand back every current block, unaccounted bytes included, so the
    /// next sweep sees them.
    pub fn take_current_blocks(&mut self) -> BlockList {
        let mut all = BlockList::new();
        for block in self.current.iter_mut().flatten().filter_map(Option::take) {
            all.push(block);
        }
        all
    }

    #[must_use]
    pub fn new_block_count(&self) -> usize {
        self.new_blocks.iter().map(BlockList::len).sum()
    }

    /// Whether `id` is a current or new block of this allocator.
    #[must_use]
    pub fn owns(&self, id: BlockId) -> bool {
        self.current.iter().flatten().flatten().any(|b| b.id() == id)
            || self.new_blocks.iter().any(|list| list.contains(id))
    }

    /// Drop every block. Returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let current = self.take_current_blocks().len();
        current + self.take_all_new_blocks().len()
    }
}
