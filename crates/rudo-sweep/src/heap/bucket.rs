//! A single size class of one bucket kind.

use super::{BlockId, BlockList, BucketKind, DisposeQueues, HeapBlock, ObjectRef};
use crate::sweep::{PartialCollectState, SweepSession};

/// Blocks of one {kind, tier, size class}.
///
/// Outside a sweep every block of the bucket sits in exactly one of the
/// four lists. During a sweep the session may hold some of them in its
/// pending lists; they come back through [`HeapBucket::merge`].
#[derive(Debug)]
pub struct HeapBucket {
    kind: BucketKind,
    size_class: usize,
    /// Blocks with at least one free slot.
    alloc_blocks: BlockList,
    full_blocks: BlockList,
    /// Blocks left unswept by partial-mode page reuse.
    partial_blocks: BlockList,
    /// Finalizable blocks holding objects that wait for dispose.
    pending_dispose_blocks: BlockList,
}

impl HeapBucket {
    pub(crate) const fn new(kind: BucketKind, size_class: usize) -> Self {
        Self {
            kind,
            size_class,
            alloc_blocks: BlockList::new(),
            full_blocks: BlockList::new(),
            partial_blocks: BlockList::new(),
            pending_dispose_blocks: BlockList::new(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> BucketKind {
        self.kind
    }

    #[must_use]
    pub const fn size_class(&self) -> usize {
        self.size_class
    }

    #[must_use]
    pub fn object_size(&self) -> usize {
        self.kind.tier.size_classes()[self.size_class]
    }

    /// File `block` under the list matching its state.
    pub fn merge(&mut self, block: HeapBlock) {
        debug_assert_eq!(block.bucket(), self.kind);
        debug_assert_eq!(block.size_class(), self.size_class);
        if block.has_pending_dispose() {
            self.pending_dispose_blocks.push(block);
        } else if block.is_full() {
            self.full_blocks.push(block);
        } else {
            self.alloc_blocks.push(block);
        }
    }

    /// Hand a block with free slots to the allocator.
    pub fn take_allocable(&mut self) -> Option<HeapBlock> {
        self.alloc_blocks.pop_front()
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.alloc_blocks.len()
            + self.full_blocks.len()
            + self.partial_blocks.len()
            + self.pending_dispose_blocks.len()
    }

    #[must_use]
    pub fn partial_block_count(&self) -> usize {
        self.partial_blocks.len()
    }

    #[must_use]
    pub fn pending_dispose_block_count(&self) -> usize {
        self.pending_dispose_blocks.len()
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks().any(|b| b.id() == id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &HeapBlock> {
        self.alloc_blocks
            .iter()
            .chain(self.full_blocks.iter())
            .chain(self.partial_blocks.iter())
            .chain(self.pending_dispose_blocks.iter())
    }

    /// Sweep every block the bucket holds, routing each by what the
    /// analysis found.
    pub(crate) fn sweep(
        &mut self,
        session: &mut SweepSession,
        partial: &mut PartialCollectState,
        dispose: &DisposeQueues,
    ) {
        let mut blocks = self.alloc_blocks.take();
        blocks.append(&mut self.full_blocks);
        blocks.append(&mut self.partial_blocks);

        for mut block in blocks {
            session.visit(&block);
            session.add_unaccounted_new_object_alloc_bytes(&mut block, partial);
            let analysis = block.analyze(session.verify_accounting());
            if session.in_partial_collect_mode() {
                session.subtract_sweep_new_object_alloc_bytes(analysis.dead_new_bytes);
            }

            if analysis.dead_count == 0 {
                if block.has_no_objects() {
                    session.defer_empty(block);
                } else {
                    self.merge(block);
                }
            } else if self.kind.kind.is_finalizable() {
                let finalized = block.finalize_dead(|obj: ObjectRef| dispose.push_pending(obj));
                session.record_finalized(finalized);
                self.merge(block);
            } else if analysis.is_empty() {
                let freed = block.sweep();
                session.record_swept(freed);
                session.defer_empty(block);
            } else if self.kind.kind.is_leaf() || !session.in_partial_collect_mode() {
                if session.in_partial_collect_mode() {
                    session.notify_allocable_objects(&block);
                }
                let freed = block.sweep();
                session.record_swept(freed);
                self.merge(block);
            } else {
                session.notify_allocable_objects(&block);
                session.defer_sweep(block);
            }
        }
    }

    /// Decide, for each deferred block, whether its pages are worth reusing
    /// now. Returns the free bytes left stranded in blocks set aside.
    pub(crate) fn sweep_partial_reuse_pages(
        &mut self,
        pending: BlockList,
        reuse_min_free_bytes: usize,
        session: &mut SweepSession,
    ) -> usize {
        let mut unused = 0;
        for mut block in pending {
            let expected = block.expected_free_bytes();
            if expected >= reuse_min_free_bytes {
                let freed = block.sweep();
                session.record_swept(freed);
                session.record_reused();
                self.merge(block);
            } else {
                unused += expected;
                self.partial_blocks.push(block);
            }
        }
        unused
    }

    /// Sweep every block left aside by partial collection. Returns the bytes freed.
    pub(crate) fn finish_partial_collect(&mut self) -> usize {
        let mut freed = 0;
        for mut block in self.partial_blocks.take() {
            freed += block.sweep();
            self.merge(block);
        }
        freed
    }

    /// Reclaim the slots of disposed objects in block `id`.
    pub(crate) fn transfer_disposed(&mut self, id: BlockId) -> Option<usize> {
        let mut block = self.pending_dispose_blocks.remove_first(|b| b.id() == id)?;
        let freed = block.release_disposed();
        self.merge(block);
        Some(freed)
    }

    pub(crate) fn clear_marks(&self) {
        for block in self.blocks() {
            block.clear_marks();
        }
    }

    /// Drop every block. Returns how many were released.
    pub(crate) fn release_all(&mut self) -> usize {
        let count = self.block_count();
        self.alloc_blocks = BlockList::new();
        self.full_blocks = BlockList::new();
        self.partial_blocks = BlockList::new();
        self.pending_dispose_blocks = BlockList::new();
        count
    }
}
