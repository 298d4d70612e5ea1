//! Fixed-size heap blocks.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sys_alloc::{Mmap, MmapOptions};

use super::bitmap::{MarkBitmap, SlotBits};
use super::BucketKind;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a heap block. Never reused, including for blocks recycled
/// through the empty pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    fn next() -> Self {
        Self(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Handle to an allocated object slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    block: BlockId,
    slot: usize,
    addr: usize,
}

impl ObjectRef {
    #[must_use]
    pub const fn block(&self) -> BlockId {
        self.block
    }

    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Address of the first byte of the object.
    #[must_use]
    pub const fn addr(&self) -> usize {
        self.addr
    }
}

/// Result of inspecting a block against its mark bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockAnalysis {
    /// Allocated slots that are marked.
    pub live_count: usize,
    /// Allocated slots that are not marked.
    pub dead_count: usize,
    /// Bytes held by dead slots.
    pub dead_bytes: usize,
    /// Dead bytes that were allocated since the block's previous analysis.
    pub dead_new_bytes: usize,
    /// Bytes in slots that were already free.
    pub free_bytes: usize,
}

impl BlockAnalysis {
    /// No live objects remain.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Free bytes the block will have once its dead objects are swept.
    #[must_use]
    pub const fn expected_free_bytes(&self) -> usize {
        self.dead_bytes + self.free_bytes
    }
}

/// A page-aligned run of equal-sized object slots.
pub struct HeapBlock {
    id: BlockId,
    bucket: BucketKind,
    size_class: usize,
    object_size: usize,
    slot_count: usize,
    mmap: Mmap,
    marks: Arc<MarkBitmap>,
    allocated: SlotBits,
    new_objects: SlotBits,
    pending_dispose: SlotBits,
    free_hint: usize,
    unaccounted_alloc_bytes: usize,
    last_uncollected_alloc_bytes: usize,
    expected_free_bytes: usize,
}

impl HeapBlock {
    /// Map a fresh block for `bucket` serving size class `size_class`.
    pub fn new(
        bucket: BucketKind,
        size_class: usize,
        page_size: usize,
        write_watch: bool,
    ) -> io::Result<Self> {
        let len = page_size * bucket.tier.pages_per_block();
        let mmap = MmapOptions::new()
            .len(len)
            .write_watch(write_watch)
            .map_anon()?;
        let object_size = bucket.tier.size_classes()[size_class];
        let slot_count = (len / object_size).max(1);
        Ok(Self {
            id: BlockId::next(),
            bucket,
            size_class,
            object_size,
            slot_count,
            mmap,
            marks: Arc::new(MarkBitmap::new(slot_count)),
            allocated: SlotBits::new(slot_count),
            new_objects: SlotBits::new(slot_count),
            pending_dispose: SlotBits::new(slot_count),
            free_hint: 0,
            unaccounted_alloc_bytes: 0,
            last_uncollected_alloc_bytes: 0,
            expected_free_bytes: 0,
        })
    }

    /// Re-layout an empty block for another bucket of the same tier.
    ///
    /// The block gets a new identity and a new mark bitmap, so it must be
    /// registered with the block map again.
    pub fn reinit(&mut self, bucket: BucketKind, size_class: usize) {
        debug_assert_eq!(self.allocated.count(), 0, "reinit of a non-empty block");
        debug_assert_eq!(self.bucket.tier, bucket.tier);
        self.id = BlockId::next();
        self.bucket = bucket;
        self.size_class = size_class;
        self.object_size = bucket.tier.size_classes()[size_class];
        self.slot_count = (self.mmap.len() / self.object_size).max(1);
        self.marks = Arc::new(MarkBitmap::new(self.slot_count));
        self.allocated = SlotBits::new(self.slot_count);
        self.new_objects = SlotBits::new(self.slot_count);
        self.pending_dispose = SlotBits::new(self.slot_count);
        self.free_hint = 0;
        self.unaccounted_alloc_bytes = 0;
        self.last_uncollected_alloc_bytes = 0;
        self.expected_free_bytes = 0;
    }

    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub const fn bucket(&self) -> BucketKind {
        self.bucket
    }

    #[must_use]
    pub const fn size_class(&self) -> usize {
        self.size_class
    }

    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    #[must_use]
    pub const fn slot_count(&self) -> usize {
        self.slot_count
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.mmap.ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    #[must_use]
    pub fn page_count(&self, page_size: usize) -> usize {
        self.mmap.len() / page_size
    }

    pub(crate) fn marks(&self) -> Arc<MarkBitmap> {
        Arc::clone(&self.marks)
    }

    #[must_use]
    pub const fn allocated_count(&self) -> usize {
        self.allocated.count()
    }

    #[must_use]
    pub const fn free_slot_count(&self) -> usize {
        self.slot_count - self.allocated.count()
    }

    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free_slot_count() * self.object_size
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.allocated.count() == self.slot_count
    }

    /// No slot holds an object, including objects awaiting dispose.
    #[must_use]
    pub const fn has_no_objects(&self) -> bool {
        self.allocated.count() == 0
    }

    #[must_use]
    pub const fn has_pending_dispose(&self) -> bool {
        self.pending_dispose.count() > 0
    }

    #[must_use]
    pub const fn unaccounted_alloc_bytes(&self) -> usize {
        self.unaccounted_alloc_bytes
    }

    #[must_use]
    pub const fn expected_free_bytes(&self) -> usize {
        self.expected_free_bytes
    }

    #[must_use]
    pub fn has_write_watch(&self) -> bool {
        self.mmap.has_write_watch()
    }

    /// Slot index of `addr` if it lies inside this block.
    #[must_use]
    pub fn slot_of(&self, addr: usize) -> Option<usize> {
        let base = self.base();
        if addr < base || addr >= base + self.slot_count * self.object_size {
            return None;
        }
        Some((addr - base) / self.object_size)
    }

    fn object_ref(&self, slot: usize) -> ObjectRef {
        ObjectRef {
            block: self.id,
            slot,
            addr: self.base() + slot * self.object_size,
        }
    }

    /// Take a free slot. New objects are counted as unaccounted bytes
    /// until the allocator or the sweep picks them up.
    pub fn alloc(&mut self) -> Option<ObjectRef> {
        if self.is_full() {
            return None;
        }
        let slot = (self.free_hint..self.slot_count)
            .chain(0..self.free_hint)
            .find(|&slot| !self.allocated.get(slot))?;
        self.allocated.set(slot);
        self.new_objects.set(slot);
        self.unaccounted_alloc_bytes += self.object_size;
        self.free_hint = slot + 1;
        Some(self.object_ref(slot))
    }

    #[must_use]
    pub fn is_allocated(&self, slot: usize) -> bool {
        slot < self.slot_count && self.allocated.get(slot)
    }

    pub fn mark(&self, slot: usize) -> bool {
        slot < self.slot_count && self.allocated.get(slot) && self.marks.mark(slot)
    }

    #[must_use]
    pub fn is_marked(&self, slot: usize) -> bool {
        self.marks.is_marked(slot)
    }

    pub fn clear_marks(&self) {
        self.marks.clear();
    }

    /// Drain the unaccounted allocation bytes.
    pub fn take_unaccounted_alloc_bytes(&mut self) -> usize {
        let bytes = std::mem::take(&mut self.unaccounted_alloc_bytes);
        self.last_uncollected_alloc_bytes += bytes;
        bytes
    }

    /// Classify every occupied slot as live or dead and close the block's
    /// new-object accounting window.
    ///
    /// # Panics
    ///
    /// With `verify` set, panics if the new-object bits disagree with the
    /// bytes the block has reported to the allocator.
    pub fn analyze(&mut self, verify: bool) -> BlockAnalysis {
        if verify {
            let new_bytes = self.new_objects.count() * self.object_size;
            let reported = self.last_uncollected_alloc_bytes + self.unaccounted_alloc_bytes;
            assert_eq!(
                new_bytes, reported,
                "block {:?}: {new_bytes} new-object bytes but {reported} reported",
                self.id
            );
        }

        let mut analysis = BlockAnalysis {
            free_bytes: self.free_bytes(),
            ..BlockAnalysis::default()
        };
        for slot in self.allocated.iter_set() {
            if self.pending_dispose.get(slot) {
                continue;
            }
            if self.marks.is_marked(slot) {
                analysis.live_count += 1;
            } else {
                analysis.dead_count += 1;
                analysis.dead_bytes += self.object_size;
                if self.new_objects.get(slot) {
                    analysis.dead_new_bytes += self.object_size;
                }
            }
        }

        self.new_objects.clear();
        self.last_uncollected_alloc_bytes = 0;
        self.expected_free_bytes = analysis.expected_free_bytes();
        analysis
    }

    fn dead_slots(&self) -> Vec<usize> {
        self.allocated
            .iter_set()
            .filter(|&slot| !self.pending_dispose.get(slot) && !self.marks.is_marked(slot))
            .collect()
    }

    fn free_slot(&mut self, slot: usize) {
        // SAFETY: `slot < slot_count`, so the object lies inside the mapping.
        unsafe {
            ptr::write_bytes(
                self.mmap.ptr().add(slot * self.object_size),
                0,
                self.object_size,
            );
        }
        self.allocated.unset(slot);
        self.new_objects.unset(slot);
        if slot < self.free_hint {
            self.free_hint = slot;
        }
    }

    /// Free every unmarked object. Returns the bytes reclaimed.
    pub fn sweep(&mut self) -> usize {
        let dead = self.dead_slots();
        for &slot in &dead {
            self.free_slot(slot);
        }
        self.expected_free_bytes = self.free_bytes();
        dead.len() * self.object_size
    }

    /// Move every unmarked object to the pending-dispose state, handing
    /// each one to `on_dead`. The slots stay occupied until
    /// [`HeapBlock::release_disposed`].
    pub fn finalize_dead(&mut self, mut on_dead: impl FnMut(ObjectRef)) -> usize {
        let dead = self.dead_slots();
        for &slot in &dead {
            self.pending_dispose.set(slot);
            on_dead(self.object_ref(slot));
        }
        dead.len()
    }

    /// Free every object whose dispose has run. Returns the bytes reclaimed.
    pub fn release_disposed(&mut self) -> usize {
        let slots: Vec<usize> = self.pending_dispose.iter_set().collect();
        for &slot in &slots {
            self.free_slot(slot);
        }
        self.pending_dispose.clear();
        slots.len() * self.object_size
    }

    /// Drop every allocation counter, used when the block is emptied.
    pub fn clear_all_alloc_bytes(&mut self) {
        self.unaccounted_alloc_bytes = 0;
        self.last_uncollected_alloc_bytes = 0;
    }

    /// Let the OS reclaim the block's pages while keeping them mapped.
    pub fn discard(&self) -> io::Result<()> {
        self.mmap.discard()
    }

    pub fn reset_write_watch(&self) -> io::Result<()> {
        self.mmap.reset_write_watch()
    }
}

impl std::fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBlock")
            .field("id", &self.id)
            .field("bucket", &self.bucket)
            .field("object_size", &self.object_size)
            .field("slot_count", &self.slot_count)
            .field("allocated", &self.allocated.count())
            .field("pending_dispose", &self.pending_dispose.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ObjectKind, SizeTier};

    const PAGE: usize = 4096;

    fn block(kind: ObjectKind) -> HeapBlock {
        HeapBlock::new(BucketKind::new(kind, SizeTier::Small), 2, PAGE, false).unwrap()
    }

    #[test]
    fn test_alloc_until_full() {
        let mut b = block(ObjectKind::Normal);
        assert_eq!(b.object_size(), 64);
        assert_eq!(b.slot_count(), PAGE / 64);
        for _ in 0..b.slot_count() {
            assert!(b.alloc().is_some());
        }
        assert!(b.is_full());
        assert!(b.alloc().is_none());
        assert_eq!(b.unaccounted_alloc_bytes(), PAGE);
    }

    #[test]
    fn test_analyze_and_sweep() {
        let mut b = block(ObjectKind::Normal);
        let objs: Vec<_> = (0..10).map(|_| b.alloc().unwrap()).collect();
        for obj in objs.iter().step_by(2) {
            assert!(b.mark(obj.slot()));
        }
        b.take_unaccounted_alloc_bytes();
        let analysis = b.analyze(true);
        assert_eq!(analysis.live_count, 5);
        assert_eq!(analysis.dead_count, 5);
        assert_eq!(analysis.dead_new_bytes, 5 * 64);
        assert_eq!(b.expected_free_bytes(), PAGE - 5 * 64);

        assert_eq!(b.sweep(), 5 * 64);
        assert_eq!(b.allocated_count(), 5);
        assert!(!b.is_allocated(objs[1].slot()));
    }

    #[test]
    fn test_swept_slot_is_zeroed_and_reused() {
        let mut b = block(ObjectKind::Leaf);
        let obj = b.alloc().unwrap();
        unsafe { ptr::write_bytes(obj.addr() as *mut u8, 0xAB, 64) };
        b.take_unaccounted_alloc_bytes();
        b.analyze(true);
        b.sweep();
        assert_eq!(unsafe { *(obj.addr() as *const u8) }, 0);
        assert_eq!(b.alloc().unwrap().slot(), obj.slot());
    }

    #[test]
    fn test_finalize_then_release() {
        let mut b = block(ObjectKind::Finalizable);
        let keep = b.alloc().unwrap();
        let _dead = b.alloc().unwrap();
        b.mark(keep.slot());
        b.take_unaccounted_alloc_bytes();
        b.analyze(true);

        let mut finalized = Vec::new();
        assert_eq!(b.finalize_dead(|obj| finalized.push(obj)), 1);
        assert!(b.has_pending_dispose());
        assert_eq!(b.allocated_count(), 2);

        // Objects awaiting dispose are neither live nor dead.
        let again = b.analyze(true);
        assert_eq!(again.dead_count, 0);

        assert_eq!(b.release_disposed(), 64);
        assert_eq!(b.allocated_count(), 1);
        assert!(!b.has_pending_dispose());
    }

    #[test]
    #[should_panic(expected = "new-object bytes")]
    fn test_analyze_verifies_reported_bytes() {
        let mut b = block(ObjectKind::Normal);
        b.alloc();
        b.alloc();
        b.clear_all_alloc_bytes();
        b.analyze(true);
    }

    #[test]
    fn test_slot_of() {
        let b = block(ObjectKind::Normal);
        assert_eq!(b.slot_of(b.base()), Some(0));
        assert_eq!(b.slot_of(b.base() + 65), Some(1));
        assert_eq!(b.slot_of(b.base() + PAGE), None);
        assert_eq!(b.slot_of(b.base().wrapping_sub(1)), None);
    }

    #[test]
    fn test_reinit_changes_identity() {
        let mut b = block(ObjectKind::Normal);
        let id = b.id();
        b.reinit(BucketKind::new(ObjectKind::Leaf, SizeTier::Small), 0);
        assert_ne!(b.id(), id);
        assert_eq!(b.object_size(), 16);
        assert_eq!(b.slot_count(), PAGE / 16);
    }
}
