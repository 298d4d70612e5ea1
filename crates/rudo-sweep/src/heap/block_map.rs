//! Address → block lookup used by the mark phase.
//!
//! The map only holds what marking needs (base, extent, object size and
//! the shared mark bitmap), so it keeps working while the blocks
//! themselves are owned by the background sweeper.
//!
//! # Lock Ordering
//!
//! `entries` is taken before `pending_removal` when both are held.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{BlockId, HeapBlock, MarkBitmap};

#[derive(Debug, Clone)]
struct BlockEntry {
    id: BlockId,
    len: usize,
    object_size: usize,
    marks: Arc<MarkBitmap>,
}

#[derive(Debug, Default)]
struct MapInner {
    entries: RwLock<BTreeMap<usize, BlockEntry>>,
    pending_removal: Mutex<Vec<(usize, BlockId)>>,
}

/// Shared page → block map.
#[derive(Debug, Clone, Default)]
pub struct HeapBlockMap {
    inner: Arc<MapInner>,
}

impl HeapBlockMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `block` reachable by address.
    pub fn register(&self, block: &HeapBlock) {
        self.inner.entries.write().insert(
            block.base(),
            BlockEntry {
                id: block.id(),
                len: block.slot_count() * block.object_size(),
                object_size: block.object_size(),
                marks: block.marks(),
            },
        );
    }

    /// Schedule `block` for removal at the next [`HeapBlockMap::cleanup`].
    pub fn unregister(&self, block: &HeapBlock) {
        self.inner.pending_removal.lock().push((block.base(), block.id()));
    }

    /// Drop the entries of every unregistered block. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut entries = self.inner.entries.write();
        let mut pending = self.inner.pending_removal.lock();
        let before = entries.len();
        for (base, id) in pending.drain(..) {
            // The address may already belong to a block mapped since.
            if entries.get(&base).is_some_and(|entry| entry.id == id) {
                entries.remove(&base);
            }
        }
        before - entries.len()
    }

    /// Block containing `addr`, if any.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<(BlockId, usize)> {
        let entries = self.inner.entries.read();
        let (&base, entry) = entries.range(..=addr).next_back()?;
        (addr < base + entry.len).then(|| (entry.id, (addr - base) / entry.object_size))
    }

    /// Mark the object containing `addr`. Returns `false` for addresses
    /// outside every registered block.
    pub fn mark(&self, addr: usize) -> bool {
        let entries = self.inner.entries.read();
        let Some((&base, entry)) = entries.range(..=addr).next_back() else {
            return false;
        };
        if addr >= base + entry.len {
            return false;
        }
        entry.marks.mark((addr - base) / entry.object_size);
        true
    }

    /// Drop every entry, registered or pending. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.inner.entries.write();
        self.inner.pending_removal.lock().clear();
        let removed = entries.len();
        entries.clear();
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }
}
