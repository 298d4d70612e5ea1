//! Finalized-object queues.
//!
//! Sweeping a finalizable block pushes its dead objects onto `pending`.
//! The embedder drains them in a [`DisposeBatch`], runs their cleanup, and
//! hands the batch back; the slots are then queued on `disposed` until
//! the heap is available to take them back.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;

use super::ObjectRef;

#[derive(Debug, Default)]
pub struct DisposeQueues {
    pending: SegQueue<ObjectRef>,
    disposed: SegQueue<ObjectRef>,
    in_progress: AtomicBool,
}

/// Objects handed out for disposal.
#[derive(Debug)]
#[must_use = "a dispose batch must be completed before the next sweep can begin"]
pub struct DisposeBatch {
    objects: Vec<ObjectRef>,
}

impl DisposeBatch {
    #[must_use]
    pub fn objects(&self) -> &[ObjectRef] {
        &self.objects
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl DisposeQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a finalized object for disposal.
    pub fn push_pending(&self, obj: ObjectRef) {
        self.pending.push(obj);
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn disposed_len(&self) -> usize {
        self.disposed.len()
    }

    #[must_use]
    pub fn is_dispose_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Drain every pending object into a batch and mark dispose as running.
    pub fn begin_dispose(&self) -> DisposeBatch {
        self.in_progress.store(true, Ordering::Release);
        let mut objects = Vec::with_capacity(self.pending.len());
        while let Some(obj) = self.pending.pop() {
            objects.push(obj);
        }
        DisposeBatch { objects }
    }

    /// Record that every object of `batch` has been disposed.
    pub fn complete_dispose(&self, batch: DisposeBatch) {
        for obj in batch.objects {
            self.disposed.push(obj);
        }
        self.in_progress.store(false, Ordering::Release);
    }

    /// Drain the disposed objects whose slots can be reclaimed.
    pub fn take_disposed(&self) -> Vec<ObjectRef> {
        let mut objects = Vec::with_capacity(self.disposed.len());
        while let Some(obj) = self.disposed.pop() {
            objects.push(obj);
        }
        objects
    }

    /// Forget everything queued. Used at teardown, when the blocks are
    /// being released anyway.
    pub fn clear(&self) {
        while self.pending.pop().is_some() {}
        while self.disposed.pop().is_some() {}
        self.in_progress.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{BucketKind, HeapBlock, ObjectKind, SizeTier};

    #[test]
    fn test_batch_lifecycle() {
        let mut block = HeapBlock::new(
            BucketKind::new(ObjectKind::Finalizable, SizeTier::Small),
            0,
            4096,
            false,
        )
        .unwrap();
        let queues = DisposeQueues::new();
        queues.push_pending(block.alloc().unwrap());
        queues.push_pending(block.alloc().unwrap());

        let batch = queues.begin_dispose();
        assert!(queues.is_dispose_in_progress());
        assert_eq!(batch.len(), 2);
        assert_eq!(queues.pending_len(), 0);

        queues.complete_dispose(batch);
        assert!(!queues.is_dispose_in_progress());
        assert_eq!(queues.take_disposed().len(), 2);
        assert_eq!(queues.disposed_len(), 0);
    }
}
