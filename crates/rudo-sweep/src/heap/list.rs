use std::collections::VecDeque;

use super::{BlockId, HeapBlock};

/// Ordered, owning list of heap blocks.
///
/// Traversal follows insertion order. Moving a block between lists moves
/// the value; there are no links to patch.
#[derive(Debug, Default)]
pub struct BlockList {
    blocks: VecDeque<HeapBlock>,
}

impl BlockList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, block: HeapBlock) {
        self.blocks.push_back(block);
    }

    pub fn pop_front(&mut self) -> Option<HeapBlock> {
        self.blocks.pop_front()
    }

    /// Move every block of `other` to the end of this list.
    pub fn append(&mut self, other: &mut Self) {
        self.blocks.append(&mut other.blocks);
    }

    /// Take the whole list, leaving this one empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapBlock> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HeapBlock> {
        self.blocks.iter_mut()
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.iter().any(|b| b.id() == id)
    }

    /// Remove and return the first block matching `pred`.
    pub fn remove_first(&mut self, pred: impl FnMut(&HeapBlock) -> bool) -> Option<HeapBlock> {
        let index = self.blocks.iter().position(pred)?;
        self.blocks.remove(index)
    }

    /// Sum of `f` over every block.
    pub fn sum_by(&self, f: impl Fn(&HeapBlock) -> usize) -> usize {
        self.blocks.iter().map(f).sum()
    }
}

impl IntoIterator for BlockList {
    type Item = HeapBlock;
    type IntoIter = std::collections::vec_deque::IntoIter<HeapBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

impl Extend<HeapBlock> for BlockList {
    fn extend<T: IntoIterator<Item = HeapBlock>>(&mut self, iter: T) {
        self.blocks.extend(iter);
    }
}
