//! Heap block catalog.
//!
//! Blocks are grouped into buckets by [`BucketKind`] (object kind × size
//! tier) and size class. The catalog owns every block; sweep sessions
//! borrow blocks by moving them into session-local lists and must hand
//! every one of them back before the session ends.
//!
//! # Layout
//!
//! | Tier   | Size classes (bytes)            | Pages per block |
//! |--------|---------------------------------|-----------------|
//! | Small  | 16, 32, 64, 128, 256, 512       | 1               |
//! | Medium | 1024, 2048, 4096, 8192          | 8               |

mod alloc;
mod bitmap;
mod block;
mod block_map;
mod bucket;
mod dispose;
mod info;
mod list;

pub use alloc::{AllocationCounters, Allocator};
pub use bitmap::MarkBitmap;
pub use block::{BlockAnalysis, BlockId, HeapBlock, ObjectRef};
pub use block_map::HeapBlockMap;
pub use bucket::HeapBucket;
pub use dispose::{DisposeBatch, DisposeQueues};
pub use info::{HeapInfo, HeapStats};
pub use list::BlockList;

/// Size classes served by small blocks.
pub const SMALL_SIZE_CLASSES: [usize; 6] = [16, 32, 64, 128, 256, 512];

/// Size classes served by medium blocks.
pub const MEDIUM_SIZE_CLASSES: [usize; 4] = [1024, 2048, 4096, 8192];

/// Objects larger than this cannot be allocated from the catalog.
pub const MAX_MEDIUM_OBJECT_SIZE: usize = 8192;

/// What the objects of a block contain, as far as the collector cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// No outgoing pointers. Never contributes to rescan cost.
    Leaf,
    /// Ordinary traced objects.
    Normal,
    /// Objects with a cleanup callback that must run before reclamation.
    Finalizable,
    /// Traced objects whose mutations are recorded by a software write barrier.
    NormalWithBarrier,
    /// Finalizable objects recorded by a software write barrier.
    FinalizableWithBarrier,
}

impl ObjectKind {
    /// All object kinds, in bucket-table order.
    pub const ALL: [Self; 5] = [
        Self::Leaf,
        Self::Normal,
        Self::Finalizable,
        Self::NormalWithBarrier,
        Self::FinalizableWithBarrier,
    ];

    #[must_use]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Leaf)
    }

    #[must_use]
    pub const fn is_finalizable(self) -> bool {
        matches!(self, Self::Finalizable | Self::FinalizableWithBarrier)
    }

    #[must_use]
    pub const fn has_write_barrier(self) -> bool {
        matches!(self, Self::NormalWithBarrier | Self::FinalizableWithBarrier)
    }
}

/// Block size tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeTier {
    Small,
    Medium,
}

impl SizeTier {
    /// Both tiers, in bucket-table order.
    pub const ALL: [Self; 2] = [Self::Small, Self::Medium];

    /// Size classes served by this tier.
    #[must_use]
    pub const fn size_classes(self) -> &'static [usize] {
        match self {
            Self::Small => &SMALL_SIZE_CLASSES,
            Self::Medium => &MEDIUM_SIZE_CLASSES,
        }
    }

    /// Number of pages mapped for each block of this tier.
    #[must_use]
    pub const fn pages_per_block(self) -> usize {
        match self {
            Self::Small => 1,
            Self::Medium => 8,
        }
    }

    /// Tier and size-class index serving an object of `size` bytes.
    #[must_use]
    pub fn for_size(size: usize) -> Option<(Self, usize)> {
        let size = size.max(1);
        for tier in Self::ALL {
            if let Some(index) = tier.size_classes().iter().position(|&class| size <= class) {
                return Some((tier, index));
            }
        }
        None
    }
}

/// One entry of the closed {object kind × size tier} table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKind {
    /// Object kind of the bucket.
    pub kind: ObjectKind,
    /// Small or medium block layout.
    pub tier: SizeTier,
}

impl BucketKind {
    /// Number of bucket kinds.
    pub const COUNT: usize = ObjectKind::ALL.len() * SizeTier::ALL.len();

    /// Every bucket kind, small tier first.
    pub const ALL: [Self; Self::COUNT] = [
        Self::new(ObjectKind::Leaf, SizeTier::Small),
        Self::new(ObjectKind::Normal, SizeTier::Small),
        Self::new(ObjectKind::Finalizable, SizeTier::Small),
        Self::new(ObjectKind::NormalWithBarrier, SizeTier::Small),
        Self::new(ObjectKind::FinalizableWithBarrier, SizeTier::Small),
        Self::new(ObjectKind::Leaf, SizeTier::Medium),
        Self::new(ObjectKind::Normal, SizeTier::Medium),
        Self::new(ObjectKind::Finalizable, SizeTier::Medium),
        Self::new(ObjectKind::NormalWithBarrier, SizeTier::Medium),
        Self::new(ObjectKind::FinalizableWithBarrier, SizeTier::Medium),
    ];

    #[must_use]
    pub const fn new(kind: ObjectKind, tier: SizeTier) -> Self {
        Self { kind, tier }
    }

    /// Position of this kind in [`BucketKind::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        let kind = match self.kind {
            ObjectKind::Leaf => 0,
            ObjectKind::Normal => 1,
            ObjectKind::Finalizable => 2,
            ObjectKind::NormalWithBarrier => 3,
            ObjectKind::FinalizableWithBarrier => 4,
        };
        match self.tier {
            SizeTier::Small => kind,
            SizeTier::Medium => ObjectKind::ALL.len() + kind,
        }
    }

    /// Number of size classes (buckets) of this kind.
    #[must_use]
    pub const fn bucket_count(self) -> usize {
        self.tier.size_classes().len()
    }

    /// Swept by the first (possibly background) pass.
    #[must_use]
    pub const fn is_small_non_finalizable(self) -> bool {
        matches!(self.tier, SizeTier::Small) && !self.kind.is_finalizable()
    }
}
