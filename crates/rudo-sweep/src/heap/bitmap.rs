//! Per-block slot bitmaps.
//!
//! [`MarkBitmap`] is written by the mark phase, possibly from several
//! threads and while the owning block is away on the background sweeper,
//! so it is atomic and shared through an `Arc`. [`SlotBits`] holds the
//! block-private allocation state and is only touched by whoever owns the
//! block.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const WORD_BITS: usize = 64;

/// A block-level bitmap recording which slots the mark phase reached.
///
/// # Example
///
/// ```
/// use rudo_sweep::heap::MarkBitmap;
///
/// let marks = MarkBitmap::new(100);
/// assert!(!marks.is_marked(3));
/// assert!(marks.mark(3));
/// assert!(!marks.mark(3));
/// assert_eq!(marks.marked_count(), 1);
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    words: Vec<AtomicU64>,
    capacity: usize,
    marked_count: AtomicUsize,
}

impl MarkBitmap {
    /// Create a cleared bitmap covering `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words = (0..capacity.div_ceil(WORD_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words,
            capacity,
            marked_count: AtomicUsize::new(0),
        }
    }

    /// Number of slots covered.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of marked slots.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Mark `slot`. Returns `true` if it was not marked before.
    ///
    /// Out-of-range slots are ignored.
    pub fn mark(&self, slot: usize) -> bool {
        if slot >= self.capacity {
            return false;
        }
        let mask = 1u64 << (slot % WORD_BITS);
        let prev = self.words[slot / WORD_BITS].fetch_or(mask, Ordering::Relaxed);
        if prev & mask == 0 {
            self.marked_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_marked(&self, slot: usize) -> bool {
        if slot >= self.capacity {
            return false;
        }
        (self.words[slot / WORD_BITS].load(Ordering::Relaxed) >> (slot % WORD_BITS)) & 1 != 0
    }

    /// Clear all marks for the next cycle.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_count.store(0, Ordering::Relaxed);
    }
}

/// Plain slot bitset owned by a single block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBits {
    words: Vec<u64>,
    count: usize,
}

impl SlotBits {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            count: 0,
        }
    }

    pub fn get(&self, slot: usize) -> bool {
        (self.words[slot / WORD_BITS] >> (slot % WORD_BITS)) & 1 != 0
    }

    pub fn set(&mut self, slot: usize) {
        let mask = 1u64 << (slot % WORD_BITS);
        let word = &mut self.words[slot / WORD_BITS];
        if *word & mask == 0 {
            *word |= mask;
            self.count += 1;
        }
    }

    pub fn unset(&mut self, slot: usize) {
        let mask = 1u64 << (slot % WORD_BITS);
        let word = &mut self.words[slot / WORD_BITS];
        if *word & mask != 0 {
            *word &= !mask;
            self.count -= 1;
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
        self.count = 0;
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    /// Indices of set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MarkBitmap, SlotBits};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mark_bitmap_concurrent_mark() {
        let marks = Arc::new(MarkBitmap::new(256));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let marks = Arc::clone(&marks);
                thread::spawn(move || {
                    for slot in (t..256).step_by(4) {
                        marks.mark(slot);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(marks.marked_count(), 256);
        assert!((0..256).all(|slot| marks.is_marked(slot)));
    }

    #[test]
    fn test_mark_bitmap_out_of_range() {
        let marks = MarkBitmap::new(10);
        assert!(!marks.mark(10));
        assert!(!marks.is_marked(64));
        assert_eq!(marks.marked_count(), 0);
    }

    #[test]
    fn test_mark_bitmap_clear() {
        let marks = MarkBitmap::new(130);
        marks.mark(0);
        marks.mark(129);
        marks.clear();
        assert_eq!(marks.marked_count(), 0);
        assert!(!marks.is_marked(129));
    }

    #[test]
    fn test_slot_bits_iter_set() {
        let mut bits = SlotBits::new(200);
        for slot in [0, 5, 63, 64, 199] {
            bits.set(slot);
        }
        bits.set(5);
        assert_eq!(bits.count(), 5);
        assert_eq!(bits.iter_set().collect::<Vec<_>>(), vec![0, 5, 63, 64, 199]);
        bits.unset(63);
        bits.unset(63);
        assert_eq!(bits.count(), 4);
    }
}
