//! Tunables for sweeping and the partial-collect heuristic.
//!
//! The numeric defaults are performance policy. The rejection conditions
//! they gate (efficacy floor, rescan ceiling, unused-free-bytes ceiling)
//! are what the heuristic guarantees, whatever values are configured.

/// One kibibyte.
pub const KIB: usize = 1024;
/// One mebibyte.
pub const MIB: usize = 1024 * KIB;

/// Rescan cost above which partial collection is refused.
pub const DEFAULT_MAX_PARTIAL_COLLECT_RESCAN_ROOT_BYTES: usize = 5 * MIB;
/// Free bytes stranded in partial blocks above which partial mode is abandoned.
pub const DEFAULT_MAX_UNUSED_PARTIAL_COLLECT_FREE_BYTES: usize = 16 * MIB;
/// A partial cycle must free at least this fraction of new bytes to continue.
pub const DEFAULT_MIN_PARTIAL_COLLECT_EFFICACY: f64 = 0.1;
/// Floor of the new-page budget before the next partial collection.
pub const DEFAULT_MIN_PARTIAL_UNCOLLECTED_NEW_PAGE_BYTES: usize = 4 * MIB;
/// Ceiling of the new-page budget before the next partial collection.
pub const DEFAULT_MAX_PARTIAL_UNCOLLECTED_NEW_PAGE_BYTES: usize = 16 * MIB;
/// Uncollected bytes at which a full collection is forced while in partial mode.
pub const DEFAULT_MAX_UNCOLLECTED_ALLOC_BYTES_PARTIAL_COLLECT: usize = 64 * MIB;
/// Heuristic ratio at or above which the next collection is started concurrently.
pub const DEFAULT_PARTIAL_CONCURRENT_NEXT_COLLECTION_RATIO: f64 = 0.5;
/// Empty blocks kept mapped for reuse after a sweep.
pub const DEFAULT_MAX_EMPTY_BLOCKS: usize = 16;

/// Configuration of the partial-collect heuristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialCollectConfig {
    /// Administrative switch. When `false`, partial mode is never entered.
    pub enabled: bool,
    /// Largest root rescan estimate that still allows partial mode.
    pub max_rescan_root_bytes: usize,
    /// Free bytes stranded in set-aside blocks beyond which partial mode is refused.
    pub max_unused_free_bytes: usize,
    /// Fraction of new bytes a cycle must free to stay in partial mode.
    pub min_efficacy: f64,
    /// Floor of the new-page budget, in bytes.
    pub min_uncollected_new_page_bytes: usize,
    /// Ceiling of the new-page budget, in bytes.
    pub max_uncollected_new_page_bytes: usize,
    /// Uncollected bytes at which partial mode gives way to a full collection.
    pub max_uncollected_alloc_bytes: usize,
    /// Heuristic ratio at or above which the next collection starts concurrently.
    pub concurrent_next_collection_ratio: f64,
}

impl Default for PartialCollectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rescan_root_bytes: DEFAULT_MAX_PARTIAL_COLLECT_RESCAN_ROOT_BYTES,
            max_unused_free_bytes: DEFAULT_MAX_UNUSED_PARTIAL_COLLECT_FREE_BYTES,
            min_efficacy: DEFAULT_MIN_PARTIAL_COLLECT_EFFICACY,
            min_uncollected_new_page_bytes: DEFAULT_MIN_PARTIAL_UNCOLLECTED_NEW_PAGE_BYTES,
            max_uncollected_new_page_bytes: DEFAULT_MAX_PARTIAL_UNCOLLECTED_NEW_PAGE_BYTES,
            max_uncollected_alloc_bytes: DEFAULT_MAX_UNCOLLECTED_ALLOC_BYTES_PARTIAL_COLLECT,
            concurrent_next_collection_ratio: DEFAULT_PARTIAL_CONCURRENT_NEXT_COLLECTION_RATIO,
        }
    }
}

impl PartialCollectConfig {
    /// Floor of the new-page threshold, in pages.
    #[must_use]
    pub const fn min_new_page_count(&self, page_size: usize) -> usize {
        self.min_uncollected_new_page_bytes / page_size
    }

    /// Ceiling of the new-page threshold, in pages.
    #[must_use]
    pub const fn max_new_page_count(&self, page_size: usize) -> usize {
        let max = self.max_uncollected_new_page_bytes / page_size;
        let min = self.min_new_page_count(page_size);
        if max < min {
            min
        } else {
            max
        }
    }
}

/// Configuration of a [`Collector`](crate::Collector).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepConfig {
    /// Partial-collect heuristic tunables.
    pub partial: PartialCollectConfig,
    /// Unit used for block sizing and for every page-based heuristic.
    pub page_size: usize,
    /// Run the byte-accounting verification pass. A violation panics when
    /// enabled; when disabled the arithmetic saturates instead.
    pub verify_accounting: bool,
    /// Whether [`Collector::collect`](crate::Collector::collect) offloads
    /// the first sweep pass to the background thread.
    pub background_sweep: bool,
    /// Track rescan state in software only. When `false`, heap blocks are
    /// mapped with hardware write watch and it is reset after page reuse.
    pub force_software_write_barrier: bool,
    /// Empty blocks kept mapped after a sweep; the rest are unmapped.
    pub max_empty_blocks: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            partial: PartialCollectConfig::default(),
            page_size: sys_alloc::page_size(),
            verify_accounting: cfg!(debug_assertions),
            background_sweep: false,
            force_software_write_barrier: true,
            max_empty_blocks: DEFAULT_MAX_EMPTY_BLOCKS,
        }
    }
}

impl SweepConfig {
    /// Default configuration with partial collection switched off.
    #[must_use]
    pub fn without_partial_collect() -> Self {
        let mut config = Self::default();
        config.partial.enabled = false;
        config
    }

    #[must_use]
    pub const fn with_partial(mut self, partial: PartialCollectConfig) -> Self {
        self.partial = partial;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_verify_accounting(mut self, verify: bool) -> Self {
        self.verify_accounting = verify;
        self
    }

    #[must_use]
    pub const fn with_background_sweep(mut self, background: bool) -> Self {
        self.background_sweep = background;
        self
    }

    #[must_use]
    pub const fn with_force_software_write_barrier(mut self, force: bool) -> Self {
        self.force_software_write_barrier = force;
        self
    }

    #[must_use]
    pub const fn with_max_empty_blocks(mut self, max: usize) -> Self {
        self.max_empty_blocks = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ceilings() {
        let config = PartialCollectConfig::default();
        assert_eq!(config.max_rescan_root_bytes, 5 * MIB);
        assert_eq!(config.max_unused_free_bytes, 16 * MIB);
        assert!((config.min_efficacy - 0.1).abs() < f64::EPSILON);
        assert!(config.enabled);
    }

    #[test]
    fn test_new_page_counts_follow_page_size() {
        let config = PartialCollectConfig::default();
        assert_eq!(config.min_new_page_count(4096), 1024);
        assert_eq!(config.max_new_page_count(4096), 4096);
        assert_eq!(config.min_new_page_count(16384), 256);
    }

    #[test]
    fn test_max_page_count_never_below_min() {
        let config = PartialCollectConfig {
            max_uncollected_new_page_bytes: MIB,
            ..PartialCollectConfig::default()
        };
        assert_eq!(config.max_new_page_count(4096), config.min_new_page_count(4096));
    }

    #[test]
    fn test_builder_setters() {
        let config = SweepConfig::default()
            .with_page_size(16384)
            .with_verify_accounting(false)
            .with_background_sweep(true)
            .with_max_empty_blocks(0);
        assert_eq!(config.page_size, 16384);
        assert!(!config.verify_accounting);
        assert!(config.background_sweep);
        assert_eq!(config.max_empty_blocks, 0);
        assert!(config.force_software_write_barrier);
    }

    #[test]
    fn test_without_partial_collect() {
        let config = SweepConfig::without_partial_collect();
        assert!(!config.partial.enabled);
        assert!(config.page_size.is_power_of_two());
    }
}
