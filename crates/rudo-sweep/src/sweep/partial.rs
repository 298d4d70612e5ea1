//! Partial-collect heuristic.
//!
//! Two decisions are made per cycle. Before sweeping,
//! [`should_enter_partial_mode`] gates partial mode on cheap inputs (the
//! administrative switch, stranded free bytes and the rescan estimate).
//! After the first sweep pass, [`recompute_thresholds`] weighs what the
//! cycle actually freed against the cost of rescanning reused pages and
//! either produces the next cycle's thresholds or rejects partial mode.
//!
//! The heuristic ratio is `(c·e + (1 − e))·(1 − p) + p`, where `c` is the
//! rescan cost, `e` the rescaled efficacy and `p` the full-collect
//! pressure; it scales the new-page threshold linearly between its
//! configured floor and ceiling.

use crate::config::PartialCollectConfig;

/// Collector-wide partial-collect state, carried from cycle to cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialCollectState {
    /// Administrative switch. Cleared for good when write watch cannot be reset.
    pub enabled: bool,
    /// Whether the collector is between partial collections.
    pub in_partial_collect_mode: bool,
    /// Bytes allocated since the last full collection that partial
    /// collections have not reclaimed.
    pub partial_uncollected_alloc_bytes: usize,
    /// New pages that may be mapped before the next partial collection.
    pub uncollected_new_page_count: usize,
    /// Whether the next collection should start concurrently.
    pub partial_concurrent_next_collection: bool,
    /// Rescaled efficacy of the last approved recompute.
    pub last_efficacy: f64,
}

impl PartialCollectState {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            in_partial_collect_mode: false,
            partial_uncollected_alloc_bytes: 0,
            uncollected_new_page_count: 0,
            partial_concurrent_next_collection: false,
            last_efficacy: 0.0,
        }
    }

    /// Leave partial mode, zeroing everything it accumulated.
    pub fn exit_partial_mode(&mut self) {
        self.in_partial_collect_mode = false;
        self.partial_uncollected_alloc_bytes = 0;
        self.uncollected_new_page_count = 0;
        self.partial_concurrent_next_collection = false;
        self.last_efficacy = 0.0;
    }

    /// Store an approved recompute.
    pub fn apply(&mut self, thresholds: &Thresholds) {
        self.uncollected_new_page_count = thresholds.uncollected_new_page_count;
        self.partial_concurrent_next_collection = thresholds.partial_concurrent_next_collection;
        self.last_efficacy = thresholds.efficacy;
    }
}

impl Default for PartialCollectState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Why partial mode was refused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartialRejection {
    /// Freed less than the efficacy floor of the new bytes.
    LowEfficacy { efficacy: f64 },
    /// Rescan estimate, including reused pages, above the ceiling.
    RescanCostTooHigh { bytes: usize },
    /// Uncollected bytes already past the full-collect trigger.
    UncollectedBytesTooHigh { bytes: usize },
    /// The projected threshold would trigger a full collection anyway.
    FullCollectImminent { projected_bytes: usize },
}

impl PartialRejection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LowEfficacy { .. } => "low_efficacy",
            Self::RescanCostTooHigh { .. } => "rescan_cost_too_high",
            Self::UncollectedBytesTooHigh { .. } => "uncollected_bytes_too_high",
            Self::FullCollectImminent { .. } => "full_collect_imminent",
        }
    }
}

impl std::fmt::Display for PartialRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowEfficacy { efficacy } => write!(f, "collect efficacy {efficacy:.3} too low"),
            Self::RescanCostTooHigh { bytes } => write!(f, "rescan cost {bytes} bytes too high"),
            Self::UncollectedBytesTooHigh { bytes } => {
                write!(f, "{bytes} uncollected bytes exceed the partial limit")
            }
            Self::FullCollectImminent { projected_bytes } => {
                write!(f, "projected {projected_bytes} bytes reach the full-collect trigger")
            }
        }
    }
}

/// What the sweep observed this cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeuristicInputs {
    /// New bytes since the last partial collect.
    pub new_object_alloc_bytes: usize,
    /// How many of those were freed.
    pub new_object_free_bytes: usize,
    /// Non-leaf blocks with reclaimable objects.
    pub reuse_heap_block_count: usize,
    /// Bytes those blocks would free.
    pub reuse_byte_count: usize,
    /// Estimated bytes of roots to rescan.
    pub rescan_root_bytes: usize,
    /// Partial uncollected bytes left after this cycle's frees.
    pub next_partial_uncollected_alloc_bytes: usize,
    /// Free bytes stranded in blocks set aside by earlier cycles.
    pub unused_partial_collect_free_bytes: usize,
    /// The collector was already in partial mode when the cycle began.
    pub in_partial_collect: bool,
    /// Unit of every page-based threshold.
    pub page_size: usize,
}

/// Output of an approved recompute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Deferred blocks freeing at least this much are reused immediately.
    pub reuse_min_free_bytes: usize,
    /// New pages that may be mapped before the next partial collection.
    pub uncollected_new_page_count: usize,
    /// Whether the next collection should start concurrently.
    pub partial_concurrent_next_collection: bool,
    /// Efficacy after rescaling above the floor.
    pub efficacy: f64,
    /// Heuristic ratio that placed the new-page budget.
    pub ratio: f64,
}

/// Whether the coming sweep should run in partial mode.
#[must_use]
pub fn should_enter_partial_mode(
    state: &PartialCollectState,
    config: &PartialCollectConfig,
    unused_partial_collect_free_bytes: usize,
    rescan_root_bytes: usize,
) -> bool {
    if !state.enabled || !config.enabled {
        return false;
    }
    if unused_partial_collect_free_bytes > config.max_unused_free_bytes {
        return false;
    }
    rescan_root_bytes <= config.max_rescan_root_bytes
}

/// Weigh the cycle's outcome and compute the next partial thresholds.
///
/// # Errors
///
/// Returns the [`PartialRejection`] that ruled partial mode out.
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn recompute_thresholds(
    inputs: &HeuristicInputs,
    config: &PartialCollectConfig,
) -> Result<Thresholds, PartialRejection> {
    let page_size = inputs.page_size;

    let (efficacy, reuse_min_free_bytes) = if inputs.new_object_alloc_bytes == 0 {
        (1.0, 0)
    } else {
        let freed = inputs
            .new_object_free_bytes
            .min(inputs.new_object_alloc_bytes);
        let efficacy = freed as f64 / inputs.new_object_alloc_bytes as f64;
        if efficacy < config.min_efficacy {
            return Err(PartialRejection::LowEfficacy { efficacy });
        }
        let scaled = (efficacy - config.min_efficacy) / (1.0 - config.min_efficacy);
        (scaled, (page_size as f64 * scaled) as usize)
    };

    let reuse_ratio = 1.0 - efficacy;
    let estimated_reuse_blocks = (inputs.reuse_heap_block_count as f64 * reuse_ratio) as usize;
    let rescan_bytes = inputs
        .rescan_root_bytes
        .max(estimated_reuse_blocks * page_size);
    if rescan_bytes > config.max_rescan_root_bytes {
        return Err(PartialRejection::RescanCostTooHigh {
            bytes: rescan_bytes,
        });
    }

    let cost = rescan_bytes as f64 / config.max_rescan_root_bytes as f64;
    let mut ratio = cost.mul_add(efficacy, reuse_ratio);

    let max_uncollected = config.max_uncollected_alloc_bytes;
    if inputs.in_partial_collect {
        if inputs.next_partial_uncollected_alloc_bytes > max_uncollected {
            return Err(PartialRejection::UncollectedBytesTooHigh {
                bytes: inputs.next_partial_uncollected_alloc_bytes,
            });
        }
        let uncollected_pressure =
            inputs.next_partial_uncollected_alloc_bytes as f64 / max_uncollected as f64;
        let pressure = (inputs.unused_partial_collect_free_bytes as f64
            / config.max_unused_free_bytes as f64)
            .mul_add(1.0 - uncollected_pressure, uncollected_pressure);
        ratio = ratio.mul_add(1.0 - pressure, pressure);
    }
    let ratio = ratio.clamp(0.0, 1.0);

    let min_pages = config.min_new_page_count(page_size);
    let max_pages = config.max_new_page_count(page_size);
    let uncollected_new_page_count = min_pages + ((max_pages - min_pages) as f64 * ratio) as usize;

    let estimated_reused_free_bytes = (inputs.reuse_byte_count as f64 * reuse_ratio) as usize;
    let projected_bytes = uncollected_new_page_count * page_size
        + inputs.next_partial_uncollected_alloc_bytes
        + estimated_reused_free_bytes;
    if projected_bytes >= max_uncollected {
        return Err(PartialRejection::FullCollectImminent { projected_bytes });
    }

    Ok(Thresholds {
        reuse_min_free_bytes,
        uncollected_new_page_count,
        partial_concurrent_next_collection: ratio >= config.concurrent_next_collection_ratio,
        efficacy,
        ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;

    const PAGE: usize = 4096;

    fn inputs(alloc: usize, freed: usize) -> HeuristicInputs {
        HeuristicInputs {
            new_object_alloc_bytes: alloc,
            new_object_free_bytes: freed,
            page_size: PAGE,
            ..HeuristicInputs::default()
        }
    }

    #[test]
    fn test_rescan_ceiling_is_absolute() {
        let config = PartialCollectConfig::default();
        let state = PartialCollectState::default();
        assert!(should_enter_partial_mode(&state, &config, 0, 5 * MIB));
        assert!(!should_enter_partial_mode(&state, &config, 0, 5 * MIB + 1));
        assert!(!should_enter_partial_mode(&state, &config, 0, usize::MAX));
    }

    #[test]
    fn test_disabled_or_fragmented_refuses() {
        let config = PartialCollectConfig::default();
        let mut state = PartialCollectState::default();
        assert!(!should_enter_partial_mode(&state, &config, 16 * MIB + 1, 0));
        assert!(should_enter_partial_mode(&state, &config, 16 * MIB, 0));
        state.enabled = false;
        assert!(!should_enter_partial_mode(&state, &config, 0, 0));
    }

    #[test]
    fn test_efficacy_floor() {
        let config = PartialCollectConfig::default();
        for alloc in [10, 1000, 1 << 20, 64 * MIB] {
            let freed = alloc / 10 - 1;
            let result = recompute_thresholds(&inputs(alloc, freed), &config);
            assert!(
                matches!(result, Err(PartialRejection::LowEfficacy { .. })),
                "alloc {alloc}: {result:?}"
            );
        }
    }

    #[test]
    fn test_zero_allocation_reuses_every_page() {
        let config = PartialCollectConfig::default();
        let thresholds = recompute_thresholds(&inputs(0, 0), &config).unwrap();
        assert!((thresholds.efficacy - 1.0).abs() < f64::EPSILON);
        assert_eq!(thresholds.reuse_min_free_bytes, 0);
    }

    #[test]
    fn test_full_efficacy_picks_min_pages() {
        let config = PartialCollectConfig::default();
        let thresholds = recompute_thresholds(&inputs(1000, 1000), &config).unwrap();
        assert_eq!(thresholds.reuse_min_free_bytes, PAGE);
        assert!(thresholds.ratio.abs() < f64::EPSILON);
        assert_eq!(
            thresholds.uncollected_new_page_count,
            config.min_new_page_count(PAGE)
        );
        assert!(!thresholds.partial_concurrent_next_collection);
    }

    #[test]
    fn test_reused_blocks_count_towards_rescan() {
        let config = PartialCollectConfig::default();
        let mut input = inputs(1000, 550);
        // Efficacy 0.55 rescales to about 0.5, so roughly 2000 of the
        // 4000 reused blocks count as rescanned pages.
        input.reuse_heap_block_count = 4000;
        let result = recompute_thresholds(&input, &config);
        assert!(matches!(
            result,
            Err(PartialRejection::RescanCostTooHigh { bytes }) if bytes > 5 * MIB
        ));
    }

    #[test]
    fn test_partial_pressure_raises_threshold() {
        let config = PartialCollectConfig::default();
        let base = inputs(1000, 1000);
        let relaxed = recompute_thresholds(&base, &config).unwrap();

        let pressured = HeuristicInputs {
            in_partial_collect: true,
            next_partial_uncollected_alloc_bytes: 8 * MIB,
            unused_partial_collect_free_bytes: 4 * MIB,
            ..base
        };
        let tight = recompute_thresholds(&pressured, &config).unwrap();
        assert!(tight.ratio > relaxed.ratio);
        assert!(tight.uncollected_new_page_count > relaxed.uncollected_new_page_count);
    }

    #[test]
    fn test_uncollected_bytes_ceiling() {
        let config = PartialCollectConfig::default();
        let input = HeuristicInputs {
            in_partial_collect: true,
            next_partial_uncollected_alloc_bytes: 64 * MIB + 1,
            ..inputs(0, 0)
        };
        assert!(matches!(
            recompute_thresholds(&input, &config),
            Err(PartialRejection::UncollectedBytesTooHigh { .. })
        ));
    }

    #[test]
    fn test_projection_past_trigger_rejects() {
        let config = PartialCollectConfig::default();
        let input = HeuristicInputs {
            in_partial_collect: true,
            next_partial_uncollected_alloc_bytes: 60 * MIB,
            ..inputs(0, 0)
        };
        assert!(matches!(
            recompute_thresholds(&input, &config),
            Err(PartialRejection::FullCollectImminent { .. })
        ));
    }

    #[test]
    fn test_exit_partial_mode_zeroes_state() {
        let mut state = PartialCollectState {
            in_partial_collect_mode: true,
            partial_uncollected_alloc_bytes: 10,
            uncollected_new_page_count: 5,
            partial_concurrent_next_collection: true,
            last_efficacy: 0.5,
            ..PartialCollectState::default()
        };
        state.exit_partial_mode();
        assert_eq!(state, PartialCollectState::default());
    }
}
