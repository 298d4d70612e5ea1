//! Integration tests for partial collection across cycles.
//!
//! Objects are 64 bytes in 4 KiB blocks (64 slots per block) unless noted.

use rudo_sweep::partial::PartialRejection;
use rudo_sweep::{
    CollectOptions, CollectionKind, Collector, ObjectKind, ObjectRef, PartialDecision, SweepConfig,
};

const MIB: usize = 1024 * 1024;

fn config() -> SweepConfig {
    SweepConfig::default()
        .with_page_size(4096)
        .with_verify_accounting(true)
}

fn alloc_many(c: &mut Collector, kind: ObjectKind, size: usize, n: usize) -> Vec<ObjectRef> {
    (0..n).map(|_| c.alloc(kind, size).unwrap()).collect()
}

fn mark_all(c: &Collector, objs: &[ObjectRef]) {
    for obj in objs {
        c.mark(*obj);
    }
}

#[test]
fn test_entering_partial_mode_counts_everything_uncollected() {
    let mut c = Collector::new(config());
    // 16 objects of 512 bytes: one retired block, one full current block.
    alloc_many(&mut c, ObjectKind::Leaf, 512, 16);
    c.prepare_collection(CollectionKind::Full).unwrap();
    assert_eq!(c.allocation_counters().last_uncollected_alloc_bytes, 4096);

    // Allocated between prepare and begin: one more retired block.
    alloc_many(&mut c, ObjectKind::Leaf, 512, 9);
    let counters = *c.allocation_counters();
    let expected = counters.uncollected_alloc_bytes + counters.last_uncollected_alloc_bytes;
    assert_eq!(expected, 8192);

    c.begin_sweep(MIB, true).unwrap();
    assert!(c.in_partial_collect_mode());
    assert_eq!(c.partial_uncollected_alloc_bytes(), expected);
    let session = c.session().unwrap();
    assert!(!session.in_partial_collect());
    assert_eq!(session.next_partial_uncollected_alloc_bytes(), expected);

    c.sweep().unwrap();
    let metrics = c.end_sweep().unwrap();
    assert_eq!(metrics.bytes_freed, 2 * 4096);
    // A partial sweep that started from a full collection carries nothing over.
    assert_eq!(c.partial_uncollected_alloc_bytes(), 0);
}

#[test]
fn test_partial_bytes_track_surviving_new_objects() {
    let mut c = Collector::new(config());

    // Cycle 1: full collection entering partial mode.
    let first = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    let old = first[..4].to_vec();
    let m = c
        .collect_with(CollectOptions::partial(0), |c| mark_all(c, &old))
        .unwrap();
    assert_eq!(m.partial_decision, PartialDecision::Approved);
    assert!(m.partial);
    assert!(c.in_partial_collect_mode());
    assert_eq!(c.partial_uncollected_alloc_bytes(), 0);

    // Cycle 2: 60 new objects fill block A, 4 more start block B.
    let new = alloc_many(&mut c, ObjectKind::Normal, 64, 64);
    assert_eq!(new[59].block(), old[0].block());
    assert_ne!(new[60].block(), old[0].block());
    let survivors = [new[0], new[1], new[60]];
    let m = c
        .collect_with(CollectOptions::partial(0), |c| {
            mark_all(c, &old);
            mark_all(c, &survivors);
        })
        .unwrap();
    assert_eq!(m.partial_decision, PartialDecision::Approved);
    assert_eq!(c.partial_uncollected_alloc_bytes(), 3 * 64);

    // Cycle 3: the rescan estimate is over the ceiling, partial mode ends.
    let m = c
        .collect_with(CollectOptions::partial(6 * MIB), |c| {
            mark_all(c, &old);
            mark_all(c, &survivors);
        })
        .unwrap();
    assert!(!m.partial);
    assert!(!c.in_partial_collect_mode());
    assert_eq!(c.partial_uncollected_alloc_bytes(), 0);
    assert_eq!(c.heap_stats().unwrap().partial_block_count, 0);
    assert_eq!(c.heap_stats().unwrap().allocated_bytes, 7 * 64);
}

#[test]
fn test_partial_bytes_grow_while_partial_mode_continues() {
    let mut c = Collector::new(config());
    let mut roots = Vec::new();
    let mut previous = 0;
    for cycle in 0..4 {
        let objs = alloc_many(&mut c, ObjectKind::Normal, 64, 16);
        roots.extend_from_slice(&objs[..4]);
        let m = c
            .collect_with(CollectOptions::partial(0), |c| mark_all(c, &roots))
            .unwrap();
        assert_eq!(m.partial_decision, PartialDecision::Approved, "cycle {cycle}");
        assert_eq!(m.bytes_freed, 12 * 64, "cycle {cycle}");

        let bytes = c.partial_uncollected_alloc_bytes();
        assert!(bytes >= previous, "cycle {cycle}: {bytes} < {previous}");
        assert_eq!(bytes, cycle * 4 * 64, "cycle {cycle}");
        previous = bytes;
    }
}

#[test]
fn test_sparse_blocks_are_set_aside_until_full_collection() {
    let mut c = Collector::new(config());
    let first = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    let old = first[..4].to_vec();
    c.collect_with(CollectOptions::partial(0), |c| mark_all(c, &old))
        .unwrap();

    // Every new object dies: efficacy is perfect, so only a block freeing
    // a whole page would be reused now.
    let new = alloc_many(&mut c, ObjectKind::Normal, 64, 4);
    assert_eq!(new[0].block(), old[0].block());
    let m = c
        .collect_with(CollectOptions::partial(0), |c| mark_all(c, &old))
        .unwrap();
    assert_eq!(m.partial_decision, PartialDecision::Approved);
    assert!((m.efficacy - 1.0).abs() < f64::EPSILON);
    assert_eq!(m.blocks_reused, 0);
    assert_eq!(m.bytes_freed, 0);

    let stats = c.heap_stats().unwrap();
    assert_eq!(stats.partial_block_count, 1);
    assert_eq!(stats.unused_partial_collect_free_bytes, 60 * 64);
    assert_eq!(stats.allocated_bytes, 8 * 64);

    // A full collection sweeps the set-aside block like any other.
    let m = c
        .collect_with(
            CollectOptions::full().with_rescan_root_bytes(6 * MIB),
            |c| mark_all(c, &old),
        )
        .unwrap();
    assert_eq!(m.bytes_freed, 4 * 64);
    let stats = c.heap_stats().unwrap();
    assert_eq!(stats.partial_block_count, 0);
    assert_eq!(stats.unused_partial_collect_free_bytes, 0);
    assert_eq!(stats.allocated_bytes, 4 * 64);
}

#[test]
fn test_leaf_blocks_count_toward_reuse_bytes_only() {
    let mut c = Collector::new(config());
    let leaves = alloc_many(&mut c, ObjectKind::Leaf, 64, 8);
    let normals = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    c.prepare_collection(CollectionKind::Full).unwrap();
    mark_all(&c, &leaves[..4]);
    mark_all(&c, &normals[..4]);

    c.begin_sweep(0, true).unwrap();
    assert!(c.in_partial_collect_mode());
    c.sweep().unwrap();

    // Both blocks expect 60 free slots; only the normal block needs rescan.
    let session = c.session().unwrap();
    assert_eq!(session.reuse_byte_count(), 2 * 60 * 64);
    assert_eq!(session.reuse_heap_block_count(), 1);
    c.end_sweep().unwrap();
}

#[test]
fn test_low_efficacy_rejects_partial_mode() {
    let mut c = Collector::new(config());
    let objs = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    let m = c
        .collect_with(CollectOptions::partial(0), |c| mark_all(c, &objs))
        .unwrap();
    assert!(matches!(
        m.partial_decision,
        PartialDecision::Rejected(PartialRejection::LowEfficacy { .. })
    ));
    assert!(!c.in_partial_collect_mode());
    assert_eq!(c.partial_uncollected_alloc_bytes(), 0);
    assert_eq!(m.bytes_freed, 0);
}

#[test]
fn test_keeping_thresholds_skips_the_recompute() {
    let mut c = Collector::new(config());
    let objs = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    // Everything survives, which a recompute would reject.
    let m = c
        .collect_with(
            CollectOptions::partial(0).with_adjust_heuristics(false),
            |c| mark_all(c, &objs),
        )
        .unwrap();
    assert_eq!(m.partial_decision, PartialDecision::KeptThresholds);
    assert!(c.in_partial_collect_mode());
}

#[test]
fn test_full_preparation_leaves_partial_mode() {
    let mut c = Collector::new(config());
    let objs = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    let roots = objs[..4].to_vec();
    c.collect_with(CollectOptions::partial(0), |c| mark_all(c, &roots))
        .unwrap();
    assert!(c.in_partial_collect_mode());

    c.prepare_collection(CollectionKind::Full).unwrap();
    assert!(!c.in_partial_collect_mode());
    assert_eq!(c.partial_uncollected_alloc_bytes(), 0);
    assert_eq!(c.partial_state().uncollected_new_page_count, 0);

    mark_all(&c, &roots);
    c.begin_sweep(6 * MIB, true).unwrap();
    c.sweep().unwrap();
    let m = c.end_sweep().unwrap();
    assert!(!m.partial);
    assert_eq!(m.partial_decision, PartialDecision::NotPartial);
}

#[test]
fn test_disabled_partial_collect_never_enters_partial_mode() {
    let mut c = Collector::new(
        SweepConfig::without_partial_collect()
            .with_page_size(4096)
            .with_verify_accounting(true),
    );
    let objs = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    let m = c
        .collect_with(CollectOptions::partial(0), |c| c.mark(objs[0]))
        .unwrap();
    assert!(!m.partial);
    assert!(!c.in_partial_collect_mode());
    assert_eq!(m.bytes_freed, 7 * 64);
}

#[cfg(unix)]
#[test]
fn test_write_watch_failure_disables_partial_collect() {
    let mut c = Collector::new(config().with_force_software_write_barrier(false));
    let objs = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    let roots = objs[..4].to_vec();

    let m = c
        .collect_with(CollectOptions::partial(0), |c| mark_all(c, &roots))
        .unwrap();
    assert_eq!(m.partial_decision, PartialDecision::WriteWatchFailed);
    assert!(!c.partial_state().enabled);
    assert!(!c.in_partial_collect_mode());

    // Partial mode stays off from now on.
    let m = c
        .collect_with(CollectOptions::partial(0), |c| mark_all(c, &roots))
        .unwrap();
    assert!(!m.partial);
    assert_eq!(m.partial_decision, PartialDecision::NotPartial);
}

#[cfg(unix)]
#[test]
fn test_write_watch_failure_after_background_sweep_disables_partial_collect() {
    let mut c = Collector::new(config().with_force_software_write_barrier(false));
    let objs = alloc_many(&mut c, ObjectKind::Normal, 64, 8);
    let roots = objs[..4].to_vec();

    c.prepare_collection(CollectionKind::Full).unwrap();
    mark_all(&c, &roots);
    c.begin_sweep(0, true).unwrap();
    c.start_background_sweep().unwrap();
    // The reset happens once the heap is back on this thread.
    c.wait_for_background_sweep().unwrap();
    assert!(!c.partial_state().enabled);
    assert!(!c.in_partial_collect_mode());

    let m = c.end_sweep().unwrap();
    assert!(m.background);
    assert_eq!(m.partial_decision, PartialDecision::WriteWatchFailed);

    let m = c
        .collect_with(CollectOptions::partial(0).with_background(true), |c| {
            mark_all(c, &roots);
        })
        .unwrap();
    assert!(!m.partial);
    assert_eq!(m.partial_decision, PartialDecision::NotPartial);
}
