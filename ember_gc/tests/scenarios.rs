//! End-to-end collection scenarios.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use common::{SLOT0, record_finalized, runtime, runtime_with, was_finalized};
use ember_gc::heap::ARENA_SIZE;
use ember_gc::{
    AllocKind, CompartmentId, FaultInjectingPages, GcCell, GcConfig, GcError, GcReason, GcStatus, PageAllocator,
    RootScope, Runtime, TraceKind,
};

#[test]
fn test_full_arena_mints_a_second_one() {
    let rt = runtime();
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");
    let scope = rt.root_scope();

    let per_arena = AllocKind::Object4.things_per_arena();
    let first = scope.root(rt.alloc(comp, AllocKind::Object4).expect("alloc"));
    for _ in 1..per_arena {
        scope.root(rt.alloc(comp, AllocKind::Object4).expect("alloc"));
    }
    assert_eq!(rt.compartment_gc_bytes(comp), Ok(ARENA_SIZE));

    let overflow = scope.root(rt.alloc(comp, AllocKind::Object4).expect("alloc"));
    assert_eq!(rt.compartment_gc_bytes(comp), Ok(2 * ARENA_SIZE));
    assert_ne!(first.addr() & !(ARENA_SIZE - 1), overflow.addr() & !(ARENA_SIZE - 1));

    let mut listed = Vec::new();
    rt.for_each_cell(comp, AllocKind::Object4, |cell| listed.push(cell))
        .expect("iterate");
    assert_eq!(listed.len(), per_arena + 1);
    assert!(listed.contains(&first));
    assert!(listed.contains(&overflow));
    assert!(rt.is_live(first));
}

#[test]
fn test_unreachable_cycle_is_finalized() {
    let rt = runtime();
    let finalized = record_finalized(&rt, TraceKind::Object);
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");

    let a = rt.alloc(comp, AllocKind::Object2).expect("alloc");
    let b = rt.alloc(comp, AllocKind::Object2).expect("alloc");
    rt.write_edge(a, SLOT0, Some(b)).expect("edge");
    rt.write_edge(b, SLOT0, Some(a)).expect("edge");

    assert_eq!(rt.gc(), Ok(true));
    assert!(was_finalized(&finalized, a));
    assert!(was_finalized(&finalized, b));
    assert!(!rt.is_live(a));
    assert!(!rt.is_live(b));
    assert_eq!(rt.count_live(comp), Ok(0));
}

#[test]
fn test_explicit_root_keeps_thing_until_removed() {
    let rt = runtime();
    let finalized = record_finalized(&rt, TraceKind::Object);
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");

    let obj = rt.alloc(comp, AllocKind::Object2).expect("alloc");
    let child = rt.alloc(comp, AllocKind::Object0).expect("alloc");
    rt.write_edge(obj, SLOT0 + 1, Some(child)).expect("edge");
    assert!(rt.add_root(obj, Some("test root")));

    rt.gc().expect("gc");
    assert!(rt.is_live(obj));
    assert!(rt.is_live(child));
    assert!(finalized.lock().is_empty());

    assert!(rt.remove_root(obj));
    assert!(!rt.remove_root(obj));
    rt.gc().expect("gc");
    assert!(was_finalized(&finalized, obj));
    assert!(was_finalized(&finalized, child));
}

#[test]
fn test_locked_things_are_reference_counted() {
    let rt = runtime();
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");
    let obj = rt.alloc(comp, AllocKind::Shape).expect("alloc");

    assert!(rt.lock_thing(obj));
    assert!(rt.lock_thing(obj));
    assert!(rt.unlock_thing(obj));
    rt.gc().expect("gc");
    assert!(rt.is_live(obj));

    assert!(rt.unlock_thing(obj));
    assert!(!rt.unlock_thing(obj));
    rt.gc().expect("gc");
    assert!(!rt.is_live(obj));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Finalized(usize),
    MarkEnd,
}

/// Log finalizations of objects and the end of each mark phase, in order.
/// Finalizers sleep briefly so the helper thread lags behind the mutator.
fn record_events(rt: &Runtime) -> Arc<Mutex<Vec<Event>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    rt.set_finalize_hook(TraceKind::Object, move |view| {
        thread::sleep(Duration::from_micros(50));
        sink.lock().push(Event::Finalized(view.cell().addr()));
    })
    .expect("finalize hook");
    let sink = Arc::clone(&log);
    rt.on_gc_status(move |status| {
        if status == GcStatus::MarkEnd {
            sink.lock().push(Event::MarkEnd);
        }
        true
    });
    log
}

fn background_runtime() -> Runtime {
    runtime_with(GcConfig {
        background_finalization: true,
        ..GcConfig::for_testing()
    })
}

#[test]
fn test_full_collection_waits_for_background_sweep() {
    let rt = background_runtime();
    let events = record_events(&rt);
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");
    let scope = rt.root_scope();

    let kind = AllocKind::Object2.to_background();
    let count = kind.things_per_arena() * 3;
    let mut garbage = HashSet::new();
    let mut kept = Vec::new();
    for i in 0..count {
        let cell = rt.alloc(comp, kind).expect("alloc");
        if i % 10 == 0 {
            kept.push(scope.root(cell));
        } else {
            garbage.insert(cell.addr());
        }
    }

    // The first collection lends the arenas to the helper; the second has
    // to wait for it before marking.
    assert_eq!(rt.gc(), Ok(true));
    let during = scope.root(rt.alloc(comp, kind).expect("alloc during sweep"));
    assert_eq!(rt.gc(), Ok(true));
    rt.wait_background_sweep_end();

    let log = events.lock().clone();
    let marks: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, event)| **event == Event::MarkEnd)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(marks.len(), 2);
    let finalized: Vec<usize> = log
        .iter()
        .filter_map(|event| match event {
            Event::Finalized(addr) => Some(*addr),
            Event::MarkEnd => None,
        })
        .collect();
    assert_eq!(
        log[marks[0] + 1..marks[1]]
            .iter()
            .filter(|event| matches!(event, Event::Finalized(_)))
            .count(),
        garbage.len(),
        "second collection marked before the first sweep finished"
    );

    let unique: HashSet<usize> = finalized.iter().copied().collect();
    assert_eq!(unique.len(), finalized.len(), "a thing was finalized twice");
    assert_eq!(unique, garbage);
    assert!(kept.iter().all(|&cell| rt.is_live(cell)));
    assert!(rt.is_live(during));
    assert!(rt.stats().background_sweeps.load(Ordering::Relaxed) >= 1);
    assert!(rt.check_heap());
}

/// Fill one background-finalized arena, root every other thing and
/// collect. The helper is still finalizing the rest when this returns.
fn collect_half_rooted(rt: &Runtime, comp: CompartmentId, scope: &RootScope<'_>) -> (Vec<GcCell>, Vec<GcCell>) {
    let kind = AllocKind::Object2.to_background();
    let mut kept = Vec::new();
    let mut dead = Vec::new();
    for i in 0..kind.things_per_arena() {
        let cell = rt.alloc(comp, kind).expect("alloc");
        if i % 2 == 0 {
            kept.push(scope.root(cell));
        } else {
            dead.push(cell);
        }
    }
    assert_eq!(rt.gc(), Ok(true));
    (kept, dead)
}

#[test]
fn test_heap_queries_wait_for_background_sweep() {
    let rt = background_runtime();
    let _events = record_events(&rt);
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");
    let scope = rt.root_scope();
    let kind = AllocKind::Object2.to_background();
    let mut rooted = HashSet::new();

    let (kept, _) = collect_half_rooted(&rt, comp, &scope);
    rooted.extend(kept);
    assert_eq!(rt.count_live(comp), Ok(rooted.len()));

    let (kept, _) = collect_half_rooted(&rt, comp, &scope);
    rooted.extend(kept);
    let mut seen = HashSet::new();
    rt.for_each_cell(comp, kind, |cell| {
        seen.insert(cell);
    })
    .expect("iterate");
    assert_eq!(seen, rooted);

    let (kept, dead) = collect_half_rooted(&rt, comp, &scope);
    rooted.extend(kept);
    assert!(dead.iter().all(|&cell| !rt.is_live(cell)));

    let (kept, dead) = collect_half_rooted(&rt, comp, &scope);
    rooted.extend(kept);
    assert!(!rt.add_root(dead[0], Some("resurrected")));

    let (kept, dead) = collect_half_rooted(&rt, comp, &scope);
    rooted.extend(kept);
    assert!(!rt.lock_thing(dead[0]));
    assert!(rooted.iter().all(|&cell| rt.is_live(cell)));
}

#[test]
fn test_drop_after_pooled_chunk_has_aged() {
    let pages = Arc::new(FaultInjectingPages::unlimited());
    let rt = Runtime::with_page_allocator(GcConfig::for_testing(), Arc::clone(&pages) as Arc<dyn PageAllocator>)
        .expect("runtime");
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");
    rt.alloc(comp, AllocKind::Object4).expect("alloc");

    // The emptied chunk goes to the pool, then ages with each collection.
    rt.gc().expect("gc");
    rt.gc().expect("gc");
    assert_eq!(rt.chunk_count(), 0);
    assert_eq!(rt.pooled_chunks().0, 1);

    drop(rt);
    assert_eq!(pages.maps(), 1);
    assert_eq!(pages.unmaps(), 1);
}

#[test]
fn test_quota_exhaustion_runs_last_ditch_before_oom() {
    // Not a multiple of the arena size, so no trigger fires before the
    // quota is reached.
    let max_bytes = 4 * ARENA_SIZE + 512;
    let rt = runtime_with(GcConfig {
        max_bytes,
        ..GcConfig::for_testing()
    });
    let comp = rt.create_compartment(false);
    let scope = rt.root_scope();

    let mut allocated = 0;
    let err = loop {
        match rt.alloc(comp, AllocKind::Object4) {
            Ok(cell) => {
                scope.root(cell);
                allocated += 1;
            }
            Err(err) => break err,
        }
        assert!(allocated <= 4 * AllocKind::Object4.things_per_arena());
    };

    assert_eq!(allocated, 4 * AllocKind::Object4.things_per_arena());
    assert_eq!(
        err,
        GcError::OutOfMemory {
            requested_kind: AllocKind::Object4,
            gc_bytes: 4 * ARENA_SIZE,
            max_bytes,
        }
    );
    assert_eq!(rt.stats().collections_for(GcReason::LastDitch), 1);
    assert_eq!(rt.stats().collections_for(GcReason::AllocTrigger), 0);
}

#[test]
fn test_last_ditch_collection_recovers_garbage() {
    let max_bytes = 4 * ARENA_SIZE + 512;
    let rt = runtime_with(GcConfig {
        max_bytes,
        ..GcConfig::for_testing()
    });
    let comp = rt.create_compartment(false);

    // Ten heaps' worth of unrooted things fit because each last-ditch
    // collection frees the previous ones.
    let total = 10 * 4 * AllocKind::Object4.things_per_arena();
    for _ in 0..total {
        rt.alloc(comp, AllocKind::Object4).expect("alloc");
    }
    assert!(rt.stats().collections_for(GcReason::LastDitch) >= 9);
    assert!(rt.gc_bytes() <= max_bytes);
    assert!(rt.has_compartment(comp));
}
