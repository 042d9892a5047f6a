//! Compartment-scoped collection, wrappers and compartment lifecycle.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use common::{SLOT0, record_finalized, runtime, was_finalized};
use ember_gc::{AllocKind, CompartmentId, GcError, GcKind, GcReason, TraceKind};

#[test]
fn test_compartment_gc_leaves_other_compartments_alone() {
    let rt = runtime();
    let finalized = record_finalized(&rt, TraceKind::Object);
    let a = rt.create_compartment(false);
    let b = rt.create_compartment(false);
    let in_a = rt.alloc(a, AllocKind::Object0).expect("alloc");
    let in_b = rt.alloc(b, AllocKind::Object0).expect("alloc");
    let _keep_a = rt.alloc(a, AllocKind::Shape).expect("alloc");

    assert_eq!(rt.gc_compartment(a), Ok(true));
    assert!(was_finalized(&finalized, in_a));
    assert!(!rt.is_live(in_a));
    assert!(rt.is_live(in_b));
    assert_eq!(rt.stats().compartment_collections.load(Ordering::Relaxed), 1);
    // Only full collections destroy compartments.
    assert!(rt.has_compartment(a));
    assert!(rt.has_compartment(b));
}

#[test]
fn test_wrapper_target_is_root_for_scoped_collection() {
    let rt = runtime();
    let a = rt.create_compartment(false);
    let b = rt.create_compartment(false);
    rt.set_compartment_hold(a, true).expect("hold");
    rt.set_compartment_hold(b, true).expect("hold");

    let target = rt.alloc(a, AllocKind::Object2).expect("alloc");
    let reached = rt.alloc(a, AllocKind::Object0).expect("alloc");
    rt.write_edge(target, SLOT0, Some(reached)).expect("edge");
    let wrapper = rt.alloc(b, AllocKind::Object2).expect("alloc");
    rt.write_edge(wrapper, SLOT0, Some(target)).expect("edge");
    rt.register_wrapper(wrapper, target).expect("wrapper");
    assert_eq!(rt.wrapper_for(b, target), Ok(Some(wrapper)));

    rt.gc_compartment(a).expect("gc");
    assert!(rt.is_live(target));
    assert!(rt.is_live(reached));

    // A full collection sees that nothing roots the wrapper.
    rt.gc().expect("gc");
    assert!(!rt.is_live(wrapper));
    assert!(!rt.is_live(target));
    assert!(!rt.is_live(reached));
    assert_eq!(rt.wrapper_for(b, target), Ok(None));
}

#[test]
fn test_wrapper_entry_dropped_when_target_dies() {
    let rt = runtime();
    let a = rt.create_compartment(false);
    let b = rt.create_compartment(false);
    rt.set_compartment_hold(a, true).expect("hold");
    rt.set_compartment_hold(b, true).expect("hold");
    let scope = rt.root_scope();

    let target = rt.alloc(a, AllocKind::Object0).expect("alloc");
    // The wrapper is rooted but does not hold its target.
    let wrapper = scope.root(rt.alloc(b, AllocKind::Object0).expect("alloc"));
    rt.register_wrapper(wrapper, target).expect("wrapper");

    rt.gc().expect("gc");
    assert!(rt.is_live(wrapper));
    assert!(!rt.is_live(target));
    assert_eq!(rt.wrapper_for(b, target), Ok(None));
}

#[test]
fn test_empty_compartments_destroyed_by_full_gc() {
    let rt = runtime();
    let destroyed = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&destroyed);
    rt.on_compartment_destroy(move |id| sink.borrow_mut().push(id));

    let busy = rt.create_compartment(false);
    let empty = rt.create_compartment(false);
    let drained = rt.create_compartment(true);
    let scope = rt.root_scope();
    scope.root(rt.alloc(busy, AllocKind::Script).expect("alloc"));
    rt.alloc(drained, AllocKind::Script).expect("alloc");

    rt.gc().expect("gc");
    let mut gone = destroyed.borrow().clone();
    gone.sort();
    assert_eq!(gone, vec![empty, drained]);
    assert!(rt.has_compartment(busy));
    assert!(rt.has_compartment(CompartmentId::ATOMS));
    assert_eq!(rt.compartment_count(), 2);
    assert_eq!(
        rt.set_compartment_hold(empty, true),
        Err(GcError::UnknownCompartment(empty))
    );
}

#[test]
fn test_system_compartments_use_separate_chunks() {
    let rt = runtime();
    let user = rt.create_compartment(false);
    let system = rt.create_compartment(true);
    let scope = rt.root_scope();
    let u = scope.root(rt.alloc(user, AllocKind::Object0).expect("alloc"));
    let s = scope.root(rt.alloc(system, AllocKind::Object0).expect("alloc"));

    let chunk_of = |cell: ember_gc::GcCell| cell.addr() & !ember_gc::heap::CHUNK_MASK;
    assert_ne!(chunk_of(u), chunk_of(s));
    assert_eq!(rt.chunk_count(), 2);
}

#[test]
fn test_atoms_scope_becomes_full_collection() {
    let rt = runtime();
    rt.collect(Some(CompartmentId::ATOMS), GcKind::Normal, GcReason::Api)
        .expect("gc");
    assert_eq!(rt.stats().collections.load(Ordering::Relaxed), 1);
    assert_eq!(rt.stats().compartment_collections.load(Ordering::Relaxed), 0);
}

#[test]
fn test_unknown_compartment_rejected() {
    let rt = runtime();
    let comp = rt.create_compartment(false);
    rt.gc().expect("gc");
    assert!(!rt.has_compartment(comp));
    assert_eq!(rt.gc_compartment(comp), Err(GcError::UnknownCompartment(comp)));
    assert_eq!(
        rt.alloc(comp, AllocKind::Object0),
        Err(GcError::UnknownCompartment(comp))
    );
}

#[test]
fn test_compartment_sweep_hook_sees_dying_things() {
    let rt = runtime();
    let comp = rt.create_compartment(false);
    rt.set_compartment_hold(comp, true).expect("hold");
    let scope = rt.root_scope();
    let live = scope.root(rt.alloc(comp, AllocKind::Shape).expect("alloc"));
    let dead = rt.alloc(comp, AllocKind::Shape).expect("alloc");

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    rt.on_compartment_sweep(move |id, liveness| {
        if id == comp {
            sink.borrow_mut().push((
                liveness.is_about_to_be_finalized(live),
                liveness.is_about_to_be_finalized(dead),
            ));
        }
    });

    rt.gc_compartment(comp).expect("gc");
    assert_eq!(*seen.borrow(), vec![(false, true)]);
}
