//! Write-barrier verification and the stack-root checker.

#![cfg(feature = "verify")]

mod common;

use common::{SLOT0, runtime_with};
use ember_gc::verify::is_poisoned;
use ember_gc::{AllocKind, BarrierViolation, GcConfig, Runtime};

fn verifying_runtime() -> Runtime {
    runtime_with(GcConfig {
        verify_barriers: true,
        ..GcConfig::for_testing()
    })
}

#[test]
fn test_barriered_writes_pass() {
    let rt = verifying_runtime();
    let comp = rt.create_compartment(false);
    let scope = rt.root_scope();
    let holder = scope.root(rt.alloc(comp, AllocKind::Object2).expect("alloc"));
    let old = rt.alloc(comp, AllocKind::Object0).expect("alloc");
    let new = rt.alloc(comp, AllocKind::Object0).expect("alloc");
    rt.write_edge(holder, SLOT0, Some(old)).expect("edge");

    assert_eq!(rt.start_barrier_verification(), Ok(true));
    assert_eq!(rt.start_barrier_verification(), Ok(false));
    rt.write_edge(holder, SLOT0, Some(new)).expect("edge");
    let report = rt
        .finish_barrier_verification()
        .expect("finish")
        .expect("report");
    assert!(report.is_clean());
    assert_eq!(report.nodes, 2);
    assert_eq!(report.edges, 1);
}

#[test]
fn test_raw_overwrite_of_edge_is_reported() {
    let rt = verifying_runtime();
    let comp = rt.create_compartment(false);
    let scope = rt.root_scope();
    let holder = scope.root(rt.alloc(comp, AllocKind::Object2).expect("alloc"));
    let target = rt.alloc(comp, AllocKind::Object0).expect("alloc");
    rt.write_edge(holder, SLOT0 + 1, Some(target)).expect("edge");

    assert_eq!(rt.start_barrier_verification(), Ok(true));
    rt.write_word(holder, SLOT0 + 1, 0).expect("write");
    let report = rt
        .finish_barrier_verification()
        .expect("finish")
        .expect("report");
    assert_eq!(
        report.violations,
        vec![BarrierViolation {
            source: holder,
            target,
        }]
    );
}

#[test]
fn test_collection_ends_verification() {
    let rt = verifying_runtime();
    assert_eq!(rt.start_barrier_verification(), Ok(true));
    rt.gc().expect("gc");
    assert_eq!(rt.finish_barrier_verification(), Ok(None));
}

#[test]
fn test_verification_needs_config() {
    let rt = runtime_with(GcConfig::for_testing());
    assert_eq!(rt.start_barrier_verification(), Ok(false));
}

#[test]
fn test_unrooted_stack_words_poisoned() {
    let rt = verifying_runtime();
    let comp = rt.create_compartment(false);
    let scope = rt.root_scope();
    let rooted = scope.root(rt.alloc(comp, AllocKind::Shape).expect("alloc"));
    let loose = rt.alloc(comp, AllocKind::Shape).expect("alloc");
    let pinned = rt.alloc(comp, AllocKind::Shape).expect("alloc");
    assert!(rt.lock_thing(pinned));

    let mut words = [rooted.addr(), loose.addr(), pinned.addr(), 7, 0];
    assert_eq!(rt.check_stack_roots(&mut words), Ok(1));
    assert!(!is_poisoned(words[0]));
    assert!(is_poisoned(words[1]));
    assert!(!is_poisoned(words[2]));
    assert_eq!(&words[3..], &[7, 0]);
}
