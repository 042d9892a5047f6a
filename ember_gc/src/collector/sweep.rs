//! Sweep phase.
//!
//! The order matters: weak structures and the atom table forget dying
//! things before any finalizer runs, and objects are finalized before the
//! strings, scripts and shapes they may still reference. Compartments left
//! empty are destroyed last.

use std::sync::Arc;

use crate::collector::{CycleContext, GcReason, GcState, release_arena};
use crate::compartment::{Compartment, CompartmentId};
use crate::config::GcConfig;
use crate::heap::GcHeap;
use crate::heap::arena::SweepOutcome;
use crate::heap::arena_lists::{ArenaList, BackgroundFinalizeState};
use crate::helper::{LentArenas, SweepJob};
use crate::kind::AllocKind;
use crate::stats::GcPhase;
use crate::trace::TraceHooks;
use crate::trigger::GcRequest;
use crate::weak::Liveness;

const OBJECT_KINDS: [AllocKind; 12] = [
    AllocKind::Object0,
    AllocKind::Object2,
    AllocKind::Object4,
    AllocKind::Object8,
    AllocKind::Object12,
    AllocKind::Object16,
    AllocKind::Object0Background,
    AllocKind::Object2Background,
    AllocKind::Object4Background,
    AllocKind::Object8Background,
    AllocKind::Object12Background,
    AllocKind::Object16Background,
];
const STRING_KINDS: [AllocKind; 3] = [
    AllocKind::ShortString,
    AllocKind::String,
    AllocKind::ExternalString,
];
const SCRIPT_KINDS: [AllocKind; 1] = [AllocKind::Script];
const SHAPE_KINDS: [AllocKind; 3] = [AllocKind::Shape, AllocKind::BaseShape, AllocKind::TypeObject];

/// Sweep every collected compartment.
///
/// With `background` set, background-finalizable kinds are lent to the
/// returned job instead of being finalized here.
pub(super) fn sweep_phase(
    state: &mut GcState,
    ctx: &CycleContext<'_>,
    request: &GcRequest,
    background: bool,
) -> Option<SweepJob> {
    let scope = request.scope;
    let stats = Arc::clone(&state.stats);
    let in_scope: Vec<CompartmentId> = match scope {
        Some(id) => vec![id],
        None => state.compartments.keys().copied().collect(),
    };

    {
        let GcState {
            heap,
            compartments,
            atoms,
            weak_maps,
            ..
        } = &mut *state;
        let liveness = Liveness::new(heap, scope);

        let weak_entries = weak_maps.sweep(&liveness);
        for weak in ctx.weak_roots {
            weak.borrow_mut().sweep(&liveness);
        }
        let dead_atoms = atoms.sweep(&liveness);
        tracing::trace!(weak_entries, dead_atoms, "weak structures swept");

        for &id in &in_scope {
            for hook in &ctx.callbacks.compartment_sweep {
                hook(id, &liveness);
            }
            if let Some(comp) = compartments.get_mut(&id) {
                comp.sweep_wrappers(|cell| liveness.is_about_to_be_finalized(cell));
            }
        }
    }

    let mut job = background.then(|| SweepJob::new(state.hooks.clone(), request.kind));
    let phases = [
        (GcPhase::SweepObject, &OBJECT_KINDS[..]),
        (GcPhase::SweepString, &STRING_KINDS[..]),
        (GcPhase::SweepScript, &SCRIPT_KINDS[..]),
        (GcPhase::SweepShape, &SHAPE_KINDS[..]),
    ];
    let mut finalized = 0;
    for (phase, kinds) in phases {
        let _timer = stats.phase(phase);
        let GcState {
            config,
            heap,
            compartments,
            hooks,
            ..
        } = &mut *state;
        for id in &in_scope {
            let Some(comp) = compartments.get_mut(id) else {
                continue;
            };
            for &kind in kinds {
                match job.as_mut() {
                    Some(job) if kind.is_background_finalized() => finalize_later(heap, comp, kind, job),
                    _ => finalized += finalize_now(heap, comp, kind, hooks, config),
                }
            }
        }
    }
    stats.record_finalized(finalized);

    if scope.is_none() {
        let _timer = stats.phase(GcPhase::Destroy);
        sweep_compartments(state, ctx, request.reason == GcReason::DestroyRuntime);
    }
    job
}

/// Finalize the arenas of `kind` on this thread.
fn finalize_now(
    heap: &mut GcHeap,
    comp: &mut Compartment,
    kind: AllocKind,
    hooks: &TraceHooks,
    config: &GcConfig,
) -> usize {
    let list = comp.arenas.take_list(kind);
    let mut full = Vec::new();
    let mut partial = Vec::new();
    let mut finalized = 0;
    for arena in list.into_arenas() {
        let Some(memory) = heap.memory(arena.chunk()).map(Arc::clone) else {
            debug_assert!(false, "{arena:?} has no chunk");
            continue;
        };
        let Some(header) = heap.header_mut(arena) else {
            debug_assert!(false, "{arena:?} on an arena list is not allocated");
            continue;
        };
        let (outcome, count) = header.finalize(&memory, hooks);
        finalized += count;
        match outcome {
            SweepOutcome::Empty => release_arena(heap, comp, arena, config, false),
            SweepOutcome::Partial => partial.push(arena),
            SweepOutcome::Full => full.push(arena),
        }
    }
    comp.arenas
        .set_list(kind, ArenaList::from_finalized(full, partial));
    comp.arenas
        .set_background_state(kind, BackgroundFinalizeState::Done);
    finalized
}

/// Lend the arenas of `kind` to the helper thread.
fn finalize_later(heap: &mut GcHeap, comp: &mut Compartment, kind: AllocKind, job: &mut SweepJob) {
    if comp.arenas.list(kind).is_empty() {
        return;
    }
    let list = comp.arenas.take_list(kind);
    let mut arenas = Vec::with_capacity(list.len());
    for arena in list.into_arenas() {
        let Some(chunk) = heap.chunk_mut(arena.chunk()) else {
            debug_assert!(false, "{arena:?} has no chunk");
            continue;
        };
        let memory = Arc::clone(&chunk.memory);
        arenas.push((chunk.lend_header(arena.index()), memory));
    }
    comp.arenas
        .set_background_state(kind, BackgroundFinalizeState::Run);
    job.lists.push(LentArenas {
        compartment: comp.id,
        kind,
        arenas,
    });
}

/// Destroy compartments with nothing left in them.
fn sweep_compartments(state: &mut GcState, ctx: &CycleContext<'_>, destroying: bool) {
    let dead: Vec<CompartmentId> = state
        .compartments
        .values()
        .filter(|c| {
            if destroying {
                !c.id.is_atoms() && c.arenas.are_empty()
            } else {
                c.is_collectable_empty()
            }
        })
        .map(|c| c.id)
        .collect();

    for id in dead {
        for hook in &ctx.callbacks.compartment_destroy {
            hook(id);
        }
        state.compartments.remove(&id);
        tracing::debug!(compartment = ?id, "compartment destroyed");
    }
}
