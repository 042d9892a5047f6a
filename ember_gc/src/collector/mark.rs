//! Root discovery and transitive marking.

use std::sync::atomic::Ordering;

use crate::cell::GcCell;
use crate::collector::marker::GcMarker;
use crate::collector::{CycleContext, GcReason, GcState};
use crate::heap::arena::MarkColor;
use crate::roots::conservative;
use crate::trigger::GcRequest;
use crate::weak::WeakMaps;

/// Mark everything reachable from the roots.
///
/// Black roots, in order: conservative stack words, named roots, locked
/// things, wrapper targets held by uncollected compartments, atoms, the
/// shadow stack and embedder black tracers. Gray tracers run once black
/// marking, including weak structures, has reached a fixed point.
pub(super) fn mark_phase(state: &mut GcState, ctx: &CycleContext<'_>, request: &GcRequest) {
    let scope = request.scope;
    let destroying = request.reason == GcReason::DestroyRuntime;

    state.heap.clear_marks();

    let stack_roots: Vec<GcCell> = if destroying {
        Vec::new()
    } else {
        let (cells, scan) = conservative::native_stack_roots(state, scope, ctx.stack_base);
        state.last_conservative = scan;
        cells
    };

    let GcState {
        config,
        heap,
        compartments,
        hooks,
        roots,
        atoms,
        weak_maps,
        stats,
        ..
    } = state;
    let mut marker = GcMarker::new(heap, hooks, scope, config.mark_stack_limit);

    if !destroying {
        for cell in stack_roots {
            marker.mark(cell);
        }
        roots.trace_named(&mut marker);
        roots.trace_locked(&mut marker);
        if let Some(scope) = scope {
            for comp in compartments.values().filter(|c| c.id != scope) {
                for &target in comp.wrappers.keys() {
                    marker.mark(target);
                }
            }
        }
        atoms.trace(&mut marker);
        for &cell in ctx.shadow_roots {
            marker.mark(cell);
        }
        for tracer in &ctx.callbacks.black_roots {
            tracer(&mut marker);
        }
    }
    drain_to_fixed_point(&mut marker, weak_maps, ctx);

    if !destroying && !ctx.callbacks.gray_roots.is_empty() {
        marker.set_color(MarkColor::Gray);
        for tracer in &ctx.callbacks.gray_roots {
            tracer(&mut marker);
        }
        drain_to_fixed_point(&mut marker, weak_maps, ctx);
    }

    stats
        .delayed_marking_arenas
        .fetch_add(marker.delayed_arenas as u64, Ordering::Relaxed);
    tracing::trace!(marked = marker.marked, delayed = marker.delayed_arenas, "marking done");
}

/// Drain, then iterate weak structures until a pass marks nothing new.
fn drain_to_fixed_point(
    marker: &mut GcMarker<'_>,
    weak_maps: &WeakMaps,
    ctx: &CycleContext<'_>,
) {
    loop {
        marker.drain();
        let mut progressed = weak_maps.mark_iteratively(&mut *marker);
        for weak in ctx.weak_roots {
            progressed |= weak.borrow_mut().mark_iteratively(&mut *marker);
        }
        if !progressed {
            break;
        }
    }
}
