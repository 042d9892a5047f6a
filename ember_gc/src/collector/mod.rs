//! Collection driver.
//!
//! All chunk, arena, root and compartment state lives in [`GcState`] behind
//! the GC lock in [`GcShared`]. A collection runs with the lock held from
//! the moment background work has drained until the sweep job is handed to
//! the helper thread:
//!
//! 1. Wait for background sweeping and cancel background allocation
//! 2. Copy free lists back into their arenas
//! 3. Mark (see [`mark`])
//! 4. Sweep and finalize (see [`sweep`]), lending background-finalizable
//!    arenas to the helper thread
//! 5. Recompute triggers and hand the sweep job over

mod mark;
pub(crate) mod marker;
mod sweep;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::cell::{GcCell, ThingView};
use crate::compartment::{Compartment, CompartmentId};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::heap::arena::ArenaHeader;
use crate::heap::arena::SweepOutcome;
use crate::heap::arena_lists::ArenaList;
use crate::heap::chunk::ArenaSlot;
use crate::heap::platform::PageAllocator;
use crate::heap::{ARENA_SIZE, ArenaId, GcHeap};
use crate::helper::{self, GcHelper, HelperState};
use crate::kind::AllocKind;
use crate::roots::{ConservativeStats, RootRegistry};
use crate::stats::{GcPhase, GcStats};
use crate::trace::{TraceHooks, Tracer};
use crate::trigger::{GcRequest, GcSchedule, HeapTrigger};
use crate::weak::{AtomTable, Liveness, WeakMaps, WeakRoots};

// =============================================================================
// Public enums
// =============================================================================

/// How aggressively a collection returns memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcKind {
    /// Regular collection.
    #[default]
    Normal,
    /// Also expire every pooled chunk and decommit free arenas.
    Shrink,
}

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// Explicit request through the API.
    Api,
    /// Idle-time check decided to collect.
    MaybeGc,
    /// Allocation pushed a heap over its trigger.
    AllocTrigger,
    /// Allocation failed and is retrying after a full collection.
    LastDitch,
    /// The runtime is shutting down; nothing is rooted.
    DestroyRuntime,
}

/// Number of [`GcReason`] variants.
pub const GC_REASON_COUNT: usize = 5;

impl GcReason {
    /// Dense index for per-reason tables.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            GcReason::Api => 0,
            GcReason::MaybeGc => 1,
            GcReason::AllocTrigger => 2,
            GcReason::LastDitch => 3,
            GcReason::DestroyRuntime => 4,
        }
    }
}

/// Points in a collection at which status callbacks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    /// Before anything happens. Returning false vetoes the collection
    /// unless the runtime is being destroyed.
    Begin,
    /// Marking finished; mark bits are final.
    MarkEnd,
    /// Foreground finalization finished.
    FinalizeEnd,
    /// The collection is over and the GC lock released.
    End,
}

// =============================================================================
// Callbacks
// =============================================================================

pub(crate) type StatusCallback = Rc<dyn Fn(GcStatus) -> bool>;
pub(crate) type RootTracer = Rc<dyn Fn(&mut dyn Tracer)>;
pub(crate) type SweepHook = Rc<dyn Fn(CompartmentId, &Liveness<'_>)>;
pub(crate) type DestroyHook = Rc<dyn Fn(CompartmentId)>;

/// Embedder callbacks, cloned out of the runtime for each collection.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) status: Vec<StatusCallback>,
    pub(crate) black_roots: Vec<RootTracer>,
    pub(crate) gray_roots: Vec<RootTracer>,
    pub(crate) compartment_sweep: Vec<SweepHook>,
    pub(crate) compartment_destroy: Vec<DestroyHook>,
}

impl Callbacks {
    /// Fire `status` on every callback. Returns false if any vetoed.
    pub(crate) fn fire(&self, status: GcStatus) -> bool {
        let mut proceed = true;
        for callback in &self.status {
            proceed &= callback(status);
        }
        proceed
    }
}

/// Mutator-side inputs to one collection.
pub(crate) struct CycleContext<'a> {
    pub(crate) shadow_roots: &'a [GcCell],
    pub(crate) callbacks: &'a Callbacks,
    pub(crate) weak_roots: &'a [Rc<RefCell<dyn WeakRoots>>],
    /// Base of the native stack, for conservative scanning.
    pub(crate) stack_base: Option<usize>,
}

// =============================================================================
// Shared state
// =============================================================================

/// Everything protected by the GC lock.
pub(crate) struct GcState {
    pub(crate) config: GcConfig,
    pub(crate) heap: GcHeap,
    pub(crate) compartments: BTreeMap<CompartmentId, Compartment>,
    next_compartment: u32,
    pub(crate) hooks: TraceHooks,
    pub(crate) roots: RootRegistry,
    pub(crate) atoms: AtomTable,
    pub(crate) weak_maps: WeakMaps,
    pub(crate) schedule: GcSchedule,
    pub(crate) stats: Arc<GcStats>,
    pub(crate) last_conservative: ConservativeStats,
}

/// State shared between the mutator and the helper thread.
pub(crate) struct GcShared {
    pub(crate) state: Mutex<GcState>,
    pub(crate) stats: Arc<GcStats>,
    pub(crate) helper_state: AtomicU8,
    pub(crate) cancel_allocation: AtomicBool,
    pub(crate) shrink_requested: AtomicBool,
}

impl GcShared {
    pub(crate) fn new(state: GcState) -> Self {
        Self {
            stats: Arc::clone(&state.stats),
            state: Mutex::new(state),
            helper_state: AtomicU8::new(HelperState::Idle as u8),
            cancel_allocation: AtomicBool::new(false),
            shrink_requested: AtomicBool::new(false),
        }
    }
}

impl GcState {
    pub(crate) fn new(config: GcConfig, pages: Arc<dyn PageAllocator>, stats: Arc<GcStats>) -> Self {
        let heap = GcHeap::new(pages, HeapTrigger::new(&config), Arc::clone(&stats));
        let mut compartments = BTreeMap::new();
        compartments.insert(
            CompartmentId::ATOMS,
            Compartment::new(CompartmentId::ATOMS, true, &config),
        );
        Self {
            config,
            heap,
            compartments,
            next_compartment: 1,
            hooks: TraceHooks::new(),
            roots: RootRegistry::default(),
            atoms: AtomTable::default(),
            weak_maps: WeakMaps::default(),
            schedule: GcSchedule::default(),
            stats,
            last_conservative: ConservativeStats::default(),
        }
    }

    pub(crate) fn create_compartment(&mut self, is_system: bool) -> CompartmentId {
        let id = CompartmentId::from_raw(self.next_compartment);
        self.next_compartment += 1;
        self.compartments
            .insert(id, Compartment::new(id, is_system, &self.config));
        tracing::debug!(compartment = ?id, is_system, "compartment created");
        id
    }

    pub(crate) fn compartment(&self, id: CompartmentId) -> GcResult<&Compartment> {
        self.compartments
            .get(&id)
            .ok_or(GcError::UnknownCompartment(id))
    }

    pub(crate) fn compartment_mut(&mut self, id: CompartmentId) -> GcResult<&mut Compartment> {
        self.compartments
            .get_mut(&id)
            .ok_or(GcError::UnknownCompartment(id))
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate from the free list, the arena list, or a fresh arena.
    ///
    /// `Ok((None, _))` means the quota is exhausted or no chunk could be
    /// mapped; the caller collects and retries. The flag asks for the chunk
    /// pool to be refilled in the background.
    pub(crate) fn allocate(
        &mut self,
        compartment: CompartmentId,
        kind: AllocKind,
        can_background_allocate: bool,
    ) -> GcResult<(Option<GcCell>, bool)> {
        let GcState {
            config,
            heap,
            compartments,
            schedule,
            ..
        } = self;
        let comp = compartments
            .get_mut(&compartment)
            .ok_or(GcError::UnknownCompartment(compartment))?;

        if let Some(cell) = comp.arenas.allocate_from_free_list(kind) {
            return Ok((Some(cell), false));
        }
        if let Some(cell) = comp.arenas.allocate_from_list(kind, heap) {
            return Ok((Some(cell), false));
        }

        if config.max_bytes.saturating_sub(heap.trigger.gc_bytes) < ARENA_SIZE {
            return Ok((None, false));
        }
        let Some((chunk, want_background)) = heap.pick_chunk(comp.is_system, can_background_allocate) else {
            tracing::debug!(?compartment, ?kind, "chunk allocation failed");
            return Ok((None, false));
        };
        let Some(arena) = heap.allocate_arena(chunk, compartment, kind) else {
            return Ok((None, want_background));
        };

        comp.trigger.gc_bytes += ARENA_SIZE;
        if comp.trigger.is_over() {
            schedule.trigger_compartment_gc(compartment, GcReason::AllocTrigger, config.mode, &heap.trigger);
        } else if heap.trigger.is_over() {
            schedule.trigger_gc(GcReason::AllocTrigger);
        }

        let cell = comp.arenas.allocate_from_new_arena(kind, arena, heap);
        Ok((cell, want_background))
    }

    /// Return an arena to its chunk, debiting the compartment.
    pub(crate) fn release_arena(&mut self, arena: ArenaId, compartment: CompartmentId, background: bool) {
        let GcState {
            config,
            heap,
            compartments,
            ..
        } = self;
        match compartments.get_mut(&compartment) {
            Some(comp) => release_arena(heap, comp, arena, config, background),
            None => debug_assert!(false, "releasing {arena:?} of a destroyed {compartment:?}"),
        }
    }

    /// Reinstall headers finalized on the helper thread and relink the
    /// survivors.
    pub(crate) fn finish_lent_list(
        &mut self,
        compartment: CompartmentId,
        kind: AllocKind,
        results: Vec<(Box<ArenaHeader>, SweepOutcome)>,
    ) {
        let mut full = Vec::new();
        let mut partial = Vec::new();
        for (header, outcome) in results {
            let arena = header.address;
            match outcome {
                SweepOutcome::Empty => {
                    self.release_arena(arena, compartment, true);
                    continue;
                }
                SweepOutcome::Partial => partial.push(arena),
                SweepOutcome::Full => full.push(arena),
            }
            match self.heap.chunk_mut(arena.chunk()) {
                Some(chunk) => chunk.install_header(arena.index(), header),
                None => debug_assert!(false, "lent {arena:?} lost its chunk"),
            }
        }
        if let Some(comp) = self.compartments.get_mut(&compartment) {
            comp.arenas
                .finish_background_finalize(kind, ArenaList::from_finalized(full, partial));
        }
    }

    // =========================================================================
    // Cell validation
    // =========================================================================

    /// Kind of the allocated thing at `cell`.
    pub(crate) fn resolve(&self, cell: GcCell) -> GcResult<AllocKind> {
        let arena = cell.arena();
        let chunk = self.heap.chunk(cell.chunk()).ok_or(GcError::InvalidCell)?;
        match chunk.slot(arena.index()) {
            ArenaSlot::Allocated(header) => {
                let index = header.thing_index(cell).ok_or(GcError::InvalidCell)?;
                let free = header.in_free_list(index)
                    || self
                        .compartments
                        .get(&header.compartment)
                        .is_some_and(|c| c.arenas.free_list_contains(header.kind, arena, index));
                if free {
                    return Err(GcError::InvalidCell);
                }
                Ok(header.kind)
            }
            // Finalization on the helper thread owns the header; survivors
            // are still usable, so only the alignment can be checked.
            ArenaSlot::Sweeping { kind, .. } => {
                let offset = cell.arena_offset();
                if offset % kind.thing_size() != 0 || offset / kind.thing_size() >= kind.things_per_arena() {
                    return Err(GcError::InvalidCell);
                }
                Ok(*kind)
            }
            ArenaSlot::Free | ArenaSlot::Decommitting => Err(GcError::InvalidCell),
        }
    }

    /// View of the allocated thing at `cell`.
    pub(crate) fn thing(&self, cell: GcCell) -> GcResult<ThingView<'_>> {
        let kind = self.resolve(cell)?;
        let memory = self.heap.memory(cell.chunk()).ok_or(GcError::InvalidCell)?;
        let words = memory.thing_words(cell.addr(), kind.thing_size());
        Ok(ThingView::new(cell, kind, words))
    }

    /// Edges of the thing at `cell`, as reported by its trace hook.
    #[cfg(feature = "verify")]
    pub(crate) fn children(&self, cell: GcCell) -> GcResult<Vec<GcCell>> {
        let view = self.thing(cell)?;
        let mut tracer = crate::trace::CollectingTracer::default();
        self.hooks.trace_children(&view, &mut tracer);
        Ok(tracer.edges)
    }

    /// Compartment owning the thing at `cell`.
    pub(crate) fn compartment_of(&self, cell: GcCell) -> Option<CompartmentId> {
        match self.heap.chunk(cell.chunk())?.slot(cell.arena().index()) {
            ArenaSlot::Allocated(header) => Some(header.compartment),
            ArenaSlot::Sweeping { compartment, .. } => Some(*compartment),
            ArenaSlot::Free | ArenaSlot::Decommitting => None,
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Allocated things of `kind` in `compartment`, in list order.
    pub(crate) fn cells(&self, compartment: CompartmentId, kind: AllocKind) -> GcResult<Vec<GcCell>> {
        let comp = self.compartment(compartment)?;
        let mut cells = Vec::new();
        for &arena in comp.arenas.list(kind).arenas() {
            let Some(header) = self.heap.header(arena) else {
                continue;
            };
            for index in header.allocated_indices() {
                if comp.arenas.free_list_contains(kind, arena, index) {
                    continue;
                }
                if let Some(cell) = GcCell::from_word(header.thing_address(index)) {
                    cells.push(cell);
                }
            }
        }
        Ok(cells)
    }

    /// Number of allocated things in `compartment`.
    pub(crate) fn count_things(&self, compartment: CompartmentId) -> GcResult<usize> {
        let mut total = 0;
        for kind in AllocKind::ALL {
            total += self.cells(compartment, kind)?.len();
        }
        Ok(total)
    }
}

/// Return `arena` to its chunk and debit `comp`.
///
/// Arenas released by the helper thread also lower the triggers, since the
/// triggers were computed before those arenas were swept.
pub(crate) fn release_arena(
    heap: &mut GcHeap,
    comp: &mut Compartment,
    arena: ArenaId,
    config: &GcConfig,
    background: bool,
) {
    debug_assert!(comp.trigger.gc_bytes >= ARENA_SIZE);
    comp.trigger.gc_bytes -= ARENA_SIZE;
    if background {
        let amount = (config.heap_growth_factor * ARENA_SIZE as f64) as usize;
        heap.trigger.reduce_gc_trigger_bytes(amount, config);
        comp.trigger.reduce_gc_trigger_bytes(amount, config);
    }
    heap.release_arena(arena, comp.available_list());
}

// =============================================================================
// Cycle
// =============================================================================

/// Run one mark-and-sweep collection with the GC lock held.
pub(crate) fn gc_cycle(
    shared: &GcShared,
    guard: &mut MutexGuard<'_, GcState>,
    mut helper: Option<&mut GcHelper>,
    ctx: &CycleContext<'_>,
    request: GcRequest,
) {
    if let Some(helper) = helper.as_deref_mut() {
        helper.wait_background_sweep_end(guard);
        helper.wait_background_allocation_end(shared, guard);
    }

    let stats = Arc::clone(&shared.stats);
    let state = &mut **guard;
    debug_assert!(request.scope.is_none_or(|scope| !scope.is_atoms()));
    state.schedule.begin_collection();
    tracing::debug!(
        scope = ?request.scope,
        kind = ?request.kind,
        reason = ?request.reason,
        gc_bytes = state.heap.trigger.gc_bytes,
        "collection started"
    );

    for comp in state.compartments.values_mut() {
        comp.arenas.purge(&mut state.heap);
    }

    {
        let _span = tracing::debug_span!("mark").entered();
        let _timer = stats.phase(GcPhase::Mark);
        mark::mark_phase(state, ctx, &request);
    }
    ctx.callbacks.fire(GcStatus::MarkEnd);

    let background = helper.is_some()
        && state.config.background_finalization
        && request.reason != GcReason::DestroyRuntime;
    let job = {
        let _span = tracing::debug_span!("sweep").entered();
        let _timer = stats.phase(GcPhase::Sweep);
        sweep::sweep_phase(state, ctx, &request, background)
    };
    state.heap.chunk_allocation_since_last_gc = false;

    let shrink = request.kind == GcKind::Shrink;
    if job.is_none() {
        let _timer = stats.phase(GcPhase::Destroy);
        helper::expire_chunks_and_arenas(guard, shrink);
    }
    ctx.callbacks.fire(GcStatus::FinalizeEnd);

    let state = &mut **guard;
    let GcState {
        config,
        heap,
        compartments,
        schedule,
        ..
    } = state;
    heap.trigger
        .set_gc_last_bytes(heap.trigger.gc_bytes, request.kind, config);
    for comp in compartments.values_mut() {
        comp.trigger
            .set_gc_last_bytes(comp.trigger.gc_bytes, request.kind, config);
    }
    schedule.end_collection(Instant::now(), config.idle_full_span);
    stats.record_collection(request.scope.is_some(), request.kind, request.reason);
    tracing::debug!(
        gc_bytes = heap.trigger.gc_bytes,
        gc_trigger_bytes = heap.trigger.gc_trigger_bytes,
        chunks = heap.chunk_count(),
        "collection finished"
    );

    if let (Some(job), Some(helper)) = (job, helper) {
        if let Err(job) = helper.start_background_sweep(job) {
            tracing::warn!("helper thread gone; sweeping on the collecting thread");
            MutexGuard::unlocked(guard, || helper::run_sweep_job(shared, job));
        }
    }
}
