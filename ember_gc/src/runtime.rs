//! The runtime: the single entry point to the collector.
//!
//! A [`Runtime`] owns the heap, the compartments, every root table and the
//! background helper thread. It is tied to the thread that created it
//! (neither `Send` nor `Sync`); the only other thread touching the heap is
//! its own helper, which synchronizes through the GC lock.
//!
//! # Example
//!
//! ```ignore
//! use ember_gc::{AllocKind, GcConfig, Runtime, TraceKind};
//!
//! let rt = Runtime::new(GcConfig::default())?;
//! rt.set_trace_hook(TraceKind::Object, |view, tracer| {
//!     for i in 4..view.len() {
//!         tracer.trace_word(view.word(i));
//!     }
//! })?;
//!
//! let comp = rt.create_compartment(false);
//! let scope = rt.root_scope();
//! let list = scope.root(rt.alloc(comp, AllocKind::Object2)?);
//! let item = rt.alloc(comp, AllocKind::Object0)?;
//! rt.write_edge(list, 4, Some(item))?;
//! rt.gc()?;
//! assert!(rt.is_live(item));
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::MutexGuard;

use crate::cell::{GcCell, ThingView};
use crate::collector::{
    self, Callbacks, CycleContext, GcKind, GcReason, GcShared, GcState, GcStatus,
};
use crate::compartment::CompartmentId;
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::heap::ARENA_SIZE;
use crate::heap::platform::{PageAllocator, SystemPages};
use crate::helper::{self, GcHelper, HelperState};
use crate::kind::{AllocKind, TraceKind};
use crate::roots::{ConservativeStats, RootScope, ShadowStack};
use crate::stats::GcStats;
use crate::trace::Tracer;
use crate::trigger::{GcRequest, MaybeGcInput};
use crate::weak::{Liveness, WeakMapId, WeakRoots};

#[cfg(feature = "verify")]
use crate::verify::{self, BarrierReport, BarrierVerifier};

/// A garbage-collected heap and everything rooted in it.
pub struct Runtime {
    shared: Arc<GcShared>,
    config: GcConfig,
    helper: RefCell<Option<GcHelper>>,
    can_background_allocate: bool,
    shadow: ShadowStack,
    callbacks: RefCell<Callbacks>,
    weak_roots: RefCell<Vec<Rc<RefCell<dyn WeakRoots>>>>,
    /// Set from the begin callback until the end callback returns.
    collecting: Cell<bool>,
    /// Set while a cycle holds the GC lock.
    in_cycle: Cell<bool>,
    native_stack_base: Cell<Option<usize>>,
    #[cfg(feature = "verify")]
    verifier: RefCell<Option<BarrierVerifier>>,
}

/// Keeps every atom alive while held. See [`Runtime::keep_atoms`].
pub struct KeepAtoms<'rt> {
    shared: &'rt GcShared,
}

impl Drop for KeepAtoms<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        debug_assert!(state.atoms.keep_atoms > 0);
        state.atoms.keep_atoms -= 1;
    }
}

impl fmt::Debug for KeepAtoms<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeepAtoms")
    }
}

/// Clears a flag on drop.
struct FlagGuard<'a>(&'a Cell<bool>);

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Runtime {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a runtime backed by the system page allocator.
    pub fn new(config: GcConfig) -> GcResult<Self> {
        Self::with_page_allocator(config, Arc::new(SystemPages))
    }

    /// Create a runtime that maps chunks through `pages`.
    ///
    /// Fails only on an invalid configuration. If the helper thread cannot
    /// be started, all background work runs on the calling thread instead.
    pub fn with_page_allocator(config: GcConfig, pages: Arc<dyn PageAllocator>) -> GcResult<Self> {
        config.validate()?;
        let stats = Arc::new(GcStats::new());
        let wants_helper = config.background_finalization || config.background_allocation;
        let can_background_allocate = config.background_allocation && helper::can_background_allocate();
        let shared = Arc::new(GcShared::new(GcState::new(config.clone(), pages, stats)));

        let helper = if wants_helper {
            GcHelper::spawn(Arc::clone(&shared)).ok()
        } else {
            None
        };
        tracing::debug!(
            helper = helper.is_some(),
            can_background_allocate,
            mode = ?config.mode,
            "runtime created"
        );

        Ok(Self {
            shared,
            config,
            helper: RefCell::new(helper),
            can_background_allocate,
            shadow: ShadowStack::default(),
            callbacks: RefCell::new(Callbacks::default()),
            weak_roots: RefCell::new(Vec::new()),
            collecting: Cell::new(false),
            in_cycle: Cell::new(false),
            native_stack_base: Cell::new(None),
            #[cfg(feature = "verify")]
            verifier: RefCell::new(None),
        })
    }

    /// Take the GC lock, refusing while a collection holds it on this
    /// thread.
    fn state(&self) -> GcResult<MutexGuard<'_, GcState>> {
        if self.in_cycle.get() {
            return Err(GcError::CollectionInProgress);
        }
        Ok(self.shared.state.lock())
    }

    /// Take the GC lock once the helper thread has relinked every arena it
    /// was lent, so dying things are gone and survivors are back on their
    /// lists.
    fn swept_state(&self) -> GcResult<MutexGuard<'_, GcState>> {
        let mut guard = self.state()?;
        if let Some(helper) = self.helper.borrow_mut().as_mut() {
            helper.wait_background_sweep_end(&mut guard);
        }
        Ok(guard)
    }

    /// Configuration the runtime was created with.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Collector statistics.
    pub fn stats(&self) -> &GcStats {
        &self.shared.stats
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Install the trace hook for things of `kind`.
    ///
    /// The hook reports every edge a thing holds. Things of a kind without a
    /// hook have no edges.
    pub fn set_trace_hook<F>(&self, kind: TraceKind, hook: F) -> GcResult<()>
    where
        F: Fn(&ThingView<'_>, &mut dyn Tracer) + Send + Sync + 'static,
    {
        self.state()?.hooks.set_trace(kind, hook);
        Ok(())
    }

    /// Install the finalize hook for things of `kind`.
    ///
    /// Finalizers of background-finalized kinds run on the helper thread and
    /// must not touch the runtime.
    pub fn set_finalize_hook<F>(&self, kind: TraceKind, hook: F) -> GcResult<()>
    where
        F: Fn(&ThingView<'_>) + Send + Sync + 'static,
    {
        self.state()?.hooks.set_finalize(kind, hook);
        Ok(())
    }

    // =========================================================================
    // Compartments
    // =========================================================================

    /// Create a compartment.
    ///
    /// A compartment with no live things and no hold is destroyed by the
    /// next full collection. System compartments allocate from their own
    /// chunks.
    pub fn create_compartment(&self, is_system: bool) -> CompartmentId {
        self.shared.state.lock().create_compartment(is_system)
    }

    /// Keep an empty compartment from being destroyed.
    pub fn set_compartment_hold(&self, compartment: CompartmentId, hold: bool) -> GcResult<()> {
        self.state()?.compartment_mut(compartment)?.hold = hold;
        Ok(())
    }

    /// Whether `compartment` still exists.
    pub fn has_compartment(&self, compartment: CompartmentId) -> bool {
        self.shared.state.lock().compartments.contains_key(&compartment)
    }

    /// Number of live compartments, including the atoms compartment.
    pub fn compartment_count(&self) -> usize {
        self.shared.state.lock().compartments.len()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a zeroed thing of `kind` in `compartment`.
    ///
    /// Runs a pending triggered collection first. When no arena can be
    /// found, waits for background sweeping, then runs one last-ditch full
    /// collection and retries before failing.
    pub fn alloc(&self, compartment: CompartmentId, kind: AllocKind) -> GcResult<GcCell> {
        let pending = {
            let state = self.state()?;
            state.compartment(compartment)?;
            let scope = state
                .schedule
                .trigger_compartment
                .filter(|id| state.compartments.contains_key(id));
            state
                .schedule
                .is_needed
                .then_some((scope, state.schedule.trigger_reason))
        };
        if let Some((scope, reason)) = pending {
            self.collect_for_alloc(compartment, scope, reason)?;
        }

        let mut ran_last_ditch = false;
        loop {
            // The helper may return arenas between a failed attempt and the
            // wait, so always try twice.
            for attempt in 0..2 {
                if let Some(cell) = self.try_allocate(compartment, kind)? {
                    return Ok(cell);
                }
                if attempt == 0 {
                    self.wait_background_sweep_end();
                }
            }
            if ran_last_ditch {
                break;
            }
            tracing::debug!(?compartment, ?kind, "allocation failed, running last-ditch collection");
            self.collect_for_alloc(compartment, None, GcReason::LastDitch)?;
            ran_last_ditch = true;
        }

        let state = self.state()?;
        let gc_bytes = state.heap.trigger.gc_bytes;
        let max_bytes = state.config.max_bytes;
        if max_bytes.saturating_sub(gc_bytes) >= ARENA_SIZE {
            tracing::warn!(?kind, gc_bytes, "chunk allocation failed after last-ditch collection");
            return Err(GcError::ChunkAllocationFailed);
        }
        tracing::warn!(?kind, gc_bytes, max_bytes, "out of memory after last-ditch collection");
        Err(GcError::OutOfMemory {
            requested_kind: kind,
            gc_bytes,
            max_bytes,
        })
    }

    /// Collect on behalf of an allocation in `compartment`, keeping atoms and
    /// the compartment itself alive even if it is still empty.
    fn collect_for_alloc(
        &self,
        compartment: CompartmentId,
        scope: Option<CompartmentId>,
        reason: GcReason,
    ) -> GcResult<()> {
        let held = {
            let mut state = self.state()?;
            let comp = state.compartment_mut(compartment)?;
            std::mem::replace(&mut comp.hold, true)
        };
        let _keep = self.keep_atoms();
        let result = self.collect(scope, GcKind::Normal, reason);
        if let Ok(comp) = self.shared.state.lock().compartment_mut(compartment) {
            comp.hold = held;
        }
        result.map(|_| ())
    }

    fn try_allocate(&self, compartment: CompartmentId, kind: AllocKind) -> GcResult<Option<GcCell>> {
        let mut state = self.state()?;
        let (cell, want_background) = state.allocate(compartment, kind, self.can_background_allocate)?;
        if want_background {
            if let Some(helper) = self.helper.borrow_mut().as_mut() {
                helper.start_background_allocation();
            }
        }
        let Some(cell) = cell else {
            return Ok(None);
        };
        let view = state.thing(cell)?;
        for index in 0..view.len() {
            view.set_word(index, 0);
        }
        self.shared
            .stats
            .things_allocated
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(Some(cell))
    }

    // =========================================================================
    // Fields
    // =========================================================================

    fn field<'s>(state: &'s GcState, cell: GcCell, index: usize) -> GcResult<ThingView<'s>> {
        let view = state.thing(cell)?;
        if index >= view.len() {
            return Err(GcError::FieldOutOfBounds {
                index,
                words: view.len(),
            });
        }
        Ok(view)
    }

    /// Read a plain data word.
    pub fn read_word(&self, cell: GcCell, index: usize) -> GcResult<usize> {
        let state = self.state()?;
        Ok(Self::field(&state, cell, index)?.word(index))
    }

    /// Write a plain data word. Words written here must not be edges, or
    /// the barrier verifier will miss them.
    pub fn write_word(&self, cell: GcCell, index: usize, word: usize) -> GcResult<()> {
        let state = self.state()?;
        Self::field(&state, cell, index)?.set_word(index, word);
        Ok(())
    }

    /// Read an edge.
    pub fn read_edge(&self, cell: GcCell, index: usize) -> GcResult<Option<GcCell>> {
        let state = self.state()?;
        Ok(Self::field(&state, cell, index)?.edge(index))
    }

    /// Store an edge, running the pre-write barrier on the old target.
    pub fn write_edge(&self, cell: GcCell, index: usize, edge: Option<GcCell>) -> GcResult<()> {
        let state = self.swept_state()?;
        let view = Self::field(&state, cell, index)?;
        if let Some(target) = edge {
            state.resolve(target)?;
        }
        self.pre_write_barrier(view.edge(index));
        view.set_word(index, GcCell::edge_word(edge));
        Ok(())
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// Register `cell` as a root until [`remove_root`](Self::remove_root).
    /// Returns false if `cell` is not an allocated thing.
    pub fn add_root(&self, cell: GcCell, name: Option<&str>) -> bool {
        let Ok(mut state) = self.swept_state() else {
            return false;
        };
        if state.resolve(cell).is_err() {
            return false;
        }
        state.roots.add_root(cell, name);
        true
    }

    /// Unregister a root. Returns false if it was not registered.
    pub fn remove_root(&self, cell: GcCell) -> bool {
        self.shared.state.lock().roots.remove_root(cell)
    }

    /// Pin `cell`. Pins are counted; each needs a matching
    /// [`unlock_thing`](Self::unlock_thing).
    pub fn lock_thing(&self, cell: GcCell) -> bool {
        let Ok(mut state) = self.swept_state() else {
            return false;
        };
        if state.resolve(cell).is_err() {
            return false;
        }
        state.roots.lock(cell);
        true
    }

    /// Drop one pin. Returns false if `cell` was not pinned.
    pub fn unlock_thing(&self, cell: GcCell) -> bool {
        self.shared.state.lock().roots.unlock(cell)
    }

    /// Open a scope whose rooted cells survive until it is dropped.
    pub fn root_scope(&self) -> RootScope<'_> {
        RootScope::new(&self.shadow)
    }

    /// Record the base of the native stack for conservative scanning,
    /// usually the address of a local in the outermost frame that uses the
    /// runtime.
    pub fn set_native_stack_base(&self, base: usize) {
        self.native_stack_base.set(Some(base));
    }

    /// Classification of the words seen by the last conservative scan.
    pub fn conservative_stats(&self) -> ConservativeStats {
        self.shared.state.lock().last_conservative
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Collect `scope` (everything when `None`).
    ///
    /// Returns `Ok(false)` when the collection did not run: a collection is
    /// already in progress, or a begin callback vetoed it.
    pub fn collect(&self, scope: Option<CompartmentId>, kind: GcKind, reason: GcReason) -> GcResult<bool> {
        if self.collecting.get() {
            return Ok(false);
        }
        // The atoms compartment is only collected with everything else.
        let scope = scope.filter(|id| !id.is_atoms());
        if let Some(id) = scope {
            self.state()?.compartment(id)?;
        }

        let _collecting = FlagGuard::set(&self.collecting);
        let callbacks = self.callbacks.borrow().clone();
        if !callbacks.fire(GcStatus::Begin) && reason != GcReason::DestroyRuntime {
            self.shared
                .stats
                .vetoed_collections
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!(?reason, "collection vetoed");
            return Ok(false);
        }

        self.abandon_barrier_verification();

        let shadow_roots = self.shadow.snapshot();
        let weak_roots = self.weak_roots.borrow().clone();
        let ctx = CycleContext {
            shadow_roots: &shadow_roots,
            callbacks: &callbacks,
            weak_roots: &weak_roots,
            stack_base: self.native_stack_base.get(),
        };
        {
            let mut guard = self.shared.state.lock();
            let mut helper = self.helper.borrow_mut();
            let _in_cycle = FlagGuard::set(&self.in_cycle);
            collector::gc_cycle(
                &self.shared,
                &mut guard,
                helper.as_mut(),
                &ctx,
                GcRequest {
                    scope,
                    kind,
                    reason,
                },
            );
        }
        callbacks.fire(GcStatus::End);
        Ok(true)
    }

    /// Full collection.
    pub fn gc(&self) -> GcResult<bool> {
        self.collect(None, GcKind::Normal, GcReason::Api)
    }

    /// Collection of one compartment.
    pub fn gc_compartment(&self, compartment: CompartmentId) -> GcResult<bool> {
        self.collect(Some(compartment), GcKind::Normal, GcReason::Api)
    }

    /// Full collection that also releases pooled chunks and decommits free
    /// arenas.
    pub fn shrinking_gc(&self) -> GcResult<bool> {
        self.collect(None, GcKind::Shrink, GcReason::Api)
    }

    /// Idle-time check: run a pending or nearly-due collection, or a
    /// shrinking one after a quiet period. `current` is the compartment the
    /// embedder is running in. Returns whether a collection ran.
    pub fn maybe_gc(&self, current: CompartmentId) -> GcResult<bool> {
        let request = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let compartment = state
                .compartments
                .get(&current)
                .ok_or(GcError::UnknownCompartment(current))?;
            let input = MaybeGcInput {
                current,
                compartment: &compartment.trigger,
                config: &state.config,
                chunk_allocation_since_last_gc: state.heap.chunk_allocation_since_last_gc,
                num_arenas_free_committed: state.heap.num_arenas_free_committed(),
            };
            state.schedule.maybe_gc(input, Instant::now())
        };
        match request {
            Some(request) => self.collect(request.scope, request.kind, request.reason),
            None => Ok(false),
        }
    }

    /// Release pooled chunks and decommit free arenas without collecting.
    /// Runs on the helper thread when there is one.
    pub fn shrink_buffers(&self) -> GcResult<()> {
        let mut guard = self.state()?;
        match self.helper.borrow_mut().as_mut() {
            Some(helper) => helper.start_background_shrink(),
            None => helper::expire_chunks_and_arenas(&mut guard, true),
        }
        Ok(())
    }

    /// Block until the helper thread has relinked every arena it was lent.
    pub fn wait_background_sweep_end(&self) {
        let mut helper = self.helper.borrow_mut();
        if let Some(helper) = helper.as_mut() {
            let mut guard = self.shared.state.lock();
            helper.wait_background_sweep_end(&mut guard);
        }
    }

    /// What the helper thread is doing; `Shutdown` when there is none.
    pub fn helper_state(&self) -> HelperState {
        if self.helper.borrow().is_none() {
            return HelperState::Shutdown;
        }
        HelperState::load(&self.shared.helper_state)
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Add a status callback. Returning false from [`GcStatus::Begin`]
    /// vetoes the collection unless the runtime is being destroyed; the
    /// return value is ignored otherwise.
    ///
    /// `MarkEnd` and `FinalizeEnd` fire with the GC lock held; callbacks
    /// must not call back into the runtime.
    pub fn on_gc_status<F>(&self, callback: F)
    where
        F: Fn(GcStatus) -> bool + 'static,
    {
        self.callbacks.borrow_mut().status.push(Rc::new(callback));
    }

    /// Add a tracer for embedder roots, marked black.
    pub fn add_black_root_tracer<F>(&self, tracer: F)
    where
        F: Fn(&mut dyn Tracer) + 'static,
    {
        self.callbacks.borrow_mut().black_roots.push(Rc::new(tracer));
    }

    /// Add a tracer for embedder roots, marked gray once black marking is
    /// complete.
    pub fn add_gray_root_tracer<F>(&self, tracer: F)
    where
        F: Fn(&mut dyn Tracer) + 'static,
    {
        self.callbacks.borrow_mut().gray_roots.push(Rc::new(tracer));
    }

    /// Add a hook run for each collected compartment before finalization.
    pub fn on_compartment_sweep<F>(&self, hook: F)
    where
        F: Fn(CompartmentId, &Liveness<'_>) + 'static,
    {
        self.callbacks.borrow_mut().compartment_sweep.push(Rc::new(hook));
    }

    /// Add a hook run when an empty compartment is destroyed.
    pub fn on_compartment_destroy<F>(&self, hook: F)
    where
        F: Fn(CompartmentId) + 'static,
    {
        self.callbacks
            .borrow_mut()
            .compartment_destroy
            .push(Rc::new(hook));
    }

    // =========================================================================
    // Wrappers and weak structures
    // =========================================================================

    /// Record that `wrapper` stands for `target` in the wrapper's
    /// compartment. A collection scoped to the target's compartment treats
    /// the target as a root while the wrapper's compartment holds it.
    pub fn register_wrapper(&self, wrapper: GcCell, target: GcCell) -> GcResult<()> {
        let mut state = self.swept_state()?;
        state.resolve(wrapper)?;
        state.resolve(target)?;
        let owner = state.compartment_of(wrapper).ok_or(GcError::InvalidCell)?;
        state.compartment_mut(owner)?.wrappers.insert(target, wrapper);
        Ok(())
    }

    /// Wrapper for `target` registered in `compartment`.
    pub fn wrapper_for(&self, compartment: CompartmentId, target: GcCell) -> GcResult<Option<GcCell>> {
        let state = self.state()?;
        Ok(state.compartment(compartment)?.wrappers.get(&target).copied())
    }

    /// Create an empty weak map.
    pub fn create_weak_map(&self) -> WeakMapId {
        self.shared.state.lock().weak_maps.create()
    }

    /// Destroy a weak map. Returns false if it did not exist.
    pub fn destroy_weak_map(&self, map: WeakMapId) -> bool {
        self.shared.state.lock().weak_maps.destroy(map)
    }

    /// Map `key` to `value`. The value is kept alive only while the key is.
    pub fn weak_map_set(&self, map: WeakMapId, key: GcCell, value: GcCell) -> GcResult<()> {
        let mut state = self.swept_state()?;
        state.resolve(key)?;
        state.resolve(value)?;
        state
            .weak_maps
            .get_map_mut(map)
            .ok_or(GcError::UnknownWeakMap(map))?
            .insert(key, value);
        Ok(())
    }

    /// Value for `key`, if the entry is still present.
    pub fn weak_map_get(&self, map: WeakMapId, key: GcCell) -> GcResult<Option<GcCell>> {
        let state = self.state()?;
        let entries = state
            .weak_maps
            .get_map(map)
            .ok_or(GcError::UnknownWeakMap(map))?;
        Ok(entries.get(&key).copied())
    }

    /// Remove the entry for `key`, returning its value.
    pub fn weak_map_remove(&self, map: WeakMapId, key: GcCell) -> GcResult<Option<GcCell>> {
        let mut state = self.state()?;
        let entries = state
            .weak_maps
            .get_map_mut(map)
            .ok_or(GcError::UnknownWeakMap(map))?;
        Ok(entries.remove(&key))
    }

    /// Number of entries in a weak map.
    pub fn weak_map_len(&self, map: WeakMapId) -> GcResult<usize> {
        let state = self.state()?;
        state
            .weak_maps
            .get_map(map)
            .map(|entries| entries.len())
            .ok_or(GcError::UnknownWeakMap(map))
    }

    /// Register an embedder weak table, marked to a fixed point and swept
    /// with the built-in weak maps.
    pub fn add_weak_roots<W>(&self, roots: Rc<RefCell<W>>)
    where
        W: WeakRoots + 'static,
    {
        self.weak_roots.borrow_mut().push(roots);
    }

    // =========================================================================
    // Atoms
    // =========================================================================

    /// Intern `text` as a `String` thing in the atoms compartment. Word 0
    /// holds the byte length. Pinned atoms are always roots.
    pub fn atomize(&self, text: &str, pin: bool) -> GcResult<GcCell> {
        if let Some(cell) = self.state()?.atoms.lookup(text, pin) {
            return Ok(cell);
        }
        let cell = {
            let _keep = self.keep_atoms();
            self.alloc(CompartmentId::ATOMS, AllocKind::String)?
        };
        let mut state = self.state()?;
        state.thing(cell)?.set_word(0, text.len());
        state.atoms.insert(text, cell, pin);
        Ok(cell)
    }

    /// Text of an atom.
    pub fn atom_text(&self, cell: GcCell) -> Option<String> {
        self.shared.state.lock().atoms.text(cell).map(str::to_owned)
    }

    /// Number of interned atoms.
    pub fn atom_count(&self) -> usize {
        self.shared.state.lock().atoms.len()
    }

    /// Treat every atom as a root until the guard drops.
    pub fn keep_atoms(&self) -> KeepAtoms<'_> {
        self.shared.state.lock().atoms.keep_atoms += 1;
        KeepAtoms {
            shared: &self.shared,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether `cell` addresses an allocated thing that survived the last
    /// collection.
    pub fn is_live(&self, cell: GcCell) -> bool {
        self.swept_state()
            .is_ok_and(|state| state.resolve(cell).is_ok())
    }

    /// Whether the last collection marked `cell` (black or gray).
    pub fn is_marked(&self, cell: GcCell) -> bool {
        let Ok(state) = self.swept_state() else {
            return false;
        };
        state.heap.header(cell.arena()).is_some_and(|header| {
            header
                .thing_index(cell)
                .is_some_and(|index| header.is_marked(index))
        })
    }

    /// Whether the last collection marked `cell` gray only.
    pub fn is_gray(&self, cell: GcCell) -> bool {
        let Ok(state) = self.swept_state() else {
            return false;
        };
        state.heap.header(cell.arena()).is_some_and(|header| {
            header
                .thing_index(cell)
                .is_some_and(|index| header.is_gray(index))
        })
    }

    /// Kind of the thing at `cell`.
    pub fn kind_of(&self, cell: GcCell) -> GcResult<AllocKind> {
        self.swept_state()?.resolve(cell)
    }

    /// Compartment owning the thing at `cell`.
    pub fn compartment_of(&self, cell: GcCell) -> GcResult<CompartmentId> {
        let state = self.swept_state()?;
        state.resolve(cell)?;
        state.compartment_of(cell).ok_or(GcError::InvalidCell)
    }

    /// Bytes held in allocated arenas across the runtime.
    pub fn gc_bytes(&self) -> usize {
        self.shared.state.lock().heap.trigger.gc_bytes
    }

    /// Bytes held in allocated arenas of one compartment.
    pub fn compartment_gc_bytes(&self, compartment: CompartmentId) -> GcResult<usize> {
        Ok(self.state()?.compartment(compartment)?.trigger.gc_bytes)
    }

    /// Chunks currently holding arenas, excluding the pool.
    pub fn chunk_count(&self) -> usize {
        self.shared.state.lock().heap.chunk_count()
    }

    /// Empty chunks cached for reuse and how many of their arenas are
    /// already decommitted.
    pub fn pooled_chunks(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.heap.pool.len(), state.heap.pool.count_clean_decommitted_arenas())
    }

    /// Visit every allocated thing of `kind` in `compartment`, after any
    /// background sweep has finished. The heap is not locked while `f` runs.
    pub fn for_each_cell<F>(&self, compartment: CompartmentId, kind: AllocKind, mut f: F) -> GcResult<()>
    where
        F: FnMut(GcCell),
    {
        let cells = self.swept_state()?.cells(compartment, kind)?;
        for cell in cells {
            f(cell);
        }
        Ok(())
    }

    /// Number of allocated things in `compartment`, including garbage not
    /// yet collected.
    pub fn count_live(&self, compartment: CompartmentId) -> GcResult<usize> {
        self.swept_state()?.count_things(compartment)
    }

    /// Whether chunk and arena bookkeeping is consistent.
    pub fn check_heap(&self) -> bool {
        self.shared.state.lock().heap.check_accounting()
    }

    // =========================================================================
    // Verification
    // =========================================================================

    #[cfg(feature = "verify")]
    fn pre_write_barrier(&self, old: Option<GcCell>) {
        if let Some(verifier) = self.verifier.borrow_mut().as_mut() {
            verifier.pre_barrier(old);
        }
    }

    #[cfg(not(feature = "verify"))]
    #[inline(always)]
    fn pre_write_barrier(&self, _old: Option<GcCell>) {}

    #[cfg(feature = "verify")]
    fn abandon_barrier_verification(&self) {
        if self.verifier.borrow_mut().take().is_some() {
            tracing::debug!("barrier verification abandoned by collection");
        }
    }

    #[cfg(not(feature = "verify"))]
    #[inline(always)]
    fn abandon_barrier_verification(&self) {}

    /// Everything the collector would mark black or gray as a root, minus
    /// the native stack.
    #[cfg(feature = "verify")]
    fn explicit_roots(&self, state: &GcState) -> Vec<GcCell> {
        let mut tracer = crate::trace::CollectingTracer::default();
        state.roots.trace_named(&mut tracer);
        state.roots.trace_locked(&mut tracer);
        state.atoms.trace(&mut tracer);
        let callbacks = self.callbacks.borrow();
        for root in callbacks.black_roots.iter().chain(&callbacks.gray_roots) {
            root(&mut tracer);
        }
        let mut roots = tracer.edges;
        roots.extend(self.shadow.snapshot());
        roots
    }

    /// Snapshot the heap graph for barrier verification. Returns false if
    /// `verify_barriers` is off or a verification is already running.
    #[cfg(feature = "verify")]
    pub fn start_barrier_verification(&self) -> GcResult<bool> {
        if !self.config.verify_barriers || self.verifier.borrow().is_some() {
            return Ok(false);
        }
        let state = self.state()?;
        let roots = self.explicit_roots(&state);
        *self.verifier.borrow_mut() = Some(BarrierVerifier::start(&state, roots));
        Ok(true)
    }

    /// Compare the snapshot with the heap. `None` if no verification was
    /// running or a collection ended it.
    #[cfg(feature = "verify")]
    pub fn finish_barrier_verification(&self) -> GcResult<Option<BarrierReport>> {
        let Some(verifier) = self.verifier.borrow_mut().take() else {
            return Ok(None);
        };
        let state = self.state()?;
        Ok(Some(verifier.finish(&state)))
    }

    /// Poison words in `words` that address things no rooter holds.
    /// Returns how many were poisoned.
    #[cfg(feature = "verify")]
    pub fn check_stack_roots(&self, words: &mut [usize]) -> GcResult<usize> {
        let state = self.state()?;
        let rooted: rustc_hash::FxHashSet<GcCell> = self.explicit_roots(&state).into_iter().collect();
        Ok(verify::poison_unrooted(&state, &rooted, words))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.collect(None, GcKind::Normal, GcReason::DestroyRuntime) {
            tracing::warn!(%err, "final collection failed");
        }

        {
            let mut state = self.shared.state.lock();
            for (cell, name) in state.roots.leaked() {
                tracing::warn!(?cell, name = name.unwrap_or("<unnamed>"), "root leaked at shutdown");
            }
            state.roots.clear();
        }

        if let Some(mut helper) = self.helper.get_mut().take() {
            helper.shutdown();
        }
        let chunks = self.shared.state.lock().heap.take_all_chunks();
        tracing::debug!(chunks = chunks.len(), "runtime destroyed");
        drop(chunks);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("helper", &self.helper_state())
            .field("collecting", &self.collecting.get())
            .field("shadow_roots", &self.shadow.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::heap::platform::FaultInjectingPages;

    fn runtime() -> Runtime {
        Runtime::new(GcConfig::for_testing()).expect("runtime")
    }

    /// Object edges live in the slots after the header.
    fn with_object_edges(rt: &Runtime) {
        rt.set_trace_hook(TraceKind::Object, |view, tracer| {
            for i in crate::kind::OBJECT_HEADER_WORDS..view.len() {
                tracer.trace_word(view.word(i));
            }
        })
        .expect("hook");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GcConfig {
            max_bytes: 0,
            ..GcConfig::for_testing()
        };
        assert!(matches!(Runtime::new(config), Err(GcError::InvalidConfig(_))));
    }

    #[test]
    fn test_alloc_returns_zeroed_things() {
        let rt = runtime();
        let comp = rt.create_compartment(false);
        let cell = rt.alloc(comp, AllocKind::Object2).expect("alloc");
        for i in 0..AllocKind::Object2.thing_size() / 8 {
            assert_eq!(rt.read_word(cell, i), Ok(0));
        }
        rt.write_word(cell, 1, 42).expect("write");
        assert_eq!(rt.read_word(cell, 1), Ok(42));
        assert_eq!(rt.kind_of(cell), Ok(AllocKind::Object2));
        assert_eq!(rt.compartment_of(cell), Ok(comp));
        assert_eq!(rt.stats().things_allocated.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_field_bounds_checked() {
        let rt = runtime();
        let comp = rt.create_compartment(false);
        let cell = rt.alloc(comp, AllocKind::String).expect("alloc");
        assert_eq!(
            rt.read_word(cell, 2),
            Err(GcError::FieldOutOfBounds { index: 2, words: 2 })
        );
    }

    #[test]
    fn test_unrooted_thing_is_collected() {
        let rt = runtime();
        with_object_edges(&rt);
        let comp = rt.create_compartment(false);
        rt.set_compartment_hold(comp, true).expect("hold");
        let scope = rt.root_scope();
        let kept = scope.root(rt.alloc(comp, AllocKind::Object2).expect("alloc"));
        let child = rt.alloc(comp, AllocKind::Object0).expect("alloc");
        let garbage = rt.alloc(comp, AllocKind::Object0).expect("alloc");
        rt.write_edge(kept, 4, Some(child)).expect("edge");

        assert_eq!(rt.gc(), Ok(true));
        assert!(rt.is_live(kept));
        assert!(rt.is_live(child));
        assert!(!rt.is_live(garbage));
        assert_eq!(rt.count_live(comp), Ok(2));
    }

    #[test]
    fn test_begin_callback_vetoes() {
        let rt = runtime();
        rt.on_gc_status(|status| status != GcStatus::Begin);
        assert_eq!(rt.gc(), Ok(false));
        assert_eq!(rt.stats().vetoed_collections.load(Ordering::Relaxed), 1);
        assert_eq!(rt.stats().collections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_empty_compartment_destroyed_unless_held() {
        let rt = runtime();
        let held = rt.create_compartment(false);
        let loose = rt.create_compartment(false);
        rt.set_compartment_hold(held, true).expect("hold");
        rt.gc().expect("gc");
        assert!(rt.has_compartment(held));
        assert!(!rt.has_compartment(loose));
        assert!(rt.has_compartment(CompartmentId::ATOMS));
        assert_eq!(
            rt.alloc(loose, AllocKind::Shape),
            Err(GcError::UnknownCompartment(loose))
        );
    }

    #[test]
    fn test_atoms_are_interned() {
        let rt = runtime();
        let a = rt.atomize("length", false).expect("atom");
        let b = rt.atomize("length", false).expect("atom");
        assert_eq!(a, b);
        assert_eq!(rt.atom_text(a).as_deref(), Some("length"));
        assert_eq!(rt.read_word(a, 0), Ok(6));
        assert_eq!(rt.compartment_of(a), Ok(CompartmentId::ATOMS));
    }

    #[test]
    fn test_unpinned_atoms_swept() {
        let rt = runtime();
        let pinned = rt.atomize("prototype", true).expect("atom");
        let loose = rt.atomize("tmp", false).expect("atom");
        {
            let _keep = rt.keep_atoms();
            rt.gc().expect("gc");
            assert!(rt.is_live(loose));
        }
        rt.gc().expect("gc");
        assert!(rt.is_live(pinned));
        assert!(!rt.is_live(loose));
        assert_eq!(rt.atom_text(loose), None);
        assert_eq!(rt.atom_count(), 1);
    }

    #[test]
    fn test_chunk_failure_is_reported() {
        let rt = Runtime::with_page_allocator(
            GcConfig::for_testing(),
            Arc::new(FaultInjectingPages::with_map_limit(0)),
        )
        .expect("runtime");
        let comp = rt.create_compartment(false);
        // The last-ditch collection must not destroy the still-empty
        // compartment it is allocating for.
        assert_eq!(
            rt.alloc(comp, AllocKind::Object0),
            Err(GcError::ChunkAllocationFailed)
        );
        assert_eq!(rt.stats().collections_for(GcReason::LastDitch), 1);
        assert!(rt.has_compartment(comp));
    }

    #[test]
    fn test_maybe_gc_idle_on_fresh_heap() {
        let rt = runtime();
        let comp = rt.create_compartment(false);
        assert_eq!(rt.maybe_gc(comp), Ok(false));
        assert_eq!(rt.stats().collections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_shrink_buffers_decommits_free_arenas() {
        let rt = runtime();
        let comp = rt.create_compartment(false);
        let scope = rt.root_scope();
        let kept = scope.root(rt.alloc(comp, AllocKind::Object16).expect("alloc"));
        for _ in 0..AllocKind::Object16.things_per_arena() * 8 {
            rt.alloc(comp, AllocKind::Object16).expect("alloc");
        }
        rt.gc().expect("gc");
        assert_eq!(rt.compartment_gc_bytes(comp), Ok(ARENA_SIZE));

        rt.shrink_buffers().expect("shrink");
        assert!(rt.stats().arenas_decommitted.load(Ordering::Relaxed) > 0);
        assert!(rt.is_live(kept));
        assert!(rt.check_heap());
    }

    #[test]
    fn test_pooled_chunk_keeps_decommitted_arenas() {
        let rt = runtime();
        let comp = rt.create_compartment(false);
        rt.set_compartment_hold(comp, true).expect("hold");
        let cell = rt.alloc(comp, AllocKind::Object4).expect("alloc");
        assert!(rt.add_root(cell, None));
        rt.gc().expect("gc");
        rt.shrink_buffers().expect("shrink");
        assert_eq!(rt.pooled_chunks(), (0, 0));

        assert!(rt.remove_root(cell));
        rt.gc().expect("gc");
        assert_eq!(rt.chunk_count(), 0);
        assert_eq!(rt.pooled_chunks(), (1, crate::heap::ARENAS_PER_CHUNK - 1));
    }

    #[test]
    fn test_drop_finalizes_everything() {
        let finalized = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let rt = runtime();
            let counter = Arc::clone(&finalized);
            rt.set_finalize_hook(TraceKind::Shape, move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .expect("hook");
            let comp = rt.create_compartment(false);
            let shape = rt.alloc(comp, AllocKind::Shape).expect("alloc");
            assert!(rt.add_root(shape, Some("leaky")));
            rt.alloc(comp, AllocKind::Shape).expect("alloc");
        }
        assert_eq!(finalized.load(Ordering::Relaxed), 2);
    }
}
