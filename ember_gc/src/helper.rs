//! Background helper thread.
//!
//! The helper consumes typed requests from a channel: finalize arenas lent
//! by a collection (then expire pooled chunks and optionally decommit free
//! arenas), or pre-map chunks so the allocator does not stall on the OS.
//! Each request carries a one-shot completion channel; the collector waits
//! on it with the GC lock released.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::MutexGuard;

use crate::collector::{GcKind, GcShared, GcState};
use crate::compartment::CompartmentId;
use crate::error::{GcError, GcResult};
use crate::heap::arena::ArenaHeader;
use crate::heap::chunk::{AvailableList, ChunkMemory};
use crate::heap::ChunkId;
use crate::kind::AllocKind;
use crate::trace::TraceHooks;

/// What the helper thread is doing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    /// Waiting for a request.
    Idle = 0,
    /// Finalizing lent arenas or releasing memory.
    Sweeping,
    /// Mapping chunks into the pool.
    Allocating,
    /// A collection asked the allocation loop to stop.
    CancelAllocation,
    /// The thread has exited.
    Shutdown,
}

impl HelperState {
    pub(crate) fn load(cell: &AtomicU8) -> Self {
        match cell.load(Ordering::Acquire) {
            0 => HelperState::Idle,
            1 => HelperState::Sweeping,
            2 => HelperState::Allocating,
            3 => HelperState::CancelAllocation,
            _ => HelperState::Shutdown,
        }
    }

    fn store(self, cell: &AtomicU8) {
        cell.store(self as u8, Ordering::Release);
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Arenas of one (compartment, kind) list lent to the helper.
pub(crate) struct LentArenas {
    pub(crate) compartment: CompartmentId,
    pub(crate) kind: AllocKind,
    pub(crate) arenas: Vec<(Box<ArenaHeader>, Arc<ChunkMemory>)>,
}

/// Finalization work handed over at the end of a collection.
pub(crate) struct SweepJob {
    pub(crate) lists: Vec<LentArenas>,
    pub(crate) hooks: TraceHooks,
    pub(crate) shrink: bool,
}

impl SweepJob {
    pub(crate) fn new(hooks: TraceHooks, kind: GcKind) -> Self {
        Self {
            lists: Vec::new(),
            hooks,
            shrink: kind == GcKind::Shrink,
        }
    }

    fn shrink_only() -> Self {
        Self {
            lists: Vec::new(),
            hooks: TraceHooks::new(),
            shrink: true,
        }
    }
}

impl fmt::Debug for SweepJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepJob")
            .field("lists", &self.lists.len())
            .field("shrink", &self.shrink)
            .finish()
    }
}

enum HelperRequest {
    Sweep(SweepJob, Sender<()>),
    Allocate(Sender<()>),
    Shutdown,
}

// =============================================================================
// GcHelper
// =============================================================================

/// Handle to the helper thread, owned by the runtime.
pub(crate) struct GcHelper {
    shared: Arc<GcShared>,
    requests: Sender<HelperRequest>,
    thread: Option<JoinHandle<()>>,
    sweep_done: Option<Receiver<()>>,
    alloc_done: Option<Receiver<()>>,
}

impl GcHelper {
    pub(crate) fn spawn(shared: Arc<GcShared>) -> GcResult<Self> {
        let (requests, inbox) = channel::unbounded();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("ember-gc-helper".into())
            .spawn(move || helper_loop(&thread_shared, &inbox))
            .map_err(|err| {
                tracing::warn!(%err, "failed to spawn gc helper thread");
                GcError::HelperUnavailable
            })?;
        Ok(Self {
            shared,
            requests,
            thread: Some(thread),
            sweep_done: None,
            alloc_done: None,
        })
    }

    /// Whether a sweep job is still running.
    pub(crate) fn is_sweeping(&self) -> bool {
        self.sweep_done
            .as_ref()
            .is_some_and(|done| matches!(done.try_recv(), Err(TryRecvError::Empty)))
    }

    /// Block until the current sweep job, if any, has relinked its arenas.
    pub(crate) fn wait_background_sweep_end(&mut self, guard: &mut MutexGuard<'_, GcState>) {
        if let Some(done) = self.sweep_done.take() {
            MutexGuard::unlocked(guard, || {
                let _ = done.recv();
            });
        }
    }

    /// Stop background chunk allocation, keeping the chunks it mapped.
    pub(crate) fn wait_background_allocation_end(&mut self, shared: &GcShared, guard: &mut MutexGuard<'_, GcState>) {
        let Some(done) = self.alloc_done.take() else {
            return;
        };
        shared.cancel_allocation.store(true, Ordering::Release);
        let _ = shared.helper_state.compare_exchange(
            HelperState::Allocating as u8,
            HelperState::CancelAllocation as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        MutexGuard::unlocked(guard, || {
            let _ = done.recv();
        });
        shared.cancel_allocation.store(false, Ordering::Release);
    }

    /// Hand a sweep job to the thread. Gives the job back if the thread is
    /// gone.
    pub(crate) fn start_background_sweep(&mut self, job: SweepJob) -> Result<(), SweepJob> {
        debug_assert!(self.sweep_done.is_none());
        let (done, wait) = channel::bounded(1);
        match self.requests.send(HelperRequest::Sweep(job, done)) {
            Ok(()) => {
                self.sweep_done = Some(wait);
                Ok(())
            }
            Err(err) => match err.into_inner() {
                HelperRequest::Sweep(job, _) => Err(job),
                HelperRequest::Allocate(_) | HelperRequest::Shutdown => Ok(()),
            },
        }
    }

    /// Ask the thread to refill the chunk pool unless it already is.
    pub(crate) fn start_background_allocation(&mut self) {
        if let Some(done) = &self.alloc_done {
            if matches!(done.try_recv(), Err(TryRecvError::Empty)) {
                return;
            }
        }
        let (done, wait) = channel::bounded(1);
        if self.requests.send(HelperRequest::Allocate(done)).is_ok() {
            self.alloc_done = Some(wait);
        }
    }

    /// Release pooled chunks and decommit free arenas off-thread. Folded
    /// into the running sweep job if there is one.
    pub(crate) fn start_background_shrink(&mut self) {
        if self.is_sweeping() {
            self.shared.shrink_requested.store(true, Ordering::Release);
            return;
        }
        self.sweep_done = None;
        if let Err(job) = self.start_background_sweep(SweepJob::shrink_only()) {
            drop(job);
            tracing::warn!("helper thread gone; shrink request dropped");
        }
    }

    pub(crate) fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.requests.send(HelperRequest::Shutdown);
        if thread.join().is_err() {
            tracing::warn!("gc helper thread panicked");
        }
    }
}

impl Drop for GcHelper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for GcHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHelper")
            .field("state", &HelperState::load(&self.shared.helper_state))
            .field("sweeping", &self.sweep_done.is_some())
            .field("allocating", &self.alloc_done.is_some())
            .finish()
    }
}

/// Whether the machine has enough cores for background chunk allocation.
pub(crate) fn can_background_allocate() -> bool {
    thread::available_parallelism().is_ok_and(|n| n.get() >= 2)
}

// =============================================================================
// Thread body
// =============================================================================

fn helper_loop(shared: &GcShared, inbox: &Receiver<HelperRequest>) {
    tracing::info!("gc helper thread started");
    while let Ok(request) = inbox.recv() {
        match request {
            HelperRequest::Sweep(job, done) => {
                HelperState::Sweeping.store(&shared.helper_state);
                run_sweep_job(shared, job);
                HelperState::Idle.store(&shared.helper_state);
                let _ = done.send(());
            }
            HelperRequest::Allocate(done) => {
                HelperState::Allocating.store(&shared.helper_state);
                allocate_chunks(shared);
                HelperState::Idle.store(&shared.helper_state);
                let _ = done.send(());
            }
            HelperRequest::Shutdown => break,
        }
    }
    HelperState::Shutdown.store(&shared.helper_state);
    tracing::info!("gc helper thread stopped");
}

/// Finalize lent arenas without the lock, relink them with it, then
/// release memory.
pub(crate) fn run_sweep_job(shared: &GcShared, job: SweepJob) {
    let SweepJob {
        lists,
        hooks,
        shrink,
    } = job;
    let mut finalized = 0;
    for lent in lists {
        let LentArenas {
            compartment,
            kind,
            arenas,
        } = lent;
        let mut results = Vec::with_capacity(arenas.len());
        for (mut header, memory) in arenas {
            let (outcome, count) = header.finalize(&memory, &hooks);
            finalized += count;
            results.push((header, outcome));
        }
        shared
            .state
            .lock()
            .finish_lent_list(compartment, kind, results);
    }
    shared.stats.record_finalized(finalized);

    let mut guard = shared.state.lock();
    let shrink = shrink || shared.shrink_requested.swap(false, Ordering::AcqRel);
    expire_chunks_and_arenas(&mut guard, shrink);
    drop(guard);
    shared.stats.background_sweeps.fetch_add(1, Ordering::Relaxed);
}

/// Map chunks into the pool until it is no longer wanted or a collection
/// cancels.
fn allocate_chunks(shared: &GcShared) {
    let pages = Arc::clone(shared.state.lock().heap.pages());
    loop {
        if shared.cancel_allocation.load(Ordering::Acquire) {
            break;
        }
        let Some(memory) = ChunkMemory::map(Arc::clone(&pages)) else {
            tracing::warn!("background chunk allocation failed");
            break;
        };
        let mut state = shared.state.lock();
        state.heap.put_background_chunk(memory);
        if !state.heap.want_background_allocation(true) {
            break;
        }
    }
}

// =============================================================================
// Releasing memory
// =============================================================================

/// Age the chunk pool and, when shrinking, decommit free arenas.
///
/// Unmapping and decommitting happen with the lock released.
pub(crate) fn expire_chunks_and_arenas(guard: &mut MutexGuard<'_, GcState>, shrink: bool) {
    let max_age = guard.config.max_empty_chunk_age;
    let expired = guard.heap.expire_pool(max_age, shrink);
    if !expired.is_empty() {
        MutexGuard::unlocked(guard, move || drop(expired));
    }
    if shrink {
        decommit_arenas(guard, AvailableList::System);
        decommit_arenas(guard, AvailableList::User);
    }
}

/// Decommit every committed free arena on `list`, walking from the tail.
///
/// Each arena is taken off its chunk's free list before the lock is
/// dropped, so the allocator never sees it while the pages are being
/// released. Stops as soon as the mutator maps a chunk, since that means
/// memory is wanted again.
fn decommit_arenas(guard: &mut MutexGuard<'_, GcState>, list: AvailableList) {
    let chunks: Vec<ChunkId> = guard.heap.available_list(list).iter().rev().copied().collect();
    for id in chunks {
        loop {
            let state = &mut **guard;
            let Some(chunk) = state.heap.chunk_mut(id) else {
                break;
            };
            if chunk.num_arenas_free_committed() == 0 {
                break;
            }
            let index = chunk.begin_decommit();
            let memory = Arc::clone(&chunk.memory);
            let position = if chunk.has_available_arenas() {
                None
            } else {
                state.heap.remove_from_available(id)
            };

            let ok = MutexGuard::unlocked(guard, || memory.decommit_arena(index));

            let state = &mut **guard;
            if let Some(chunk) = state.heap.chunk_mut(id) {
                chunk.finish_decommit(index, ok);
                if chunk.available.is_none() {
                    state.heap.add_to_available(id, list, position);
                }
            }
            if !ok {
                // The arena went back on the committed list; retrying would
                // pick it again.
                tracing::warn!(chunk = ?id, index, "arena decommit failed");
                return;
            }
            state.stats.arenas_decommitted.fetch_add(1, Ordering::Relaxed);
            if state.heap.chunk_allocation_since_last_gc {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::heap::platform::{FaultInjectingPages, PageAllocator, SystemPages};
    use crate::heap::ARENAS_PER_CHUNK;
    use crate::stats::GcStats;

    fn shared_with(pages: Arc<dyn PageAllocator>) -> Arc<GcShared> {
        let state = GcState::new(GcConfig::for_testing(), pages, Arc::new(GcStats::new()));
        Arc::new(GcShared::new(state))
    }

    #[test]
    fn test_shrink_decommits_free_arenas() {
        let shared = shared_with(Arc::new(SystemPages));
        let mut guard = shared.state.lock();
        guard.heap.pick_chunk(false, false).expect("chunk");
        guard.heap.chunk_allocation_since_last_gc = false;

        expire_chunks_and_arenas(&mut guard, true);
        let decommitted = shared.stats.arenas_decommitted.load(Ordering::Relaxed);
        assert_eq!(decommitted, ARENAS_PER_CHUNK as u64);
        assert!(guard.heap.check_accounting());
        assert_eq!(guard.heap.num_arenas_free_committed(), 0);
    }

    #[test]
    fn test_failed_decommit_keeps_arenas() {
        let pages = Arc::new(FaultInjectingPages::unlimited());
        pages.set_fail_decommit(true);
        let shared = shared_with(pages);
        let mut guard = shared.state.lock();
        guard.heap.pick_chunk(false, false).expect("chunk");
        guard.heap.chunk_allocation_since_last_gc = false;

        expire_chunks_and_arenas(&mut guard, true);
        assert_eq!(shared.stats.arenas_decommitted.load(Ordering::Relaxed), 0);
        assert_eq!(guard.heap.num_arenas_free_committed(), ARENAS_PER_CHUNK);
        assert!(guard.heap.check_accounting());
    }

    #[test]
    fn test_decommit_stops_when_chunks_were_mapped() {
        let shared = shared_with(Arc::new(SystemPages));
        let mut guard = shared.state.lock();
        guard.heap.pick_chunk(false, false).expect("chunk");
        assert!(guard.heap.chunk_allocation_since_last_gc);

        expire_chunks_and_arenas(&mut guard, true);
        assert_eq!(shared.stats.arenas_decommitted.load(Ordering::Relaxed), 1);
        assert!(guard.heap.check_accounting());
    }

    #[test]
    fn test_helper_allocates_and_shuts_down() {
        let shared = shared_with(Arc::new(SystemPages));
        let mut helper = GcHelper::spawn(Arc::clone(&shared)).expect("spawn");
        helper.start_background_allocation();
        {
            let mut guard = shared.state.lock();
            helper.wait_background_allocation_end(&shared, &mut guard);
        }
        helper.shutdown();
        assert_eq!(HelperState::load(&shared.helper_state), HelperState::Shutdown);
    }

    #[test]
    fn test_empty_sweep_job_runs() {
        let shared = shared_with(Arc::new(SystemPages));
        let mut helper = GcHelper::spawn(Arc::clone(&shared)).expect("spawn");
        helper
            .start_background_sweep(SweepJob::new(TraceHooks::new(), GcKind::Normal))
            .expect("send");
        {
            let mut guard = shared.state.lock();
            helper.wait_background_sweep_end(&mut guard);
        }
        assert_eq!(shared.stats.background_sweeps.load(Ordering::Relaxed), 1);
    }
}
