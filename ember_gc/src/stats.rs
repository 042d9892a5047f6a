//! GC statistics.
//!
//! Counters are atomics so the helper thread can update them without the
//! GC lock and embedders can read them at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::collector::{GC_REASON_COUNT, GcKind, GcReason};

/// Timed sections of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Root marking and transitive closure.
    Mark,
    /// Everything after marking, up to the end callbacks.
    Sweep,
    /// Object finalization.
    SweepObject,
    /// String finalization.
    SweepString,
    /// Script finalization.
    SweepScript,
    /// Shape and type finalization.
    SweepShape,
    /// Compartment removal and foreground chunk expiry.
    Destroy,
}

const PHASE_COUNT: usize = GcPhase::Destroy as usize + 1;

/// Statistics about collector activity.
#[derive(Debug)]
pub struct GcStats {
    // =========================================================================
    // Allocation
    // =========================================================================
    /// Things handed out by `alloc`.
    pub things_allocated: AtomicU64,
    /// Arenas carved out of chunks.
    pub arenas_allocated: AtomicU64,
    /// Arenas returned to their chunks.
    pub arenas_released: AtomicU64,

    // =========================================================================
    // Collections
    // =========================================================================
    /// Completed collections of any scope.
    pub collections: AtomicU64,
    /// Collections limited to one compartment.
    pub compartment_collections: AtomicU64,
    /// Shrinking collections.
    pub shrinking_collections: AtomicU64,
    /// Collections run by the allocator before reporting OOM.
    pub last_ditch_collections: AtomicU64,
    /// Collections vetoed by a begin callback.
    pub vetoed_collections: AtomicU64,
    /// Things finalized, foreground and background.
    pub things_finalized: AtomicU64,
    /// Arenas whose marking was delayed because the mark stack was full.
    pub delayed_marking_arenas: AtomicU64,
    by_reason: [AtomicU64; GC_REASON_COUNT],
    phase_ns: [AtomicU64; PHASE_COUNT],

    // =========================================================================
    // Chunks and background work
    // =========================================================================
    /// Chunks mapped from the OS.
    pub chunks_created: AtomicU64,
    /// Chunks unmapped.
    pub chunks_destroyed: AtomicU64,
    /// Chunks mapped by the helper thread.
    pub background_chunks_allocated: AtomicU64,
    /// Arenas whose pages were returned to the OS.
    pub arenas_decommitted: AtomicU64,
    /// Sweep jobs completed by the helper thread.
    pub background_sweeps: AtomicU64,
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GcStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self {
            things_allocated: AtomicU64::new(0),
            arenas_allocated: AtomicU64::new(0),
            arenas_released: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            compartment_collections: AtomicU64::new(0),
            shrinking_collections: AtomicU64::new(0),
            last_ditch_collections: AtomicU64::new(0),
            vetoed_collections: AtomicU64::new(0),
            things_finalized: AtomicU64::new(0),
            delayed_marking_arenas: AtomicU64::new(0),
            by_reason: std::array::from_fn(|_| AtomicU64::new(0)),
            phase_ns: std::array::from_fn(|_| AtomicU64::new(0)),
            chunks_created: AtomicU64::new(0),
            chunks_destroyed: AtomicU64::new(0),
            background_chunks_allocated: AtomicU64::new(0),
            arenas_decommitted: AtomicU64::new(0),
            background_sweeps: AtomicU64::new(0),
        }
    }

    /// Record a finished collection.
    pub(crate) fn record_collection(&self, compartment: bool, kind: GcKind, reason: GcReason) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        if compartment {
            self.compartment_collections.fetch_add(1, Ordering::Relaxed);
        }
        if kind == GcKind::Shrink {
            self.shrinking_collections.fetch_add(1, Ordering::Relaxed);
        }
        if reason == GcReason::LastDitch {
            self.last_ditch_collections.fetch_add(1, Ordering::Relaxed);
        }
        self.by_reason[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_finalized(&self, count: usize) {
        if count > 0 {
            self.things_finalized
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Collections run for `reason`.
    pub fn collections_for(&self, reason: GcReason) -> u64 {
        self.by_reason[reason.index()].load(Ordering::Relaxed)
    }

    /// Start timing `phase`; the time is recorded when the guard drops.
    pub(crate) fn phase(&self, phase: GcPhase) -> PhaseTimer<'_> {
        PhaseTimer {
            stats: self,
            phase,
            start: Instant::now(),
        }
    }

    /// Accumulated time spent in `phase`.
    pub fn phase_time(&self, phase: GcPhase) -> Duration {
        Duration::from_nanos(self.phase_ns[phase as usize].load(Ordering::Relaxed))
    }

    /// Total time spent collecting.
    pub fn total_gc_time(&self) -> Duration {
        self.phase_time(GcPhase::Mark) + self.phase_time(GcPhase::Sweep)
    }

    /// Average pause of a collection.
    pub fn avg_pause(&self) -> Duration {
        let count = self.collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_gc_time().as_nanos() as u64 / count)
    }

    /// Copy the headline counters.
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            collections: self.collections.load(Ordering::Relaxed),
            things_allocated: self.things_allocated.load(Ordering::Relaxed),
            things_finalized: self.things_finalized.load(Ordering::Relaxed),
            chunks_created: self.chunks_created.load(Ordering::Relaxed),
            chunks_destroyed: self.chunks_destroyed.load(Ordering::Relaxed),
            arenas_decommitted: self.arenas_decommitted.load(Ordering::Relaxed),
            background_sweeps: self.background_sweeps.load(Ordering::Relaxed),
            total_gc_time: self.total_gc_time(),
        }
    }
}

/// Records elapsed time for one phase on drop.
pub(crate) struct PhaseTimer<'a> {
    stats: &'a GcStats,
    phase: GcPhase,
    start: Instant,
}

impl Drop for PhaseTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_nanos() as u64;
        self.stats.phase_ns[self.phase as usize].fetch_add(elapsed, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`GcStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStatsSnapshot {
    /// Completed collections.
    pub collections: u64,
    /// Things allocated.
    pub things_allocated: u64,
    /// Things finalized.
    pub things_finalized: u64,
    /// Chunks mapped.
    pub chunks_created: u64,
    /// Chunks unmapped.
    pub chunks_destroyed: u64,
    /// Arenas decommitted.
    pub arenas_decommitted: u64,
    /// Background sweep jobs completed.
    pub background_sweeps: u64,
    /// Time spent collecting.
    pub total_gc_time: Duration,
}
