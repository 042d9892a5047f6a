//! Collection trigger policy.
//!
//! The runtime and every compartment track the bytes held in arenas and a
//! trigger computed from the size left by the previous collection. Crossing
//! a compartment trigger schedules a compartment collection, which escalates
//! to a full one whenever the choice of scope is ambiguous.

use std::time::{Duration, Instant};

use crate::collector::{GcKind, GcReason};
use crate::compartment::CompartmentId;
use crate::config::{GcConfig, GcMode};

/// Below this many bytes a heap is never considered over its trigger.
const MIN_TRIGGER_CHECK_BYTES: usize = 8192;

/// Arena bytes held and the level that schedules the next collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeapTrigger {
    pub(crate) gc_bytes: usize,
    pub(crate) gc_trigger_bytes: usize,
}

impl HeapTrigger {
    pub(crate) fn new(config: &GcConfig) -> Self {
        let mut trigger = Self {
            gc_bytes: 0,
            gc_trigger_bytes: 0,
        };
        trigger.set_gc_last_bytes(0, GcKind::Normal, config);
        trigger
    }

    /// Recompute the trigger from the size after a collection.
    ///
    /// A shrinking collection bases the trigger on the actual size; other
    /// collections never go below `allocation_threshold`.
    pub(crate) fn set_gc_last_bytes(&mut self, last_bytes: usize, kind: GcKind, config: &GcConfig) {
        let base = match kind {
            GcKind::Shrink => last_bytes,
            GcKind::Normal => last_bytes.max(config.allocation_threshold),
        };
        let trigger = base as f64 * config.heap_growth_factor;
        self.gc_trigger_bytes = if trigger >= config.max_bytes as f64 {
            config.max_bytes
        } else {
            trigger as usize
        };
    }

    /// Lower the trigger as background sweeping returns arenas, never below
    /// the trigger of an empty heap.
    pub(crate) fn reduce_gc_trigger_bytes(&mut self, amount: usize, config: &GcConfig) {
        let floor = config.allocation_threshold as f64 * config.heap_growth_factor;
        match self.gc_trigger_bytes.checked_sub(amount) {
            Some(reduced) if reduced as f64 >= floor => self.gc_trigger_bytes = reduced,
            _ => {}
        }
    }

    #[inline]
    pub(crate) fn is_over(&self) -> bool {
        self.gc_bytes >= self.gc_trigger_bytes
    }

    /// Far enough over quota that a compartment collection is not enough.
    fn is_well_over(&self) -> bool {
        self.gc_bytes > MIN_TRIGGER_CHECK_BYTES
            && self.gc_bytes >= 3 * (self.gc_trigger_bytes / 2)
    }

    /// Close enough to the trigger that an idle-time collection is worth it.
    fn is_nearly_over(&self) -> bool {
        self.gc_bytes > MIN_TRIGGER_CHECK_BYTES
            && self.gc_bytes >= 3 * (self.gc_trigger_bytes / 4)
    }
}

/// A collection to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GcRequest {
    pub(crate) scope: Option<CompartmentId>,
    pub(crate) kind: GcKind,
    pub(crate) reason: GcReason,
}

/// Pending-collection state shared by the allocation path and `maybe_gc`.
#[derive(Debug)]
pub(crate) struct GcSchedule {
    pub(crate) is_needed: bool,
    /// Compartment to collect when `is_needed`; `None` means everything.
    pub(crate) trigger_compartment: Option<CompartmentId>,
    pub(crate) trigger_reason: GcReason,
    /// Unset until the first collection finishes.
    pub(crate) next_full_gc_time: Option<Instant>,
}

impl Default for GcSchedule {
    fn default() -> Self {
        Self {
            is_needed: false,
            trigger_compartment: None,
            trigger_reason: GcReason::Api,
            next_full_gc_time: None,
        }
    }
}

impl GcSchedule {
    /// Request a full collection.
    pub(crate) fn trigger_gc(&mut self, reason: GcReason) {
        if self.is_needed {
            return;
        }
        tracing::debug!(?reason, "full collection scheduled");
        self.is_needed = true;
        self.trigger_compartment = None;
        self.trigger_reason = reason;
    }

    /// Request a collection of `compartment`, escalating to a full
    /// collection when needed.
    pub(crate) fn trigger_compartment_gc(
        &mut self,
        compartment: CompartmentId,
        reason: GcReason,
        mode: GcMode,
        runtime: &HeapTrigger,
    ) {
        if mode != GcMode::Compartment || compartment == CompartmentId::ATOMS {
            self.trigger_gc(reason);
            return;
        }
        if self.is_needed {
            // A second compartment over quota means a full collection.
            if self.trigger_compartment != Some(compartment) {
                self.trigger_compartment = None;
            }
            return;
        }
        if runtime.is_well_over() {
            self.trigger_gc(reason);
            return;
        }
        tracing::debug!(?compartment, ?reason, "compartment collection scheduled");
        self.is_needed = true;
        self.trigger_compartment = Some(compartment);
        self.trigger_reason = reason;
    }

    /// Decide whether an idle-time check should collect.
    pub(crate) fn maybe_gc(&mut self, input: MaybeGcInput<'_>, now: Instant) -> Option<GcRequest> {
        let current = input.current;
        if self.is_needed {
            let scope = (self.trigger_compartment == Some(current)).then_some(current);
            return Some(GcRequest {
                scope,
                kind: GcKind::Normal,
                reason: GcReason::MaybeGc,
            });
        }

        if input.compartment.is_nearly_over() {
            let scope = (input.config.mode == GcMode::Compartment).then_some(current);
            return Some(GcRequest {
                scope,
                kind: GcKind::Normal,
                reason: GcReason::MaybeGc,
            });
        }

        let next = self.next_full_gc_time?;
        if next > now {
            return None;
        }
        if input.chunk_allocation_since_last_gc
            || input.num_arenas_free_committed > input.config.free_committed_arenas_threshold
        {
            Some(GcRequest {
                scope: None,
                kind: GcKind::Shrink,
                reason: GcReason::MaybeGc,
            })
        } else {
            self.next_full_gc_time = Some(now + input.config.idle_full_span);
            None
        }
    }

    /// Clear the pending request as a collection starts.
    pub(crate) fn begin_collection(&mut self) {
        self.is_needed = false;
        self.trigger_compartment = None;
    }

    pub(crate) fn end_collection(&mut self, now: Instant, idle_full_span: Duration) {
        self.next_full_gc_time = Some(now + idle_full_span);
    }
}

/// Heap figures consulted by [`GcSchedule::maybe_gc`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct MaybeGcInput<'a> {
    pub(crate) current: CompartmentId,
    pub(crate) compartment: &'a HeapTrigger,
    pub(crate) config: &'a GcConfig,
    pub(crate) chunk_allocation_since_last_gc: bool,
    pub(crate) num_arenas_free_committed: usize,
}
