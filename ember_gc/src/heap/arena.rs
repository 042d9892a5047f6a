//! Arena headers, free spans and per-arena finalization.
//!
//! Free space is described by sorted, disjoint spans of thing indices kept
//! in the header. Nothing is ever written into a free slot, so a dead thing's
//! memory carries no allocator metadata.

use smallvec::SmallVec;

use crate::cell::{GcCell, ThingView};
use crate::compartment::CompartmentId;
use crate::heap::chunk::ChunkMemory;
use crate::heap::{ARENA_SIZE, ArenaId, CELL_SIZE};
use crate::kind::AllocKind;
use crate::trace::TraceHooks;

/// Words in a per-arena mark bitmap. One bit per cell-sized slot covers
/// every thing size.
const MARK_WORDS: usize = ARENA_SIZE / CELL_SIZE / 64;

/// Inclusive range of free thing indices within one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeSpan {
    pub(crate) first: u16,
    pub(crate) last: u16,
}

impl FreeSpan {
    pub(crate) fn new(first: usize, last: usize) -> Self {
        debug_assert!(first <= last);
        Self {
            first: first as u16,
            last: last as u16,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }
}

/// Sorted, disjoint free spans of one arena.
pub(crate) type SpanList = SmallVec<[FreeSpan; 4]>;

/// Mark color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Reachable from black roots.
    Black,
    /// Reachable only from gray roots.
    Gray,
}

#[derive(Debug, Clone, Default)]
struct MarkBits([u64; MARK_WORDS]);

impl MarkBits {
    #[inline]
    fn get(&self, index: usize) -> bool {
        self.0[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    fn set(&mut self, index: usize) {
        self.0[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self) {
        self.0 = [0; MARK_WORDS];
    }
}

/// What sweeping left in an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepOutcome {
    /// Nothing survived; the arena goes back to its chunk.
    Empty,
    /// Some things survived and some slots are free.
    Partial,
    /// Every slot is live.
    Full,
}

/// Metadata for an allocated arena.
#[derive(Debug)]
pub(crate) struct ArenaHeader {
    pub(crate) address: ArenaId,
    pub(crate) compartment: CompartmentId,
    pub(crate) kind: AllocKind,
    free: SpanList,
    black: MarkBits,
    gray: MarkBits,
    pub(crate) has_delayed_marking: bool,
    pub(crate) next_delayed: Option<ArenaId>,
}

impl ArenaHeader {
    /// Header for a freshly allocated arena, every slot free.
    pub(crate) fn new(address: ArenaId, compartment: CompartmentId, kind: AllocKind) -> Self {
        let mut free = SpanList::new();
        free.push(FreeSpan::new(0, kind.things_per_arena() - 1));
        Self {
            address,
            compartment,
            kind,
            free,
            black: MarkBits::default(),
            gray: MarkBits::default(),
            has_delayed_marking: false,
            next_delayed: None,
        }
    }

    #[inline]
    pub(crate) fn thing_size(&self) -> usize {
        self.kind.thing_size()
    }

    #[inline]
    pub(crate) fn things_per_arena(&self) -> usize {
        self.kind.things_per_arena()
    }

    /// Address of thing `index`.
    #[inline]
    pub(crate) fn thing_address(&self, index: usize) -> usize {
        self.address.addr() + index * self.thing_size()
    }

    /// Index of the thing starting exactly at `cell`.
    #[inline]
    pub(crate) fn thing_index(&self, cell: GcCell) -> Option<usize> {
        let offset = cell.arena_offset();
        let size = self.thing_size();
        let index = offset / size;
        (offset % size == 0 && index < self.things_per_arena()).then_some(index)
    }

    /// Index of the thing containing the arena offset, for interior
    /// pointers.
    #[inline]
    pub(crate) fn thing_index_containing(&self, offset: usize) -> Option<usize> {
        let index = offset / self.thing_size();
        (index < self.things_per_arena()).then_some(index)
    }

    // =========================================================================
    // Free spans
    // =========================================================================

    pub(crate) fn has_free_things(&self) -> bool {
        !self.free.is_empty()
    }

    /// Every slot is free.
    pub(crate) fn is_empty(&self) -> bool {
        self.free.len() == 1 && self.free[0].len() == self.things_per_arena()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.iter().map(FreeSpan::len).sum()
    }

    /// Move the spans out, leaving the arena looking fully used.
    pub(crate) fn take_free_spans(&mut self) -> SpanList {
        std::mem::take(&mut self.free)
    }

    /// Give back spans previously taken with [`take_free_spans`].
    ///
    /// [`take_free_spans`]: Self::take_free_spans
    pub(crate) fn restore_free_spans(&mut self, spans: SpanList) {
        debug_assert!(self.free.is_empty());
        self.free = spans;
    }

    /// Whether thing `index` sits in a free span.
    pub(crate) fn in_free_list(&self, index: usize) -> bool {
        for span in &self.free {
            if index < span.first as usize {
                return false;
            }
            if index <= span.last as usize {
                return true;
            }
        }
        false
    }

    /// Indices of allocated things, ascending.
    pub(crate) fn allocated_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.things_per_arena()).filter(move |&i| !self.in_free_list(i))
    }

    // =========================================================================
    // Mark bits
    // =========================================================================

    #[inline]
    pub(crate) fn is_marked(&self, index: usize) -> bool {
        self.black.get(index) || self.gray.get(index)
    }

    #[inline]
    pub(crate) fn is_gray(&self, index: usize) -> bool {
        self.gray.get(index) && !self.black.get(index)
    }

    /// Mark thing `index`. Returns true if it was unmarked.
    #[inline]
    pub(crate) fn mark(&mut self, index: usize, color: MarkColor) -> bool {
        if self.is_marked(index) {
            return false;
        }
        match color {
            MarkColor::Black => self.black.set(index),
            MarkColor::Gray => self.gray.set(index),
        }
        true
    }

    pub(crate) fn clear_marks(&mut self) {
        self.black.clear();
        self.gray.clear();
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Finalize every allocated, unmarked thing and rebuild the free spans.
    ///
    /// Returns the outcome and the number of things finalized.
    pub(crate) fn finalize(
        &mut self,
        memory: &ChunkMemory,
        hooks: &TraceHooks,
    ) -> (SweepOutcome, usize) {
        debug_assert!(!self.has_delayed_marking);

        let count = self.things_per_arena();
        let size = self.thing_size();
        let mut new_free = SpanList::new();
        let mut run_start: Option<usize> = None;
        let mut spans = self.free.iter().peekable();
        let mut marked = 0;
        let mut finalized = 0;

        let mut index = 0;
        while index < count {
            if let Some(span) = spans.next_if(|span| span.first as usize == index) {
                run_start.get_or_insert(index);
                index = span.last as usize + 1;
                continue;
            }

            if self.is_marked(index) {
                marked += 1;
                if let Some(start) = run_start.take() {
                    new_free.push(FreeSpan::new(start, index - 1));
                }
            } else {
                run_start.get_or_insert(index);
                let addr = self.thing_address(index);
                if let Some(cell) = GcCell::from_word(addr) {
                    let view = ThingView::new(cell, self.kind, memory.thing_words(addr, size));
                    hooks.finalize(&view);
                }
                finalized += 1;
            }
            index += 1;
        }
        if let Some(start) = run_start {
            new_free.push(FreeSpan::new(start, count - 1));
        }

        self.free = new_free;
        debug_assert_eq!(self.free_count() + marked, count);

        let outcome = if marked == 0 {
            SweepOutcome::Empty
        } else if self.free.is_empty() {
            SweepOutcome::Full
        } else {
            SweepOutcome::Partial
        };
        (outcome, finalized)
    }
}

// =============================================================================
// FreeList
// =============================================================================

/// Free spans of the arena currently being allocated from.
///
/// While an arena is the allocation target its spans live here and its
/// header looks fully used. They are copied back before every collection.
#[derive(Debug)]
pub(crate) struct FreeList {
    pub(crate) arena: ArenaId,
    thing_size: usize,
    spans: SpanList,
}

impl FreeList {
    pub(crate) fn new(arena: ArenaId, kind: AllocKind, spans: SpanList) -> Self {
        Self {
            arena,
            thing_size: kind.thing_size(),
            spans,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Pop the lowest free slot.
    pub(crate) fn allocate(&mut self) -> Option<GcCell> {
        let span = self.spans.first_mut()?;
        let index = span.first as usize;
        if span.first == span.last {
            self.spans.remove(0);
        } else {
            span.first += 1;
        }
        GcCell::from_word(self.arena.addr() + index * self.thing_size)
    }

    pub(crate) fn contains(&self, index: usize) -> bool {
        self.spans
            .iter()
            .any(|span| (span.first as usize..=span.last as usize).contains(&index))
    }

    pub(crate) fn into_spans(self) -> SpanList {
        self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentId;
    use crate::heap::CHUNK_SIZE;
    use crate::heap::platform::SystemPages;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn header(kind: AllocKind) -> ArenaHeader {
        ArenaHeader::new(ArenaId::containing(CHUNK_SIZE * 8), CompartmentId::ATOMS, kind)
    }

    #[test]
    fn test_new_arena_is_one_full_span() {
        let h = header(AllocKind::Object4);
        assert!(h.is_empty());
        assert_eq!(h.free_count(), AllocKind::Object4.things_per_arena());
        assert!(h.in_free_list(0));
        assert!(h.in_free_list(h.things_per_arena() - 1));
    }

    #[test]
    fn test_free_list_pops_in_address_order() {
        let mut h = header(AllocKind::String);
        let spans = h.take_free_spans();
        assert!(!h.has_free_things());

        let mut list = FreeList::new(h.address, h.kind, spans);
        let a = list.allocate().expect("slot");
        let b = list.allocate().expect("slot");
        assert_eq!(a.addr(), h.address.addr());
        assert_eq!(b.addr() - a.addr(), AllocKind::String.thing_size());

        h.restore_free_spans(list.into_spans());
        assert!(!h.in_free_list(0));
        assert!(!h.in_free_list(1));
        assert!(h.in_free_list(2));
        assert_eq!(h.allocated_indices().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_mark_colors() {
        let mut h = header(AllocKind::Shape);
        assert!(h.mark(3, MarkColor::Gray));
        assert!(h.is_gray(3));
        assert!(!h.mark(3, MarkColor::Black));
        assert!(h.is_marked(3));
        h.clear_marks();
        assert!(!h.is_marked(3));
    }

    #[test]
    fn test_thing_index_rejects_interior() {
        let h = header(AllocKind::Object2);
        let size = AllocKind::Object2.thing_size();
        let second = GcCell::from_word(h.address.addr() + size).expect("non-zero");
        let interior = GcCell::from_word(h.address.addr() + size + 8).expect("non-zero");
        assert_eq!(h.thing_index(second), Some(1));
        assert_eq!(h.thing_index(interior), None);
        assert_eq!(h.thing_index_containing(size + 8), Some(1));
    }

    #[test]
    fn test_finalize_rebuilds_spans_and_runs_hooks() {
        let memory = ChunkMemory::map(Arc::new(SystemPages)).expect("chunk");
        let kind = AllocKind::Object0;
        let mut h = ArenaHeader::new(ArenaId::containing(memory.base()), CompartmentId::ATOMS, kind);

        // Allocate the first six things; keep 1 and 4 alive.
        let mut list = FreeList::new(h.address, kind, h.take_free_spans());
        for _ in 0..6 {
            list.allocate().expect("slot");
        }
        h.restore_free_spans(list.into_spans());
        h.mark(1, MarkColor::Black);
        h.mark(4, MarkColor::Gray);

        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finalized);
        let mut hooks = TraceHooks::new();
        hooks.set_finalize(kind.trace_kind(), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let (outcome, count) = h.finalize(&memory, &hooks);
        assert_eq!(outcome, SweepOutcome::Partial);
        assert_eq!(count, 4);
        assert_eq!(finalized.load(Ordering::Relaxed), 4);
        assert_eq!(h.allocated_indices().collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(h.free_count() + 2, kind.things_per_arena());
    }

    #[test]
    fn test_finalize_reports_empty_and_full() {
        let memory = ChunkMemory::map(Arc::new(SystemPages)).expect("chunk");
        let hooks = TraceHooks::new();
        let kind = AllocKind::Object16;
        let n = kind.things_per_arena();

        let mut empty = ArenaHeader::new(ArenaId::containing(memory.base()), CompartmentId::ATOMS, kind);
        let mut list = FreeList::new(empty.address, kind, empty.take_free_spans());
        list.allocate().expect("slot");
        empty.restore_free_spans(list.into_spans());
        assert_eq!(empty.finalize(&memory, &hooks), (SweepOutcome::Empty, 1));
        assert!(empty.is_empty());

        let mut full = ArenaHeader::new(ArenaId::containing(memory.base()), CompartmentId::ATOMS, kind);
        let mut list = FreeList::new(full.address, kind, full.take_free_spans());
        while list.allocate().is_some() {}
        full.restore_free_spans(list.into_spans());
        for i in 0..n {
            full.mark(i, MarkColor::Black);
        }
        assert_eq!(full.finalize(&memory, &hooks), (SweepOutcome::Full, 0));
    }
}
