//! Mark-phase worklist.
//!
//! The marker keeps an explicit stack bounded by `mark_stack_limit`. When a
//! newly marked thing cannot be pushed, its arena is put on an intrusive
//! stack of arenas with delayed marking instead; once the main stack is
//! empty each delayed arena is rescanned and every marked thing in it has
//! its children traced again. Auxiliary memory stays bounded no matter how
//! deep the object graph is.

use std::sync::Arc;

use crate::cell::{GcCell, ThingView};
use crate::compartment::CompartmentId;
use crate::heap::arena::MarkColor;
use crate::heap::{ArenaId, GcHeap};
use crate::trace::{TraceHooks, Tracer};
use crate::weak::WeakMarker;

pub(crate) struct GcMarker<'a> {
    heap: &'a mut GcHeap,
    hooks: &'a TraceHooks,
    stack: Vec<GcCell>,
    limit: usize,
    color: MarkColor,
    /// Compartment being collected; things elsewhere count as marked.
    scope: Option<CompartmentId>,
    /// Head of the delayed-marking arena stack.
    delayed: Option<ArenaId>,
    pub(crate) delayed_arenas: usize,
    pub(crate) marked: usize,
}

impl<'a> GcMarker<'a> {
    pub(crate) fn new(
        heap: &'a mut GcHeap,
        hooks: &'a TraceHooks,
        scope: Option<CompartmentId>,
        limit: usize,
    ) -> Self {
        Self {
            heap,
            hooks,
            stack: Vec::with_capacity(limit.min(1024)),
            limit,
            color: MarkColor::Black,
            scope,
            delayed: None,
            delayed_arenas: 0,
            marked: 0,
        }
    }

    pub(crate) fn set_color(&mut self, color: MarkColor) {
        debug_assert!(self.stack.is_empty() && self.delayed.is_none());
        self.color = color;
    }

    /// Mark `cell` and queue its children. Returns true if it was unmarked.
    pub(crate) fn mark(&mut self, cell: GcCell) -> bool {
        let arena = cell.arena();
        let Some(header) = self.heap.header_mut(arena) else {
            debug_assert!(false, "marking {cell:?} outside any allocated arena");
            return false;
        };
        if self.scope.is_some_and(|scope| header.compartment != scope) {
            return false;
        }
        let Some(index) = header.thing_index(cell) else {
            debug_assert!(false, "marking misaligned {cell:?}");
            return false;
        };
        if !header.mark(index, self.color) {
            return false;
        }
        self.marked += 1;

        if self.stack.len() < self.limit {
            self.stack.push(cell);
        } else if !header.has_delayed_marking {
            header.has_delayed_marking = true;
            header.next_delayed = self.delayed.replace(arena);
            self.delayed_arenas += 1;
        }
        true
    }

    /// Whether `cell` survives the current collection so far.
    pub(crate) fn is_marked(&self, cell: GcCell) -> bool {
        let Some(header) = self.heap.header(cell.arena()) else {
            return false;
        };
        if self.scope.is_some_and(|scope| header.compartment != scope) {
            return true;
        }
        header
            .thing_index(cell)
            .is_some_and(|index| header.is_marked(index))
    }

    /// Trace until both the stack and the delayed arenas are empty.
    pub(crate) fn drain(&mut self) {
        loop {
            while let Some(cell) = self.stack.pop() {
                self.trace_children(cell);
            }
            let Some(arena) = self.delayed else {
                break;
            };
            let Some(header) = self.heap.header_mut(arena) else {
                debug_assert!(false, "delayed marking on unallocated {arena:?}");
                self.delayed = None;
                break;
            };
            self.delayed = header.next_delayed.take();
            header.has_delayed_marking = false;
            self.mark_delayed_children(arena);
        }
    }

    fn mark_delayed_children(&mut self, arena: ArenaId) {
        let Some((count, size)) = self
            .heap
            .header(arena)
            .map(|h| (h.things_per_arena(), h.thing_size()))
        else {
            return;
        };
        for index in 0..count {
            let marked = self
                .heap
                .header(arena)
                .is_some_and(|h| h.is_marked(index));
            if !marked {
                continue;
            }
            if let Some(cell) = GcCell::from_word(arena.addr() + index * size) {
                self.trace_children(cell);
            }
        }
    }

    fn trace_children(&mut self, cell: GcCell) {
        let Some(kind) = self.heap.header(cell.arena()).map(|h| h.kind) else {
            return;
        };
        if !self.hooks.has_trace(kind.trace_kind()) {
            return;
        }
        let Some(memory) = self.heap.memory(cell.chunk()).map(Arc::clone) else {
            return;
        };
        let view = ThingView::new(cell, kind, memory.thing_words(cell.addr(), kind.thing_size()));
        let hooks = self.hooks;
        hooks.trace_children(&view, self);
    }
}

impl Tracer for GcMarker<'_> {
    #[inline]
    fn trace_cell(&mut self, cell: GcCell) {
        self.mark(cell);
    }
}

impl WeakMarker for GcMarker<'_> {
    fn is_marked(&self, cell: GcCell) -> bool {
        GcMarker::is_marked(self, cell)
    }

    fn mark(&mut self, cell: GcCell) -> bool {
        GcMarker::mark(self, cell)
    }
}
