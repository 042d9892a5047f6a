//! Tracer interface for object graph traversal.

use crate::cell::GcCell;

/// Visitor for the edges of a thing or of a root set.
///
/// Trace hooks and root tracers report every edge they hold to a `Tracer`.
/// The collector's marker is one implementation; the barrier verifier and
/// heap inspection use others.
///
/// # Example
///
/// ```ignore
/// use ember_gc::{ThingView, Tracer};
///
/// // Objects keep their prototype in word 0 and slots from word 4 on.
/// fn trace_object(view: &ThingView<'_>, tracer: &mut dyn Tracer) {
///     tracer.trace_edge(view.edge(0));
///     for i in 4..view.len() {
///         tracer.trace_word(view.word(i));
///     }
/// }
/// ```
pub trait Tracer {
    /// Report one reachable thing.
    fn trace_cell(&mut self, cell: GcCell);

    /// Report an edge that may be null.
    #[inline]
    fn trace_edge(&mut self, edge: Option<GcCell>) {
        if let Some(cell) = edge {
            self.trace_cell(cell);
        }
    }

    /// Report a word known to hold an edge encoding.
    #[inline]
    fn trace_word(&mut self, word: usize) {
        self.trace_edge(GcCell::from_word(word));
    }
}

/// A tracer that ignores everything.
pub struct NullTracer;

impl Tracer for NullTracer {
    #[inline]
    fn trace_cell(&mut self, _cell: GcCell) {}
}

/// A tracer that counts the edges it is shown.
#[derive(Debug, Default)]
pub struct CountingTracer {
    /// Number of non-null edges traced.
    pub count: usize,
}

impl CountingTracer {
    /// Create a new counting tracer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for CountingTracer {
    fn trace_cell(&mut self, _cell: GcCell) {
        self.count += 1;
    }
}

/// A tracer that records every edge in order.
#[derive(Debug, Default)]
pub struct CollectingTracer {
    /// Edges in the order they were reported.
    pub edges: Vec<GcCell>,
}

impl Tracer for CollectingTracer {
    fn trace_cell(&mut self, cell: GcCell) {
        self.edges.push(cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(addr: usize) -> GcCell {
        GcCell::from_word(addr).expect("non-zero")
    }

    #[test]
    fn test_counting_tracer_skips_null_edges() {
        let mut tracer = CountingTracer::new();
        tracer.trace_word(0);
        tracer.trace_edge(None);
        tracer.trace_cell(cell(0x1000));
        tracer.trace_word(0x2000);
        assert_eq!(tracer.count, 2);
    }

    #[test]
    fn test_collecting_tracer_preserves_order() {
        let mut tracer = CollectingTracer::default();
        tracer.trace_word(0x3000);
        tracer.trace_edge(Some(cell(0x1000)));
        assert_eq!(tracer.edges, vec![cell(0x3000), cell(0x1000)]);
    }
}
