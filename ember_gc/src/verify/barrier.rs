//! Pre-write barrier verification.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::cell::GcCell;
use crate::collector::GcState;

type Edges = SmallVec<[GcCell; 4]>;

/// An edge that disappeared without its old target passing the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierViolation {
    /// Thing whose field was overwritten.
    pub source: GcCell,
    /// Old target of the field.
    pub target: GcCell,
}

/// Outcome of one verification window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierReport {
    /// Things in the starting snapshot.
    pub nodes: usize,
    /// Edges in the starting snapshot.
    pub edges: usize,
    /// Removed edges that skipped the barrier, ordered by source address.
    pub violations: Vec<BarrierViolation>,
}

impl BarrierReport {
    /// No missing barriers were found.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Graph snapshot plus the set of things marked by the pre-barrier since.
#[derive(Debug)]
pub(crate) struct BarrierVerifier {
    graph: FxHashMap<GcCell, Edges>,
    edges: usize,
    barriered: FxHashSet<GcCell>,
}

impl BarrierVerifier {
    /// Snapshot everything reachable from `roots`.
    pub(crate) fn start(state: &GcState, roots: Vec<GcCell>) -> Self {
        let mut graph: FxHashMap<GcCell, Edges> = FxHashMap::default();
        let mut edges = 0;
        let mut pending = roots;
        while let Some(cell) = pending.pop() {
            if graph.contains_key(&cell) {
                continue;
            }
            let Ok(children) = state.children(cell) else {
                continue;
            };
            edges += children.len();
            pending.extend(children.iter().copied());
            graph.insert(cell, Edges::from_vec(children));
        }
        tracing::debug!(nodes = graph.len(), edges, "barrier verification started");
        Self {
            graph,
            edges,
            barriered: FxHashSet::default(),
        }
    }

    /// Record the old value of a field about to be overwritten.
    #[inline]
    pub(crate) fn pre_barrier(&mut self, old: Option<GcCell>) {
        if let Some(cell) = old {
            self.barriered.insert(cell);
        }
    }

    /// Compare the snapshot with the current heap.
    pub(crate) fn finish(self, state: &GcState) -> BarrierReport {
        let mut violations = Vec::new();
        for (&source, before) in &self.graph {
            // Things that died since the snapshot have no edges to compare.
            let Ok(after) = state.children(source) else {
                continue;
            };
            for &target in before {
                if !after.contains(&target) && !self.barriered.contains(&target) {
                    violations.push(BarrierViolation { source, target });
                }
            }
        }
        violations.sort_by_key(|v| (v.source, v.target));
        if !violations.is_empty() {
            tracing::warn!(count = violations.len(), "missing pre-write barriers");
        }
        BarrierReport {
            nodes: self.graph.len(),
            edges: self.edges,
            violations,
        }
    }
}
