//! Weak structures: ephemeron maps, embedder weak tables and the atom table.
//!
//! Weak structures are processed in two places. During marking they are
//! iterated to a fixed point: an entry whose holder turned out to be live
//! may make more things reachable. During sweeping, before any finalizer
//! runs, entries that refer to dying things are dropped.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::cell::GcCell;
use crate::compartment::CompartmentId;
use crate::heap::GcHeap;
use crate::trace::Tracer;

// =============================================================================
// Marking and liveness interfaces
// =============================================================================

/// Marking access handed to weak structures during the fixed-point loop.
pub trait WeakMarker {
    /// Whether `cell` is known to survive so far. Things outside the
    /// collected compartment always are.
    fn is_marked(&self, cell: GcCell) -> bool;

    /// Mark `cell`. Returns true if it was not marked before.
    fn mark(&mut self, cell: GcCell) -> bool;
}

/// Liveness queries during sweeping.
pub struct Liveness<'a> {
    heap: &'a GcHeap,
    scope: Option<CompartmentId>,
}

impl<'a> Liveness<'a> {
    pub(crate) fn new(heap: &'a GcHeap, scope: Option<CompartmentId>) -> Self {
        Self { heap, scope }
    }

    /// True if `cell` was not marked and will be finalized by this
    /// collection. Things outside the collected compartment never are.
    pub fn is_about_to_be_finalized(&self, cell: GcCell) -> bool {
        let Some(header) = self.heap.header(cell.arena()) else {
            return false;
        };
        if self.scope.is_some_and(|scope| header.compartment != scope) {
            return false;
        }
        header
            .thing_index(cell)
            .is_some_and(|index| !header.is_marked(index))
    }
}

impl fmt::Debug for Liveness<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Liveness").field("scope", &self.scope).finish()
    }
}

/// An embedder table with weak semantics, such as watchpoints or debugger
/// object maps.
pub trait WeakRoots {
    /// Mark whatever became reachable through entries whose holders are now
    /// marked. Return true if anything new was marked.
    fn mark_iteratively(&mut self, marker: &mut dyn WeakMarker) -> bool;

    /// Drop entries that refer to dying things.
    fn sweep(&mut self, liveness: &Liveness<'_>);
}

// =============================================================================
// Weak maps
// =============================================================================

/// Handle to a weak map created with
/// [`Runtime::create_weak_map`](crate::Runtime::create_weak_map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakMapId(u32);

/// Ephemeron tables: a value is reachable if its map entry's key is.
#[derive(Debug, Default)]
pub(crate) struct WeakMaps {
    maps: FxHashMap<WeakMapId, FxHashMap<GcCell, GcCell>>,
    next: u32,
}

impl WeakMaps {
    pub(crate) fn create(&mut self) -> WeakMapId {
        let id = WeakMapId(self.next);
        self.next += 1;
        self.maps.insert(id, FxHashMap::default());
        id
    }

    pub(crate) fn destroy(&mut self, id: WeakMapId) -> bool {
        self.maps.remove(&id).is_some()
    }

    pub(crate) fn get_map(&self, id: WeakMapId) -> Option<&FxHashMap<GcCell, GcCell>> {
        self.maps.get(&id)
    }

    pub(crate) fn get_map_mut(&mut self, id: WeakMapId) -> Option<&mut FxHashMap<GcCell, GcCell>> {
        self.maps.get_mut(&id)
    }

    pub(crate) fn mark_iteratively(&self, marker: &mut dyn WeakMarker) -> bool {
        let mut progressed = false;
        for map in self.maps.values() {
            for (&key, &value) in map {
                if marker.is_marked(key) && !marker.is_marked(value) {
                    progressed |= marker.mark(value);
                }
            }
        }
        progressed
    }

    /// Drop entries with a dying key or value. Returns how many went.
    pub(crate) fn sweep(&mut self, liveness: &Liveness<'_>) -> usize {
        let mut removed = 0;
        for map in self.maps.values_mut() {
            let before = map.len();
            map.retain(|&key, &mut value| {
                !liveness.is_about_to_be_finalized(key) && !liveness.is_about_to_be_finalized(value)
            });
            removed += before - map.len();
        }
        removed
    }
}

// =============================================================================
// Atoms
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct AtomEntry {
    cell: GcCell,
    pinned: bool,
}

/// Interned strings of the atoms compartment.
///
/// Pinned atoms are always roots. While [`keep_atoms`](Self::keep_atoms)
/// is non-zero every atom is.
#[derive(Debug, Default)]
pub(crate) struct AtomTable {
    by_text: FxHashMap<String, AtomEntry>,
    by_cell: FxHashMap<GcCell, String>,
    pub(crate) keep_atoms: usize,
}

impl AtomTable {
    /// Find an existing atom, pinning it if asked.
    pub(crate) fn lookup(&mut self, text: &str, pin: bool) -> Option<GcCell> {
        let entry = self.by_text.get_mut(text)?;
        entry.pinned |= pin;
        Some(entry.cell)
    }

    pub(crate) fn insert(&mut self, text: &str, cell: GcCell, pinned: bool) {
        self.by_text
            .insert(text.to_owned(), AtomEntry { cell, pinned });
        self.by_cell.insert(cell, text.to_owned());
    }

    pub(crate) fn text(&self, cell: GcCell) -> Option<&str> {
        self.by_cell.get(&cell).map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_text.len()
    }

    /// Report atoms that are roots.
    pub(crate) fn trace(&self, tracer: &mut dyn Tracer) {
        let keep_all = self.keep_atoms > 0;
        for entry in self.by_text.values() {
            if keep_all || entry.pinned {
                tracer.trace_cell(entry.cell);
            }
        }
    }

    /// Forget atoms that are about to be finalized.
    pub(crate) fn sweep(&mut self, liveness: &Liveness<'_>) -> usize {
        let before = self.by_text.len();
        let by_cell = &mut self.by_cell;
        self.by_text.retain(|_, entry| {
            let dying = liveness.is_about_to_be_finalized(entry.cell);
            if dying {
                by_cell.remove(&entry.cell);
            }
            !dying
        });
        before - self.by_text.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CollectingTracer;

    fn cell(addr: usize) -> GcCell {
        GcCell::from_word(addr).expect("non-zero")
    }

    /// Marker over a plain set, for exercising the fixed-point logic.
    #[derive(Default)]
    struct SetMarker(rustc_hash::FxHashSet<GcCell>);

    impl WeakMarker for SetMarker {
        fn is_marked(&self, cell: GcCell) -> bool {
            self.0.contains(&cell)
        }

        fn mark(&mut self, cell: GcCell) -> bool {
            self.0.insert(cell)
        }
    }

    #[test]
    fn test_weak_map_marks_values_of_live_keys() {
        let mut maps = WeakMaps::default();
        let id = maps.create();
        let map = maps.get_map_mut(id).expect("map");
        map.insert(cell(0x10), cell(0x20));
        map.insert(cell(0x20), cell(0x30));
        map.insert(cell(0x40), cell(0x50));

        let mut marker = SetMarker::default();
        marker.mark(cell(0x10));
        // Chains resolve over successive passes.
        assert!(maps.mark_iteratively(&mut marker));
        while maps.mark_iteratively(&mut marker) {}
        assert!(marker.is_marked(cell(0x30)));
        assert!(!marker.is_marked(cell(0x50)));
    }

    #[test]
    fn test_destroyed_map_is_gone() {
        let mut maps = WeakMaps::default();
        let id = maps.create();
        assert!(maps.destroy(id));
        assert!(!maps.destroy(id));
        assert!(maps.get_map(id).is_none());
    }

    #[test]
    fn test_atom_lookup_pins() {
        let mut atoms = AtomTable::default();
        atoms.insert("length", cell(0x100), false);
        atoms.insert("proto", cell(0x200), false);
        assert_eq!(atoms.lookup("length", true), Some(cell(0x100)));
        assert_eq!(atoms.text(cell(0x200)), Some("proto"));

        let mut tracer = CollectingTracer::default();
        atoms.trace(&mut tracer);
        assert_eq!(tracer.edges, vec![cell(0x100)]);

        atoms.keep_atoms += 1;
        let mut tracer = CollectingTracer::default();
        atoms.trace(&mut tracer);
        assert_eq!(tracer.edges.len(), 2);
    }
}
