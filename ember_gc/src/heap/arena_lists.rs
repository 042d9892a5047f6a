//! Per-compartment arena lists and free lists.
//!
//! For every alloc kind a compartment keeps the arenas it owns in a list
//! with a cursor. Arenas before the cursor are full (or already handed to
//! the free list); arenas at and after it still have free things. The free
//! list holds the spans of the arena currently being allocated from.
//!
//! Kinds finalized on the helper thread also carry a
//! [`BackgroundFinalizeState`]. While it is `Run` the list is owned by the
//! helper and allocation must mint new arenas instead of reading the cursor.

use std::array;

use crate::cell::GcCell;
use crate::heap::arena::FreeList;
use crate::heap::{ArenaId, GcHeap};
use crate::kind::{ALLOC_KIND_COUNT, AllocKind};

/// Coordination between the allocator and background finalization of one
/// kind's arena list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum BackgroundFinalizeState {
    /// No background finalization touches the list.
    #[default]
    Done,
    /// The helper thread owns the swept arenas; new arenas go to the head.
    Run,
    /// The helper relinked the list; the next allocation takes the lock
    /// and downgrades this to `Done`.
    JustFinished,
}

/// Arenas of one kind in one compartment.
#[derive(Debug, Default)]
pub(crate) struct ArenaList {
    arenas: Vec<ArenaId>,
    cursor: usize,
}

impl ArenaList {
    /// Build a list from sweep results: full arenas, then arenas with room.
    pub(crate) fn from_finalized(full: Vec<ArenaId>, partial: Vec<ArenaId>) -> Self {
        let cursor = full.len();
        let mut arenas = full;
        arenas.extend(partial);
        Self { arenas, cursor }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.arenas.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn arenas(&self) -> &[ArenaId] {
        &self.arenas
    }

    pub(crate) fn into_arenas(self) -> Vec<ArenaId> {
        self.arenas
    }

    /// Link a fresh arena at the head, counted as full.
    fn insert_at_head(&mut self, arena: ArenaId) {
        self.arenas.insert(0, arena);
        self.cursor += 1;
    }

    /// Step the cursor over the next arena with free things.
    fn advance(&mut self) -> Option<ArenaId> {
        let arena = *self.arenas.get(self.cursor)?;
        self.cursor += 1;
        Some(arena)
    }

    /// Append what the helper thread finalized after the arenas minted
    /// while it ran.
    fn append_finalized(&mut self, finalized: ArenaList) {
        debug_assert_eq!(self.cursor, self.arenas.len());
        let base = self.arenas.len();
        self.arenas.extend(finalized.arenas);
        self.cursor = base + finalized.cursor;
    }
}

/// Arena lists, free lists and background states of one compartment.
#[derive(Debug)]
pub(crate) struct ArenaLists {
    lists: [ArenaList; ALLOC_KIND_COUNT],
    free_lists: [Option<FreeList>; ALLOC_KIND_COUNT],
    background: [BackgroundFinalizeState; ALLOC_KIND_COUNT],
}

impl Default for ArenaLists {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaLists {
    pub(crate) fn new() -> Self {
        Self {
            lists: array::from_fn(|_| ArenaList::default()),
            free_lists: array::from_fn(|_| None),
            background: [BackgroundFinalizeState::Done; ALLOC_KIND_COUNT],
        }
    }

    #[inline]
    pub(crate) fn list(&self, kind: AllocKind) -> &ArenaList {
        &self.lists[kind.index()]
    }

    #[cfg(test)]
    pub(crate) fn background_state(&self, kind: AllocKind) -> BackgroundFinalizeState {
        self.background[kind.index()]
    }

    pub(crate) fn set_background_state(&mut self, kind: AllocKind, state: BackgroundFinalizeState) {
        self.background[kind.index()] = state;
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Pop a thing off the free list of `kind`.
    #[inline]
    pub(crate) fn allocate_from_free_list(&mut self, kind: AllocKind) -> Option<GcCell> {
        let slot = &mut self.free_lists[kind.index()];
        let list = slot.as_mut()?;
        let cell = list.allocate();
        if list.is_empty() {
            *slot = None;
        }
        cell
    }

    /// Move the next arena with free things under the cursor to the free
    /// list and allocate from it.
    ///
    /// Returns `None` when a new arena is needed, either because the list
    /// is exhausted or because the helper thread owns it.
    pub(crate) fn allocate_from_list(&mut self, kind: AllocKind, heap: &mut GcHeap) -> Option<GcCell> {
        let k = kind.index();
        match self.background[k] {
            BackgroundFinalizeState::Run => return None,
            BackgroundFinalizeState::JustFinished => {
                self.background[k] = BackgroundFinalizeState::Done;
            }
            BackgroundFinalizeState::Done => {}
        }
        debug_assert!(self.free_lists[k].is_none());

        let arena = self.lists[k].advance()?;
        let header = heap.header_mut(arena)?;
        debug_assert!(header.has_free_things() && !header.is_empty());
        let spans = header.take_free_spans();
        self.free_lists[k] = Some(FreeList::new(arena, kind, spans));
        self.allocate_from_free_list(kind)
    }

    /// Link a freshly allocated arena at the head of the list and allocate
    /// its first thing.
    pub(crate) fn allocate_from_new_arena(
        &mut self,
        kind: AllocKind,
        arena: ArenaId,
        heap: &mut GcHeap,
    ) -> Option<GcCell> {
        let k = kind.index();
        debug_assert!(self.free_lists[k].is_none());
        self.lists[k].insert_at_head(arena);
        let spans = heap.header_mut(arena)?.take_free_spans();
        self.free_lists[k] = Some(FreeList::new(arena, kind, spans));
        self.allocate_from_free_list(kind)
    }

    /// Whether thing `index` of `arena` sits in the active free list.
    pub(crate) fn free_list_contains(&self, kind: AllocKind, arena: ArenaId, index: usize) -> bool {
        self.free_lists[kind.index()]
            .as_ref()
            .is_some_and(|list| list.arena == arena && list.contains(index))
    }

    /// Copy every free list back into its arena header.
    pub(crate) fn purge(&mut self, heap: &mut GcHeap) {
        for slot in &mut self.free_lists {
            if let Some(list) = slot.take() {
                let arena = list.arena;
                match heap.header_mut(arena) {
                    Some(header) => header.restore_free_spans(list.into_spans()),
                    None => debug_assert!(false, "free list for unallocated {arena:?}"),
                }
            }
        }
    }

    // =========================================================================
    // Sweeping
    // =========================================================================

    /// Detach the list of `kind` for finalization.
    pub(crate) fn take_list(&mut self, kind: AllocKind) -> ArenaList {
        debug_assert!(self.free_lists[kind.index()].is_none());
        std::mem::take(&mut self.lists[kind.index()])
    }

    pub(crate) fn set_list(&mut self, kind: AllocKind, list: ArenaList) {
        debug_assert!(self.lists[kind.index()].is_empty());
        self.lists[kind.index()] = list;
    }

    /// Relink arenas finalized on the helper thread.
    ///
    /// The state becomes `JustFinished` when anything was appended so the
    /// next allocation synchronizes with the lock, `Done` otherwise.
    pub(crate) fn finish_background_finalize(&mut self, kind: AllocKind, finalized: ArenaList) {
        let k = kind.index();
        debug_assert_eq!(self.background[k], BackgroundFinalizeState::Run);
        let appended = !finalized.is_empty();
        if appended {
            self.lists[k].append_finalized(finalized);
        }
        self.background[k] = if appended {
            BackgroundFinalizeState::JustFinished
        } else {
            BackgroundFinalizeState::Done
        };
    }

    /// No arenas and no background finalization in flight.
    pub(crate) fn are_empty(&self) -> bool {
        self.lists.iter().all(ArenaList::is_empty)
            && self
                .background
                .iter()
                .all(|state| *state == BackgroundFinalizeState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentId;
    use crate::config::GcConfig;
    use crate::heap::platform::SystemPages;
    use crate::stats::GcStats;
    use crate::trigger::HeapTrigger;
    use std::sync::Arc;

    fn heap() -> GcHeap {
        GcHeap::new(
            Arc::new(SystemPages),
            HeapTrigger::new(&GcConfig::for_testing()),
            Arc::new(GcStats::new()),
        )
    }

    fn new_arena(heap: &mut GcHeap, kind: AllocKind) -> ArenaId {
        let (chunk, _) = heap.pick_chunk(false, false).expect("chunk");
        heap.allocate_arena(chunk, CompartmentId::ATOMS, kind)
            .expect("arena")
    }

    #[test]
    fn test_new_arena_goes_to_head() {
        let mut heap = heap();
        let mut lists = ArenaLists::new();
        let kind = AllocKind::Object16;

        let a = new_arena(&mut heap, kind);
        let first = lists.allocate_from_new_arena(kind, a, &mut heap).expect("thing");
        assert_eq!(first.addr(), a.addr());

        // Drain the first arena, then mint a second one.
        while lists.allocate_from_free_list(kind).is_some() {}
        assert_eq!(lists.allocate_from_list(kind, &mut heap), None);
        let b = new_arena(&mut heap, kind);
        lists.allocate_from_new_arena(kind, b, &mut heap).expect("thing");

        assert_eq!(lists.list(kind).arenas(), &[b, a]);
        assert_eq!(lists.list(kind).cursor(), 2);
    }

    #[test]
    fn test_run_state_forces_new_arena() {
        let mut heap = heap();
        let mut lists = ArenaLists::new();
        let kind = AllocKind::String;

        // One arena with room left, purged back to its header.
        let a = new_arena(&mut heap, kind);
        lists.allocate_from_new_arena(kind, a, &mut heap).expect("thing");
        lists.purge(&mut heap);
        let taken = lists.take_list(kind);
        lists.set_list(kind, ArenaList::from_finalized(Vec::new(), taken.into_arenas()));

        lists.set_background_state(kind, BackgroundFinalizeState::Run);
        assert_eq!(lists.allocate_from_list(kind, &mut heap), None);

        lists.set_background_state(kind, BackgroundFinalizeState::JustFinished);
        let thing = lists.allocate_from_list(kind, &mut heap).expect("thing");
        assert_eq!(thing.addr(), a.addr() + kind.thing_size());
        assert_eq!(lists.background_state(kind), BackgroundFinalizeState::Done);
    }

    #[test]
    fn test_background_relink_keeps_new_arenas_first() {
        let mut lists = ArenaLists::new();
        let kind = AllocKind::ShortString;
        let ids: Vec<ArenaId> = (1..=4).map(|i| ArenaId::containing(i * 0x1000)).collect();

        lists.set_background_state(kind, BackgroundFinalizeState::Run);
        lists.lists[kind.index()].insert_at_head(ids[0]);

        let finalized = ArenaList::from_finalized(vec![ids[1]], vec![ids[2], ids[3]]);
        lists.finish_background_finalize(kind, finalized);

        assert_eq!(lists.list(kind).arenas(), &[ids[0], ids[1], ids[2], ids[3]]);
        assert_eq!(lists.list(kind).cursor(), 2);
        assert_eq!(lists.background_state(kind), BackgroundFinalizeState::JustFinished);
    }

    #[test]
    fn test_empty_background_result_goes_straight_to_done() {
        let mut lists = ArenaLists::new();
        let kind = AllocKind::Object0Background;
        lists.set_background_state(kind, BackgroundFinalizeState::Run);
        assert!(!lists.are_empty());
        lists.finish_background_finalize(kind, ArenaList::default());
        assert_eq!(lists.background_state(kind), BackgroundFinalizeState::Done);
        assert!(lists.are_empty());
    }
}
