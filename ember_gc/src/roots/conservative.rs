//! Conservative native stack scanning.
//!
//! Every aligned word between the scanner's own frame and the recorded
//! stack base is tested against the heap. A word that addresses an
//! allocated thing that is not on a free list, including a pointer into
//! the middle of one, roots that thing.
//!
//! Only the stack is read. A reference held solely in a callee-saved
//! register across a collection is not seen, so the scanner is a fallback
//! behind [`RootScope`](crate::RootScope) rather than a replacement for it.

use crate::cell::GcCell;
use crate::collector::GcState;
use crate::compartment::CompartmentId;
use crate::heap::CELL_SIZE;
use crate::heap::chunk::ArenaSlot;

/// How the words of the last conservative scan were classified.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConservativeStats {
    /// Words inspected.
    pub words: usize,
    /// Not cell aligned, tagged or null.
    pub low_bit: usize,
    /// Outside every chunk.
    pub not_chunk: usize,
    /// In an arena that is free or decommitted.
    pub free_arena: usize,
    /// In a compartment outside the collection.
    pub other_compartment: usize,
    /// In padding or a free slot.
    pub not_live: usize,
    /// Rooted a thing.
    pub valid: usize,
}

impl ConservativeStats {
    fn record(&mut self, class: WordClass) {
        self.words += 1;
        let counter = match class {
            WordClass::LowBit => &mut self.low_bit,
            WordClass::NotChunk => &mut self.not_chunk,
            WordClass::FreeArena => &mut self.free_arena,
            WordClass::OtherCompartment => &mut self.other_compartment,
            WordClass::NotLive => &mut self.not_live,
            WordClass::Valid(_) => &mut self.valid,
        };
        *counter += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WordClass {
    LowBit,
    NotChunk,
    FreeArena,
    OtherCompartment,
    NotLive,
    /// Start of the thing the word points into.
    Valid(GcCell),
}

/// Decide whether `word` addresses a live thing.
pub(crate) fn classify_word(state: &GcState, scope: Option<CompartmentId>, word: usize) -> WordClass {
    if word == 0 || word & (CELL_SIZE - 1) != 0 {
        return WordClass::LowBit;
    }
    let Some(cell) = GcCell::from_word(word) else {
        return WordClass::LowBit;
    };
    let Some(chunk) = state.heap.chunk(cell.chunk()) else {
        return WordClass::NotChunk;
    };
    let arena = cell.arena();
    let header = match chunk.slot(arena.index()) {
        ArenaSlot::Allocated(header) => header,
        ArenaSlot::Free | ArenaSlot::Decommitting | ArenaSlot::Sweeping { .. } => {
            return WordClass::FreeArena;
        }
    };
    if scope.is_some_and(|scope| header.compartment != scope) {
        return WordClass::OtherCompartment;
    }
    let Some(index) = header.thing_index_containing(cell.arena_offset()) else {
        return WordClass::NotLive;
    };
    let free = header.in_free_list(index)
        || state
            .compartments
            .get(&header.compartment)
            .is_some_and(|c| c.arenas.free_list_contains(header.kind, arena, index));
    if free {
        return WordClass::NotLive;
    }
    match GcCell::from_word(header.thing_address(index)) {
        Some(thing) => WordClass::Valid(thing),
        None => WordClass::NotLive,
    }
}

/// Things referenced from the native stack.
///
/// Empty unless the crate is built with the `conservative` feature, the
/// runtime enables scanning and a stack base has been recorded.
pub(crate) fn native_stack_roots(
    state: &GcState,
    scope: Option<CompartmentId>,
    stack_base: Option<usize>,
) -> (Vec<GcCell>, ConservativeStats) {
    let mut stats = ConservativeStats::default();
    let mut cells = Vec::new();
    let Some(base) = stack_base else {
        return (cells, stats);
    };
    if !cfg!(feature = "conservative") || !state.config.conservative_stack_scanning {
        return (cells, stats);
    }

    scan_native_stack(base, |word| {
        let class = classify_word(state, scope, word);
        stats.record(class);
        if let WordClass::Valid(cell) = class {
            cells.push(cell);
        }
    });
    tracing::trace!(words = stats.words, valid = stats.valid, "native stack scanned");
    (cells, stats)
}

/// Visit each aligned word from this frame up to `base`.
#[inline(never)]
fn scan_native_stack(base: usize, mut visit: impl FnMut(usize)) {
    const WORD: usize = std::mem::size_of::<usize>();

    let anchor = 0usize;
    let here = std::hint::black_box(&anchor) as *const usize as usize;
    let (low, high) = if here <= base { (here, base) } else { (base, here) };
    let mut addr = (low + WORD - 1) & !(WORD - 1);
    while addr + WORD <= high {
        // Safety: the range lies between two live frames of this thread's
        // stack, and `addr` is word aligned.
        let word = unsafe { std::ptr::read_volatile(addr as *const usize) };
        visit(word);
        addr += WORD;
    }
}
