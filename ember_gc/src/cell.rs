//! Handles to heap things and read-only views used by hooks.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::{ARENA_MASK, ArenaId, ChunkId};
use crate::kind::AllocKind;

/// Address of a heap thing.
///
/// A `GcCell` is a plain copyable address; holding one does not keep the
/// thing alive. Root it (see [`RootScope`](crate::RootScope) and
/// [`Runtime::add_root`](crate::Runtime::add_root)) across anything that may
/// collect.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GcCell(NonZeroUsize);

impl GcCell {
    /// Decode an edge word. Zero is the null edge.
    #[inline]
    pub const fn from_word(word: usize) -> Option<GcCell> {
        match NonZeroUsize::new(word) {
            Some(addr) => Some(GcCell(addr)),
            None => None,
        }
    }

    /// Encode an optional edge as a word.
    #[inline]
    pub const fn edge_word(edge: Option<GcCell>) -> usize {
        match edge {
            Some(cell) => cell.addr(),
            None => 0,
        }
    }

    /// Raw address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub(crate) fn chunk(self) -> ChunkId {
        ChunkId::containing(self.addr())
    }

    #[inline]
    pub(crate) fn arena(self) -> ArenaId {
        ArenaId::containing(self.addr())
    }

    #[inline]
    pub(crate) fn arena_offset(self) -> usize {
        self.addr() & ARENA_MASK
    }
}

impl fmt::Debug for GcCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcCell({:#x})", self.addr())
    }
}

/// Word-level view of one thing, handed to trace and finalize hooks.
///
/// Things are arrays of machine words. Which words hold edges is up to the
/// embedder's hooks.
pub struct ThingView<'a> {
    cell: GcCell,
    kind: AllocKind,
    words: &'a [AtomicUsize],
}

impl<'a> ThingView<'a> {
    pub(crate) fn new(cell: GcCell, kind: AllocKind, words: &'a [AtomicUsize]) -> Self {
        Self { cell, kind, words }
    }

    /// The thing being viewed.
    #[inline]
    pub fn cell(&self) -> GcCell {
        self.cell
    }

    /// Its allocation kind.
    #[inline]
    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    /// Number of words in the thing.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Always false; things have at least one word.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Word `index`. Panics when out of bounds.
    #[inline]
    pub fn word(&self, index: usize) -> usize {
        self.words[index].load(Ordering::Relaxed)
    }

    /// Word `index` decoded as an edge.
    #[inline]
    pub fn edge(&self, index: usize) -> Option<GcCell> {
        GcCell::from_word(self.word(index))
    }

    #[inline]
    pub(crate) fn set_word(&self, index: usize, word: usize) {
        self.words[index].store(word, Ordering::Relaxed);
    }
}

impl fmt::Debug for ThingView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThingView")
            .field("cell", &self.cell)
            .field("kind", &self.kind)
            .field("words", &self.words.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_word_is_no_edge() {
        assert_eq!(GcCell::from_word(0), None);
        assert_eq!(GcCell::edge_word(None), 0);
    }

    #[test]
    fn test_edge_word_round_trip() {
        let cell = GcCell::from_word(0x10_0040).expect("non-zero");
        assert_eq!(GcCell::edge_word(Some(cell)), 0x10_0040);
        assert_eq!(cell.arena_offset(), 0x40);
    }

    #[test]
    fn test_view_reads_words() {
        let words: Vec<AtomicUsize> = (0..4).map(AtomicUsize::new).collect();
        let cell = GcCell::from_word(0x2000).expect("non-zero");
        let view = ThingView::new(cell, AllocKind::ShortString, &words);
        assert_eq!(view.len(), 4);
        assert_eq!(view.word(3), 3);
        assert_eq!(view.edge(0), None);
        assert_eq!(view.edge(2).map(GcCell::addr), Some(2));
    }
}
