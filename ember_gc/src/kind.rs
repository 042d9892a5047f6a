//! Allocation kinds and trace kinds.
//!
//! Every arena holds things of exactly one [`AllocKind`]. The kind fixes the
//! thing size, which [`TraceKind`] hooks trace and finalize it, and whether
//! its arenas may be finalized on the helper thread.

use crate::heap::{ARENA_SIZE, CELL_SIZE};

/// Size class of a heap thing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocKind {
    /// Object with no inline slots.
    Object0 = 0,
    /// Background-finalizable object with no inline slots.
    Object0Background,
    /// Object with 2 inline slots.
    Object2,
    /// Background-finalizable object with 2 inline slots.
    Object2Background,
    /// Object with 4 inline slots.
    Object4,
    /// Background-finalizable object with 4 inline slots.
    Object4Background,
    /// Object with 8 inline slots.
    Object8,
    /// Background-finalizable object with 8 inline slots.
    Object8Background,
    /// Object with 12 inline slots.
    Object12,
    /// Background-finalizable object with 12 inline slots.
    Object12Background,
    /// Object with 16 inline slots.
    Object16,
    /// Background-finalizable object with 16 inline slots.
    Object16Background,
    /// Compiled script.
    Script,
    /// Property shape.
    Shape,
    /// Shared shape data.
    BaseShape,
    /// Type information record.
    TypeObject,
    /// String with inline characters.
    ShortString,
    /// Heap string.
    String,
    /// String whose characters are owned outside the heap.
    ExternalString,
}

/// Number of allocation kinds.
pub const ALLOC_KIND_COUNT: usize = AllocKind::ExternalString as usize + 1;

/// Which hook pair traces and finalizes a thing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    /// Objects of every slot count.
    Object = 0,
    /// All string kinds.
    String,
    /// Scripts.
    Script,
    /// Shapes.
    Shape,
    /// Base shapes.
    BaseShape,
    /// Type objects.
    TypeObject,
}

/// Number of trace kinds.
pub const TRACE_KIND_COUNT: usize = TraceKind::TypeObject as usize + 1;

/// Words in an object header, ahead of its inline slots.
pub const OBJECT_HEADER_WORDS: usize = 4;

/// Object slot counts at or above this use [`AllocKind::Object16`].
pub const SLOTS_TO_KIND_LIMIT: usize = 17;

const SLOTS_TO_KIND: [AllocKind; SLOTS_TO_KIND_LIMIT] = [
    AllocKind::Object0,
    AllocKind::Object2,
    AllocKind::Object2,
    AllocKind::Object4,
    AllocKind::Object4,
    AllocKind::Object8,
    AllocKind::Object8,
    AllocKind::Object8,
    AllocKind::Object8,
    AllocKind::Object12,
    AllocKind::Object12,
    AllocKind::Object12,
    AllocKind::Object12,
    AllocKind::Object16,
    AllocKind::Object16,
    AllocKind::Object16,
    AllocKind::Object16,
];

impl AllocKind {
    /// All kinds, in table order.
    pub const ALL: [AllocKind; ALLOC_KIND_COUNT] = [
        AllocKind::Object0,
        AllocKind::Object0Background,
        AllocKind::Object2,
        AllocKind::Object2Background,
        AllocKind::Object4,
        AllocKind::Object4Background,
        AllocKind::Object8,
        AllocKind::Object8Background,
        AllocKind::Object12,
        AllocKind::Object12Background,
        AllocKind::Object16,
        AllocKind::Object16Background,
        AllocKind::Script,
        AllocKind::Shape,
        AllocKind::BaseShape,
        AllocKind::TypeObject,
        AllocKind::ShortString,
        AllocKind::String,
        AllocKind::ExternalString,
    ];

    /// Foreground object kind able to hold `slots` inline slots.
    pub fn for_slot_count(slots: usize) -> AllocKind {
        if slots >= SLOTS_TO_KIND_LIMIT {
            return AllocKind::Object16;
        }
        SLOTS_TO_KIND[slots]
    }

    /// Table index of this kind.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Thing size in bytes. Always a multiple of [`CELL_SIZE`].
    pub const fn thing_size(self) -> usize {
        use AllocKind::*;
        let words = match self {
            Object0 | Object0Background => OBJECT_HEADER_WORDS,
            Object2 | Object2Background => OBJECT_HEADER_WORDS + 2,
            Object4 | Object4Background => OBJECT_HEADER_WORDS + 4,
            Object8 | Object8Background => OBJECT_HEADER_WORDS + 8,
            Object12 | Object12Background => OBJECT_HEADER_WORDS + 12,
            Object16 | Object16Background => OBJECT_HEADER_WORDS + 16,
            Script => 16,
            Shape => 5,
            BaseShape => 6,
            TypeObject => 7,
            ShortString => 4,
            String => 2,
            ExternalString => 3,
        };
        words * CELL_SIZE
    }

    /// Number of things that fit in one arena.
    #[inline]
    pub const fn things_per_arena(self) -> usize {
        ARENA_SIZE / self.thing_size()
    }

    /// Hook family for this kind.
    pub const fn trace_kind(self) -> TraceKind {
        use AllocKind::*;
        match self {
            Object0 | Object0Background | Object2 | Object2Background | Object4
            | Object4Background | Object8 | Object8Background | Object12
            | Object12Background | Object16 | Object16Background => TraceKind::Object,
            Script => TraceKind::Script,
            Shape => TraceKind::Shape,
            BaseShape => TraceKind::BaseShape,
            TypeObject => TraceKind::TypeObject,
            ShortString | String | ExternalString => TraceKind::String,
        }
    }

    /// Whether arenas of this kind are finalized on the helper thread.
    pub const fn is_background_finalized(self) -> bool {
        use AllocKind::*;
        matches!(
            self,
            Object0Background
                | Object2Background
                | Object4Background
                | Object8Background
                | Object12Background
                | Object16Background
                | ShortString
                | String
        )
    }

    /// Background twin of a foreground object kind; other kinds map to
    /// themselves.
    pub const fn to_background(self) -> AllocKind {
        use AllocKind::*;
        match self {
            Object0 => Object0Background,
            Object2 => Object2Background,
            Object4 => Object4Background,
            Object8 => Object8Background,
            Object12 => Object12Background,
            Object16 => Object16Background,
            other => other,
        }
    }
}

impl TraceKind {
    /// Table index of this trace kind.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}
