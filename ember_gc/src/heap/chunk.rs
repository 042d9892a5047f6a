//! Chunks: aligned OS allocations carved into arenas.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::compartment::CompartmentId;
use crate::heap::arena::ArenaHeader;
use crate::heap::platform::PageAllocator;
use crate::heap::{ARENA_SIZE, ARENAS_PER_CHUNK, ArenaId, CHUNK_SIZE, ChunkId};
use crate::kind::AllocKind;

// =============================================================================
// ChunkMemory
// =============================================================================

/// One mapped, `CHUNK_SIZE`-aligned region. Unmapped on drop.
pub(crate) struct ChunkMemory {
    base: NonNull<u8>,
    pages: Arc<dyn PageAllocator>,
}

// Safety: the mapping is plain memory; all access goes through atomics.
unsafe impl Send for ChunkMemory {}
unsafe impl Sync for ChunkMemory {}

impl ChunkMemory {
    pub(crate) fn map(pages: Arc<dyn PageAllocator>) -> Option<Self> {
        let base = pages.map_aligned(CHUNK_SIZE, CHUNK_SIZE)?;
        debug_assert_eq!(base.as_ptr() as usize % CHUNK_SIZE, 0);
        Some(Self { base, pages })
    }

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn id(&self) -> ChunkId {
        ChunkId::containing(self.base())
    }

    /// Words of the thing at `addr`, `size` bytes long.
    #[inline]
    pub(crate) fn thing_words(&self, addr: usize, size: usize) -> &[AtomicUsize] {
        debug_assert!(addr >= self.base() && addr + size <= self.base() + CHUNK_SIZE);
        debug_assert_eq!(addr % std::mem::align_of::<AtomicUsize>(), 0);
        let len = size / std::mem::size_of::<AtomicUsize>();
        // Safety: the range lies inside the live mapping, is word aligned,
        // and all access to heap words is atomic.
        unsafe { std::slice::from_raw_parts(addr as *const AtomicUsize, len) }
    }

    fn arena_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < ARENAS_PER_CHUNK);
        // Safety: index is in bounds, so the pointer stays in the mapping.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * ARENA_SIZE)) }
    }

    pub(crate) fn decommit_arena(&self, index: usize) -> bool {
        // Safety: callers only decommit arenas they have fetched off the
        // free list.
        unsafe { self.pages.decommit(self.arena_ptr(index), ARENA_SIZE) }
    }

    pub(crate) fn commit_arena(&self, index: usize) -> bool {
        unsafe { self.pages.commit(self.arena_ptr(index), ARENA_SIZE) }
    }
}

impl Drop for ChunkMemory {
    fn drop(&mut self) {
        tracing::trace!(base = format_args!("{:#x}", self.base()), "unmapping chunk");
        unsafe { self.pages.unmap(self.base, CHUNK_SIZE) }
    }
}

impl fmt::Debug for ChunkMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkMemory({:#x})", self.base())
    }
}

// =============================================================================
// Chunk
// =============================================================================

/// State of one arena slot in a chunk.
#[derive(Debug)]
pub(crate) enum ArenaSlot {
    /// Not allocated. Whether it is committed is in the decommit bitmap.
    Free,
    /// Fetched off the free list by the decommitter, lock dropped.
    Decommitting,
    /// Allocated to a (compartment, kind) pair.
    Allocated(Box<ArenaHeader>),
    /// Allocated, header lent to the helper thread for finalization.
    Sweeping {
        kind: AllocKind,
        compartment: CompartmentId,
    },
}

/// Which available-chunk list a chunk is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AvailableList {
    System,
    User,
}

const DECOMMIT_WORDS: usize = ARENAS_PER_CHUNK / 64;

/// Chunk metadata plus its memory.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub(crate) memory: Arc<ChunkMemory>,
    slots: Box<[ArenaSlot]>,
    /// Committed free arenas, most recently freed on top.
    free_arenas: Vec<u16>,
    decommitted: [u64; DECOMMIT_WORDS],
    num_arenas_free: usize,
    num_arenas_free_committed: usize,
    last_decommitted_offset: usize,
    pub(crate) age: u32,
    pub(crate) available: Option<AvailableList>,
}

impl Chunk {
    pub(crate) fn new(memory: ChunkMemory) -> Self {
        let slots = (0..ARENAS_PER_CHUNK).map(|_| ArenaSlot::Free).collect();
        Self {
            memory: Arc::new(memory),
            slots,
            free_arenas: (0..ARENAS_PER_CHUNK as u16).rev().collect(),
            decommitted: [0; DECOMMIT_WORDS],
            num_arenas_free: ARENAS_PER_CHUNK,
            num_arenas_free_committed: ARENAS_PER_CHUNK,
            last_decommitted_offset: 0,
            age: 0,
            available: None,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> ChunkId {
        self.memory.id()
    }

    #[inline]
    pub(crate) fn num_arenas_free(&self) -> usize {
        self.num_arenas_free
    }

    #[inline]
    pub(crate) fn num_arenas_free_committed(&self) -> usize {
        self.num_arenas_free_committed
    }

    #[inline]
    pub(crate) fn has_available_arenas(&self) -> bool {
        self.num_arenas_free > 0
    }

    #[inline]
    pub(crate) fn unused(&self) -> bool {
        self.num_arenas_free == ARENAS_PER_CHUNK
    }

    #[inline]
    pub(crate) fn arena_id(&self, index: usize) -> ArenaId {
        ArenaId::containing(self.memory.base() + index * ARENA_SIZE)
    }

    // =========================================================================
    // Slots
    // =========================================================================

    pub(crate) fn slot(&self, index: usize) -> &ArenaSlot {
        &self.slots[index]
    }

    pub(crate) fn header(&self, index: usize) -> Option<&ArenaHeader> {
        match &self.slots[index] {
            ArenaSlot::Allocated(header) => Some(&**header),
            _ => None,
        }
    }

    pub(crate) fn header_mut(&mut self, index: usize) -> Option<&mut ArenaHeader> {
        match &mut self.slots[index] {
            ArenaSlot::Allocated(header) => Some(&mut **header),
            _ => None,
        }
    }

    /// Iterate over allocated headers.
    pub(crate) fn headers_mut(&mut self) -> impl Iterator<Item = &mut ArenaHeader> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            ArenaSlot::Allocated(header) => Some(&mut **header),
            _ => None,
        })
    }

    pub(crate) fn install_header(&mut self, index: usize, header: Box<ArenaHeader>) {
        debug_assert!(matches!(
            self.slots[index],
            ArenaSlot::Free | ArenaSlot::Sweeping { .. }
        ));
        self.slots[index] = ArenaSlot::Allocated(header);
    }

    /// Lend a header to the helper thread.
    pub(crate) fn lend_header(&mut self, index: usize) -> Box<ArenaHeader> {
        let (kind, compartment) = match &self.slots[index] {
            ArenaSlot::Allocated(header) => (header.kind, header.compartment),
            other => panic!("lending arena {index} in state {other:?}"),
        };
        match std::mem::replace(&mut self.slots[index], ArenaSlot::Sweeping { kind, compartment }) {
            ArenaSlot::Allocated(header) => header,
            _ => unreachable!(),
        }
    }

    // =========================================================================
    // Free arenas
    // =========================================================================

    /// Pop a committed free arena.
    pub(crate) fn fetch_next_free_arena(&mut self) -> usize {
        let index = self
            .free_arenas
            .pop()
            .map(usize::from)
            .unwrap_or_else(|| panic!("chunk {:?} has no committed free arena", self.id()));
        debug_assert!(matches!(self.slots[index], ArenaSlot::Free));
        debug_assert!(self.num_arenas_free_committed > 0);
        self.num_arenas_free_committed -= 1;
        self.num_arenas_free -= 1;
        index
    }

    fn find_decommitted_arena_offset(&self) -> Option<usize> {
        let start = self.last_decommitted_offset;
        (start..ARENAS_PER_CHUNK)
            .chain(0..start)
            .find(|&i| self.is_decommitted(i))
    }

    /// Recommit and take a decommitted arena. `None` if the pages could not
    /// be recommitted; the arena then stays decommitted.
    pub(crate) fn fetch_next_decommitted_arena(&mut self) -> Option<usize> {
        let index = self
            .find_decommitted_arena_offset()
            .unwrap_or_else(|| panic!("chunk {:?} has no decommitted arena", self.id()));
        if !self.memory.commit_arena(index) {
            tracing::warn!(chunk = ?self.id(), index, "recommitting arena failed");
            return None;
        }
        self.set_decommitted(index, false);
        self.num_arenas_free -= 1;
        self.last_decommitted_offset = index + 1;
        Some(index)
    }

    /// Return an arena to the committed free list.
    pub(crate) fn add_arena_to_free_list(&mut self, index: usize) {
        self.slots[index] = ArenaSlot::Free;
        self.free_arenas.push(index as u16);
        self.num_arenas_free += 1;
        self.num_arenas_free_committed += 1;
    }

    /// Take a committed free arena for decommit; it counts as in use until
    /// [`finish_decommit`](Self::finish_decommit).
    pub(crate) fn begin_decommit(&mut self) -> usize {
        let index = self.fetch_next_free_arena();
        self.slots[index] = ArenaSlot::Decommitting;
        index
    }

    /// Record the result of a decommit started with
    /// [`begin_decommit`](Self::begin_decommit).
    pub(crate) fn finish_decommit(&mut self, index: usize, ok: bool) {
        debug_assert!(matches!(self.slots[index], ArenaSlot::Decommitting));
        if ok {
            self.slots[index] = ArenaSlot::Free;
            self.set_decommitted(index, true);
            self.num_arenas_free += 1;
        } else {
            self.add_arena_to_free_list(index);
        }
    }

    // =========================================================================
    // Decommit bitmap
    // =========================================================================

    #[inline]
    pub(crate) fn is_decommitted(&self, index: usize) -> bool {
        self.decommitted[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_decommitted(&mut self, index: usize, value: bool) {
        let bit = 1u64 << (index % 64);
        if value {
            self.decommitted[index / 64] |= bit;
        } else {
            self.decommitted[index / 64] &= !bit;
        }
    }

    pub(crate) fn count_decommitted(&self) -> usize {
        self.decommitted.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Free arenas plus arenas in use must cover the chunk.
    pub(crate) fn check_accounting(&self) -> bool {
        let in_use = self
            .slots
            .iter()
            .filter(|slot| !matches!(slot, ArenaSlot::Free))
            .count();
        self.num_arenas_free + in_use == ARENAS_PER_CHUNK
            && self.num_arenas_free_committed == self.free_arenas.len()
            && self.num_arenas_free_committed + self.count_decommitted() == self.num_arenas_free
    }
}
