//! Heap memory management.
//!
//! Memory comes from the OS in `CHUNK_SIZE`-aligned chunks. Each chunk is
//! split into `ARENAS_PER_CHUNK` arenas, and each allocated arena holds
//! things of a single [`AllocKind`] belonging to a single compartment.
//!
//! Chunk and arena metadata live outside the chunk memory, so the whole
//! chunk is usable for things and a thing's address alone identifies its
//! chunk ([`ChunkId`]) and arena ([`ArenaId`]).
//!
//! Allocation walks free list → arena list → chunk → chunk pool → OS.

pub(crate) mod arena;
pub(crate) mod arena_lists;
pub(crate) mod chunk;
pub(crate) mod chunk_pool;
pub mod platform;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rustc_hash::FxHashMap;

use crate::compartment::CompartmentId;
use crate::kind::AllocKind;
use crate::stats::GcStats;
use crate::trigger::HeapTrigger;

use arena::ArenaHeader;
use chunk::{AvailableList, Chunk, ChunkMemory};
use chunk_pool::ChunkPool;
use platform::PageAllocator;

// =============================================================================
// Geometry
// =============================================================================

/// log2 of [`CHUNK_SIZE`].
pub const CHUNK_SHIFT: usize = 20;
/// Size and alignment of an OS allocation.
pub const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
/// Offset bits within a chunk.
pub const CHUNK_MASK: usize = CHUNK_SIZE - 1;

/// log2 of [`ARENA_SIZE`].
pub const ARENA_SHIFT: usize = 12;
/// Size and alignment of an arena.
pub const ARENA_SIZE: usize = 1 << ARENA_SHIFT;
/// Offset bits within an arena.
pub const ARENA_MASK: usize = ARENA_SIZE - 1;

/// Arenas in one chunk.
pub const ARENAS_PER_CHUNK: usize = CHUNK_SIZE / ARENA_SIZE;

/// Allocation granularity. Every thing size is a multiple of this.
pub const CELL_SIZE: usize = 8;

/// Chunk identity: its base address shifted down by [`CHUNK_SHIFT`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ChunkId(usize);

impl ChunkId {
    #[inline]
    pub(crate) const fn containing(addr: usize) -> Self {
        Self(addr >> CHUNK_SHIFT)
    }

    #[inline]
    pub(crate) const fn base(self) -> usize {
        self.0 << CHUNK_SHIFT
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({:#x})", self.base())
    }
}

/// Arena identity: its base address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ArenaId(usize);

impl ArenaId {
    #[inline]
    pub(crate) const fn containing(addr: usize) -> Self {
        Self(addr & !ARENA_MASK)
    }

    #[inline]
    pub(crate) const fn addr(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) const fn chunk(self) -> ChunkId {
        ChunkId::containing(self.0)
    }

    /// Index of the arena within its chunk.
    #[inline]
    pub(crate) const fn index(self) -> usize {
        (self.0 & CHUNK_MASK) >> ARENA_SHIFT
    }
}

impl fmt::Debug for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arena({:#x})", self.0)
    }
}

// =============================================================================
// GcHeap
// =============================================================================

/// Chunk-level allocator state. Protected by the GC lock.
pub(crate) struct GcHeap {
    pages: Arc<dyn PageAllocator>,
    /// Every chunk with at least one allocated arena, plus chunks on the
    /// available lists.
    chunks: FxHashMap<ChunkId, Chunk>,
    pub(crate) pool: ChunkPool,
    /// Chunks with free arenas, for system and user compartments.
    system_available: VecDeque<ChunkId>,
    user_available: VecDeque<ChunkId>,
    /// Runtime-wide byte accounting.
    pub(crate) trigger: HeapTrigger,
    /// Set when a chunk moves from the pool into use; cleared by each GC.
    pub(crate) chunk_allocation_since_last_gc: bool,
    stats: Arc<GcStats>,
}

impl GcHeap {
    pub(crate) fn new(pages: Arc<dyn PageAllocator>, trigger: HeapTrigger, stats: Arc<GcStats>) -> Self {
        Self {
            pages,
            chunks: FxHashMap::default(),
            pool: ChunkPool::new(),
            system_available: VecDeque::new(),
            user_available: VecDeque::new(),
            trigger,
            chunk_allocation_since_last_gc: false,
            stats,
        }
    }

    pub(crate) fn pages(&self) -> &Arc<dyn PageAllocator> {
        &self.pages
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Chunks in use, excluding the pool.
    #[inline]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub(crate) fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    #[inline]
    pub(crate) fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(&id)
    }

    #[inline]
    pub(crate) fn header(&self, arena: ArenaId) -> Option<&ArenaHeader> {
        self.chunks.get(&arena.chunk())?.header(arena.index())
    }

    #[inline]
    pub(crate) fn header_mut(&mut self, arena: ArenaId) -> Option<&mut ArenaHeader> {
        self.chunks.get_mut(&arena.chunk())?.header_mut(arena.index())
    }

    #[inline]
    pub(crate) fn memory(&self, id: ChunkId) -> Option<&Arc<ChunkMemory>> {
        self.chunks.get(&id).map(|chunk| &chunk.memory)
    }

    /// Committed free arenas in use chunks and in the pool.
    pub(crate) fn num_arenas_free_committed(&self) -> usize {
        self.chunks
            .values()
            .map(Chunk::num_arenas_free_committed)
            .sum::<usize>()
            + self.pool.committed_arenas()
    }

    pub(crate) fn clear_marks(&mut self) {
        for chunk in self.chunks.values_mut() {
            for header in chunk.headers_mut() {
                header.clear_marks();
            }
        }
    }

    // =========================================================================
    // Available lists
    // =========================================================================

    fn available_list_mut(&mut self, list: AvailableList) -> &mut VecDeque<ChunkId> {
        match list {
            AvailableList::System => &mut self.system_available,
            AvailableList::User => &mut self.user_available,
        }
    }

    pub(crate) fn available_list(&self, list: AvailableList) -> &VecDeque<ChunkId> {
        match list {
            AvailableList::System => &self.system_available,
            AvailableList::User => &self.user_available,
        }
    }

    /// Put `id` on `list`, at `position` or at the head.
    pub(crate) fn add_to_available(&mut self, id: ChunkId, list: AvailableList, position: Option<usize>) {
        let Some(chunk) = self.chunks.get_mut(&id) else {
            return;
        };
        debug_assert!(chunk.available.is_none());
        debug_assert!(chunk.has_available_arenas());
        chunk.available = Some(list);
        let available = self.available_list_mut(list);
        match position {
            Some(at) if at <= available.len() => available.insert(at, id),
            _ => available.push_front(id),
        }
    }

    /// Take `id` off its available list. Returns the position it had.
    pub(crate) fn remove_from_available(&mut self, id: ChunkId) -> Option<usize> {
        let list = self.chunks.get_mut(&id)?.available.take()?;
        let available = self.available_list_mut(list);
        let position = available.iter().position(|&c| c == id)?;
        available.remove(position);
        Some(position)
    }

    // =========================================================================
    // Arena allocation
    // =========================================================================

    /// Chunk at the head of the available list, taking one from the pool
    /// or the OS if the list is empty.
    ///
    /// The flag is set when the pool should be refilled in the background.
    pub(crate) fn pick_chunk(&mut self, is_system: bool, can_background_allocate: bool) -> Option<(ChunkId, bool)> {
        let list = if is_system {
            AvailableList::System
        } else {
            AvailableList::User
        };
        if let Some(&id) = self.available_list(list).front() {
            return Some((id, false));
        }

        let chunk = match self.pool.take() {
            Some(chunk) => chunk,
            None => {
                let memory = ChunkMemory::map(Arc::clone(&self.pages))?;
                self.stats.chunks_created.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(chunk = ?memory.id(), "mapped chunk");
                Chunk::new(memory)
            }
        };
        let want_background = self.want_background_allocation(can_background_allocate);

        self.chunk_allocation_since_last_gc = true;
        let id = chunk.id();
        debug_assert!(!self.chunks.contains_key(&id));
        self.chunks.insert(id, chunk);
        self.add_to_available(id, list, None);
        Some((id, want_background))
    }

    /// Whether the helper thread should refill the pool.
    pub(crate) fn want_background_allocation(&self, can_background_allocate: bool) -> bool {
        can_background_allocate
            && self.pool.is_empty()
            && self.chunks.len() >= BACKGROUND_ALLOCATION_MIN_CHUNKS
    }

    /// Carve an arena out of `id` for `(compartment, kind)`.
    pub(crate) fn allocate_arena(
        &mut self,
        id: ChunkId,
        compartment: CompartmentId,
        kind: AllocKind,
    ) -> Option<ArenaId> {
        let chunk = self.chunks.get_mut(&id)?;
        debug_assert!(chunk.has_available_arenas());
        let index = if chunk.num_arenas_free_committed() > 0 {
            Some(chunk.fetch_next_free_arena())
        } else {
            chunk.fetch_next_decommitted_arena()
        }?;
        let arena = chunk.arena_id(index);
        chunk.install_header(index, Box::new(ArenaHeader::new(arena, compartment, kind)));
        let exhausted = !chunk.has_available_arenas();
        if exhausted {
            self.remove_from_available(id);
        }
        self.trigger.gc_bytes += ARENA_SIZE;
        self.stats.arenas_allocated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(?arena, ?compartment, ?kind, "allocated arena");
        Some(arena)
    }

    /// Return an arena to its chunk. A chunk left without any allocated
    /// arena moves to the pool.
    pub(crate) fn release_arena(&mut self, arena: ArenaId, list: AvailableList) {
        let id = arena.chunk();
        let Some(chunk) = self.chunks.get_mut(&id) else {
            panic!("releasing {arena:?} from an unknown chunk");
        };
        chunk.add_arena_to_free_list(arena.index());
        debug_assert!(self.trigger.gc_bytes >= ARENA_SIZE);
        self.trigger.gc_bytes -= ARENA_SIZE;
        self.stats.arenas_released.fetch_add(1, Ordering::Relaxed);

        if chunk.num_arenas_free() == 1 {
            self.add_to_available(id, list, None);
        } else if chunk.unused() {
            self.remove_from_available(id);
            if let Some(chunk) = self.chunks.remove(&id) {
                tracing::trace!(chunk = ?id, "chunk returned to pool");
                self.pool.put(chunk);
            }
        }
    }

    // =========================================================================
    // Pool maintenance
    // =========================================================================

    /// Age the pool; return chunks to unmap once the lock is dropped.
    pub(crate) fn expire_pool(&mut self, max_age: u32, release_all: bool) -> Vec<Chunk> {
        let expired = self.pool.expire(max_age, release_all);
        if !expired.is_empty() {
            self.stats
                .chunks_destroyed
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::trace!(count = expired.len(), release_all, "expired pooled chunks");
        }
        expired
    }

    /// Accept a chunk mapped by the helper thread.
    pub(crate) fn put_background_chunk(&mut self, memory: ChunkMemory) {
        self.stats.chunks_created.fetch_add(1, Ordering::Relaxed);
        self.stats
            .background_chunks_allocated
            .fetch_add(1, Ordering::Relaxed);
        self.pool.put(Chunk::new(memory));
    }

    /// Drop every chunk, pooled or in use. Returns them for unmapping.
    pub(crate) fn take_all_chunks(&mut self) -> Vec<Chunk> {
        self.system_available.clear();
        self.user_available.clear();
        let mut all: Vec<Chunk> = self.chunks.drain().map(|(_, chunk)| chunk).collect();
        all.extend(self.pool.drain());
        self.stats
            .chunks_destroyed
            .fetch_add(all.len() as u64, Ordering::Relaxed);
        all
    }

    /// Per-chunk accounting holds for every chunk.
    pub(crate) fn check_accounting(&self) -> bool {
        self.chunks.values().all(Chunk::check_accounting)
            && self
                .chunks
                .values()
                .all(|chunk| chunk.available.is_some() == chunk.has_available_arenas())
    }
}

/// Background allocation only pays off once the heap spans a few chunks.
const BACKGROUND_ALLOCATION_MIN_CHUNKS: usize = 4;

impl fmt::Debug for GcHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeap")
            .field("chunks", &self.chunks.len())
            .field("pooled", &self.pool.len())
            .field("gc_bytes", &self.trigger.gc_bytes)
            .field("gc_trigger_bytes", &self.trigger.gc_trigger_bytes)
            .finish()
    }
}
