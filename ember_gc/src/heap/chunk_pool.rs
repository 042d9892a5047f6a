//! Cache of fully empty chunks.
//!
//! Empty chunks are kept mapped for a few collections so that allocation
//! bursts after a GC do not go back to the OS. Each expiry pass ages every
//! cached chunk by one; chunks reaching the maximum age are handed back to
//! the caller to unmap outside the lock.

use std::collections::VecDeque;

use crate::heap::chunk::Chunk;

/// Pool of empty chunks, most recently returned at the front.
#[derive(Debug, Default)]
pub(crate) struct ChunkPool {
    empty: VecDeque<Chunk>,
}

impl ChunkPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of cached chunks.
    pub(crate) fn len(&self) -> usize {
        self.empty.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.empty.is_empty()
    }

    /// Take the most recently cached chunk.
    pub(crate) fn take(&mut self) -> Option<Chunk> {
        let chunk = self.empty.pop_front()?;
        debug_assert!(chunk.unused());
        Some(chunk)
    }

    /// Cache an empty chunk with age zero.
    pub(crate) fn put(&mut self, mut chunk: Chunk) {
        debug_assert!(chunk.unused());
        debug_assert!(chunk.available.is_none());
        chunk.age = 0;
        self.empty.push_front(chunk);
    }

    /// Age every chunk and remove those at `max_age`, or all of them when
    /// `release_all` is set. Order of the survivors is preserved so older
    /// chunks drift to the back.
    pub(crate) fn expire(&mut self, max_age: u32, release_all: bool) -> Vec<Chunk> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.empty.len());
        for mut chunk in self.empty.drain(..) {
            debug_assert!(chunk.age <= max_age);
            if release_all || chunk.age >= max_age {
                expired.push(chunk);
            } else {
                chunk.age += 1;
                kept.push_back(chunk);
            }
        }
        self.empty = kept;
        expired
    }

    /// Remove every cached chunk regardless of age.
    pub(crate) fn drain(&mut self) -> Vec<Chunk> {
        self.empty.drain(..).collect()
    }

    /// Arenas in cached chunks that are already decommitted.
    pub(crate) fn count_clean_decommitted_arenas(&self) -> usize {
        self.empty.iter().map(Chunk::count_decommitted).sum()
    }

    /// Committed free arenas held by cached chunks.
    pub(crate) fn committed_arenas(&self) -> usize {
        self.empty.iter().map(Chunk::num_arenas_free_committed).sum()
    }
}
