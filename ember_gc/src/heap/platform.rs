//! Page-level memory operations.
//!
//! Chunks are mapped at `CHUNK_SIZE` alignment so that the owning chunk of
//! any cell is recovered by masking its address. Arena decommit uses
//! `madvise(MADV_DONTNEED)` / `MEM_RESET`: the address range stays mapped
//! and reads back as zero (or garbage on Windows) once recommitted.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(unix)]
use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void, madvise, mmap, munmap};

#[cfg(windows)]
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE, VirtualAlloc, VirtualFree,
};

// =============================================================================
// PageAllocator
// =============================================================================

/// Source of aligned chunk memory.
///
/// Implementations must be usable from the helper thread.
pub trait PageAllocator: Send + Sync + fmt::Debug {
    /// Map `size` bytes of zeroed read/write memory aligned to `alignment`.
    fn map_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// Unmap a region returned by [`map_aligned`](Self::map_aligned).
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe exactly one live mapping, and no
    /// references into it may outlive this call.
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize);

    /// Tell the OS the pages are unused. The range stays mapped.
    ///
    /// Returns `false` when the OS refused; the caller keeps the pages
    /// committed.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live mapping and hold no live data.
    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool;

    /// Make previously decommitted pages usable again.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live mapping.
    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> bool;
}

// =============================================================================
// SystemPages
// =============================================================================

/// [`PageAllocator`] backed by `mmap` / `VirtualAlloc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPages;

impl PageAllocator for SystemPages {
    #[cfg(unix)]
    fn map_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        // Over-map, then trim the unaligned head and the tail.
        let request = size.checked_add(alignment)?;
        unsafe {
            let raw = mmap(
                std::ptr::null_mut(),
                request,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                tracing::trace!(
                    error = %std::io::Error::last_os_error(),
                    "mmap of {} bytes failed",
                    request
                );
                return None;
            }

            let start = raw as usize;
            let aligned = (start + alignment - 1) & !(alignment - 1);
            let head = aligned - start;
            let tail = request - head - size;
            if head != 0 {
                munmap(raw, head);
            }
            if tail != 0 {
                munmap((aligned + size) as *mut c_void, tail);
            }
            NonNull::new(aligned as *mut u8)
        }
    }

    #[cfg(windows)]
    fn map_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        // Reserve an oversized region to find an aligned address, release it
        // and map exactly there. Another thread may take the hole in between,
        // so retry a few times.
        for _ in 0..8 {
            unsafe {
                let probe = VirtualAlloc(
                    std::ptr::null(),
                    size + alignment,
                    MEM_RESERVE,
                    PAGE_READWRITE,
                );
                if probe.is_null() {
                    return None;
                }
                let aligned = (probe as usize + alignment - 1) & !(alignment - 1);
                VirtualFree(probe, 0, MEM_RELEASE);

                let ptr = VirtualAlloc(
                    aligned as *const _,
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
                if !ptr.is_null() {
                    return NonNull::new(ptr as *mut u8);
                }
            }
        }
        None
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        #[cfg(unix)]
        unsafe {
            munmap(ptr.as_ptr() as *mut c_void, size);
        }

        #[cfg(windows)]
        unsafe {
            let _ = size;
            VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
        }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        #[cfg(unix)]
        let ok = unsafe { madvise(ptr.as_ptr() as *mut c_void, size, libc::MADV_DONTNEED) == 0 };

        #[cfg(windows)]
        let ok = unsafe {
            !VirtualAlloc(ptr.as_ptr() as *const _, size, MEM_RESET, PAGE_READWRITE).is_null()
        };

        ok
    }

    unsafe fn commit(&self, _ptr: NonNull<u8>, _size: usize) -> bool {
        // Both decommit flavours leave the pages mapped; touching them is
        // enough to bring them back.
        true
    }
}

// =============================================================================
// FaultInjectingPages
// =============================================================================

/// [`PageAllocator`] that fails on demand, for exercising out-of-memory and
/// decommit-failure paths.
#[derive(Debug)]
pub struct FaultInjectingPages {
    inner: SystemPages,
    remaining_maps: AtomicUsize,
    fail_decommit: AtomicBool,
    fail_commit: AtomicBool,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    decommits: AtomicUsize,
}

impl FaultInjectingPages {
    /// Allocator that allows at most `max_maps` successful chunk mappings.
    pub fn with_map_limit(max_maps: usize) -> Self {
        Self {
            inner: SystemPages,
            remaining_maps: AtomicUsize::new(max_maps),
            fail_decommit: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
            decommits: AtomicUsize::new(0),
        }
    }

    /// Allocator with no mapping limit.
    pub fn unlimited() -> Self {
        Self::with_map_limit(usize::MAX)
    }

    /// Make every subsequent decommit fail (or succeed again).
    pub fn set_fail_decommit(&self, fail: bool) {
        self.fail_decommit.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent recommit fail (or succeed again).
    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::Relaxed);
    }

    /// Allow `n` more mappings.
    pub fn set_map_limit(&self, n: usize) {
        self.remaining_maps.store(n, Ordering::Relaxed);
    }

    /// Successful mappings so far.
    pub fn maps(&self) -> usize {
        self.maps.load(Ordering::Relaxed)
    }

    /// Unmappings so far.
    pub fn unmaps(&self) -> usize {
        self.unmaps.load(Ordering::Relaxed)
    }

    /// Successful decommits so far.
    pub fn decommits(&self) -> usize {
        self.decommits.load(Ordering::Relaxed)
    }
}

impl PageAllocator for FaultInjectingPages {
    fn map_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let granted = self
            .remaining_maps
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if !granted {
            return None;
        }
        let ptr = self.inner.map_aligned(size, alignment)?;
        self.maps.fetch_add(1, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        unsafe { self.inner.unmap(ptr, size) }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        if self.fail_decommit.load(Ordering::Relaxed) {
            return false;
        }
        let ok = unsafe { self.inner.decommit(ptr, size) };
        if ok {
            self.decommits.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        if self.fail_commit.load(Ordering::Relaxed) {
            return false;
        }
        unsafe { self.inner.commit(ptr, size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ARENA_SIZE, CHUNK_SIZE};

    #[test]
    fn test_map_is_chunk_aligned_and_zeroed() {
        let pages = SystemPages;
        let ptr = pages
            .map_aligned(CHUNK_SIZE, CHUNK_SIZE)
            .expect("map chunk");
        assert_eq!(ptr.as_ptr() as usize % CHUNK_SIZE, 0);
        unsafe {
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), CHUNK_SIZE);
            assert!(bytes.iter().step_by(4096).all(|&b| b == 0));
            pages.unmap(ptr, CHUNK_SIZE);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_decommitted_arena_reads_back_zero() {
        let pages = SystemPages;
        let ptr = pages
            .map_aligned(CHUNK_SIZE, CHUNK_SIZE)
            .expect("map chunk");
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, ARENA_SIZE);
            assert!(pages.decommit(ptr, ARENA_SIZE));
            assert!(pages.commit(ptr, ARENA_SIZE));
            assert_eq!(*ptr.as_ptr(), 0);
            pages.unmap(ptr, CHUNK_SIZE);
        }
    }

    #[test]
    fn test_fault_injection_limits_maps() {
        let pages = FaultInjectingPages::with_map_limit(1);
        let first = pages.map_aligned(CHUNK_SIZE, CHUNK_SIZE);
        assert!(first.is_some());
        assert!(pages.map_aligned(CHUNK_SIZE, CHUNK_SIZE).is_none());
        assert_eq!(pages.maps(), 1);

        let first = first.expect("first map");
        pages.set_fail_decommit(true);
        unsafe {
            assert!(!pages.decommit(first, ARENA_SIZE));
            pages.unmap(first, CHUNK_SIZE);
        }
        assert_eq!(pages.unmaps(), 1);
        assert_eq!(pages.decommits(), 0);
    }
}
