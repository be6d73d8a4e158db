//! The caged heap.
//!
//! With the `caged-heap` feature every page is carved out of one 4 GiB
//! reservation aligned to its own size. Any managed address then shares its
//! upper 32 bits with the cage base, which is what makes 32-bit compressed
//! references possible. The lower half of the cage holds normal page
//! regions, the upper half large pages.
//!
//! The base of the cage used by the current thread is published in a
//! thread-local, so at most one cage is active per thread.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::PAGE_SIZE;
use crate::platform::PageAllocator;

/// Size and alignment of the cage.
#[cfg(target_pointer_width = "64")]
pub const CAGE_SIZE: usize = 1 << 32;

/// Size and alignment of the cage.
#[cfg(not(target_pointer_width = "64"))]
pub const CAGE_SIZE: usize = 1 << 30;

const RESERVATION_ATTEMPTS: usize = 4;

thread_local! {
    static CAGE_BASE: Cell<usize> = const { Cell::new(0) };
}

/// Base of the cage published on the current thread, or zero.
#[inline]
pub fn current_cage_base() -> usize {
    CAGE_BASE.with(Cell::get)
}

/// Publishes `base` as the current thread's cage base. Zero unpublishes.
///
/// Only one cage may be active per thread; publishing a different base while
/// one is active is a bug.
pub fn set_current_cage_base(base: usize) {
    CAGE_BASE.with(|cell| {
        debug_assert!(
            base == 0 || cell.get() == 0 || cell.get() == base,
            "a different cage is already active on this thread"
        );
        cell.set(base);
    });
}

/// First-fit allocator over one half of the cage.
#[derive(Debug)]
struct RegionAllocator {
    // start -> len of free ranges, coalesced.
    free: BTreeMap<usize, usize>,
}

impl RegionAllocator {
    fn new(start: usize, len: usize) -> Self {
        let mut free = BTreeMap::new();
        free.insert(start, len);
        Self { free }
    }

    fn allocate(&mut self, len: usize) -> Option<usize> {
        let (&start, &available) = self.free.iter().find(|(_, available)| **available >= len)?;
        self.free.remove(&start);
        if available > len {
            self.free.insert(start + len, available - len);
        }
        Some(start)
    }

    fn free(&mut self, mut start: usize, mut len: usize) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

/// One aligned reservation holding every page of the process.
pub struct CagedHeap {
    base: NonNull<u8>,
    allocator: Arc<dyn PageAllocator>,
    normal: Mutex<RegionAllocator>,
    large: Mutex<RegionAllocator>,
}

// The cage only hands out address ranges; access to them is synchronized by
// the page backend.
unsafe impl Send for CagedHeap {}
unsafe impl Sync for CagedHeap {}

impl CagedHeap {
    /// Reserves the cage, retrying a few randomized hints before letting the
    /// OS pick. Failing every attempt aborts the process.
    pub(crate) fn reserve(allocator: Arc<dyn PageAllocator>) -> Self {
        match Self::try_reserve(&allocator) {
            Ok(base) => {
                crate::tracing::internal::log_cage_reserved(base.as_ptr() as usize, CAGE_SIZE);
                Self::from_base(base, allocator)
            }
            Err(_) => super::oom("caged heap reservation", CAGE_SIZE),
        }
    }

    fn try_reserve(allocator: &Arc<dyn PageAllocator>) -> io::Result<NonNull<u8>> {
        let mut last_error = None;
        for attempt in 0..RESERVATION_ATTEMPTS {
            let hint = if attempt + 1 == RESERVATION_ATTEMPTS {
                0
            } else {
                allocator.random_mmap_addr() & !(CAGE_SIZE - 1)
            };
            match allocator.reserve(hint, CAGE_SIZE, CAGE_SIZE) {
                Ok(base) => return Ok(base),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory)))
    }

    fn from_base(base: NonNull<u8>, allocator: Arc<dyn PageAllocator>) -> Self {
        let start = base.as_ptr() as usize;
        let half = CAGE_SIZE / 2;
        Self {
            base,
            allocator,
            normal: Mutex::new(RegionAllocator::new(start, half)),
            large: Mutex::new(RegionAllocator::new(start + half, half)),
        }
    }

    /// Base address of the cage.
    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Allocator that reserved the cage; commits inside it go through it too.
    pub(crate) fn page_allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    /// Returns `true` if `address` lies inside the cage.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address.wrapping_sub(self.base()) < CAGE_SIZE
    }

    /// Returns `true` if `address` lies in the large-page half of the cage.
    #[inline]
    pub fn is_in_large_area(&self, address: usize) -> bool {
        self.contains(address) && address - self.base() >= CAGE_SIZE / 2
    }

    pub(crate) fn allocate_region(&self, len: usize, large: bool) -> io::Result<NonNull<u8>> {
        let len = len.next_multiple_of(PAGE_SIZE);
        let area = if large { &self.large } else { &self.normal };
        let start = area.lock().allocate(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "caged heap exhausted")
        })?;
        NonNull::new(start as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "null cage region"))
    }

    pub(crate) fn free_region(&self, base: NonNull<u8>, len: usize, large: bool) {
        let len = len.next_multiple_of(PAGE_SIZE);
        let area = if large { &self.large } else { &self.normal };
        area.lock().free(base.as_ptr() as usize, len);
    }
}

impl Drop for CagedHeap {
    fn drop(&mut self) {
        let _ = self.allocator.release(self.base, CAGE_SIZE);
    }
}

impl std::fmt::Debug for CagedHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CagedHeap")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}
