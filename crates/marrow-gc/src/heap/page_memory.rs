//! Page memory regions and the page backend.
//!
//! Normal pages are reserved [`PAGES_PER_REGION`] at a time; a large page
//! gets a region of its own. Every region is indexed by its base address in
//! a tree so that arbitrary addresses, e.g. from a conservative stack scan,
//! can be resolved to the page containing them. Normal pages returned by the
//! heap are decommitted and pooled, which guarantees that a recycled page
//! reads as zero.

use std::collections::BTreeMap;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::cage::CagedHeap;
use crate::heap::page::BasePage;
use crate::heap::{GUARD_PAGE_SIZE, PAGES_PER_REGION, PAGE_SIZE};
use crate::platform::PageAllocator;

#[derive(Debug)]
enum Region {
    Normal { in_use: [bool; PAGES_PER_REGION] },
    Large { len: usize },
}

impl Region {
    const fn len(&self) -> usize {
        match self {
            Self::Normal { .. } => PAGES_PER_REGION * PAGE_SIZE,
            Self::Large { len } => *len,
        }
    }
}

#[derive(Debug, Default)]
struct BackendInner {
    regions: BTreeMap<usize, Region>,
    // Decommitted normal pages ready for reuse.
    pool: Vec<usize>,
}

/// Hands out page memory and resolves addresses to pages.
///
/// All bookkeeping sits behind one mutex so pages can be looked up from any
/// thread.
pub(crate) struct PageBackend {
    allocator: Arc<dyn PageAllocator>,
    cage: Option<Arc<CagedHeap>>,
    inner: Mutex<BackendInner>,
    lowest: AtomicUsize,
    highest: AtomicUsize,
    guard_pages: bool,
    committed: AtomicUsize,
}

impl PageBackend {
    pub(crate) fn new(allocator: Arc<dyn PageAllocator>, cage: Option<Arc<CagedHeap>>) -> Self {
        let commit_page = allocator.commit_page_size();
        // Guards can only be left inaccessible if commits can stop at them.
        let guard_pages = commit_page <= GUARD_PAGE_SIZE && GUARD_PAGE_SIZE % commit_page == 0;
        Self {
            allocator,
            cage,
            inner: Mutex::new(BackendInner::default()),
            lowest: AtomicUsize::new(usize::MAX),
            highest: AtomicUsize::new(0),
            guard_pages,
            committed: AtomicUsize::new(0),
        }
    }

    /// Bytes of page memory currently committed.
    pub(crate) fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    fn reserve_region(&self, len: usize, large: bool) -> io::Result<NonNull<u8>> {
        let base = match &self.cage {
            Some(cage) => cage.allocate_region(len, large)?,
            None => self.allocator.reserve(0, len, PAGE_SIZE)?,
        };
        let start = base.as_ptr() as usize;
        self.lowest.fetch_min(start, Ordering::Relaxed);
        self.highest.fetch_max(start + len, Ordering::Relaxed);
        crate::tracing::internal::log_region_reserved(start, len, large);
        Ok(base)
    }

    fn release_region(&self, base: NonNull<u8>, len: usize, large: bool) -> io::Result<()> {
        match &self.cage {
            Some(cage) => {
                self.allocator.decommit(base, len)?;
                cage.free_region(base, len, large);
                Ok(())
            }
            None => self.allocator.release(base, len),
        }
    }

    /// Commits the writeable part of `[base, base + len)`.
    fn commit_writeable(&self, base: usize, len: usize) -> io::Result<()> {
        let (start, len) = self.writeable_range(base, len);
        let start = NonNull::new(start as *mut u8).ok_or_else(null_region)?;
        self.allocator.commit(start, len)?;
        self.committed.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn decommit_writeable(&self, base: usize, len: usize) -> io::Result<()> {
        let (start, len) = self.writeable_range(base, len);
        let start = NonNull::new(start as *mut u8).ok_or_else(null_region)?;
        self.allocator.decommit(start, len)?;
        self.committed.fetch_sub(len, Ordering::Relaxed);
        Ok(())
    }

    fn writeable_range(&self, base: usize, len: usize) -> (usize, usize) {
        if self.guard_pages {
            (base + GUARD_PAGE_SIZE, len - 2 * GUARD_PAGE_SIZE)
        } else {
            (base, len)
        }
    }

    /// Returns a zeroed, committed normal page. The page header goes at
    /// `base + GUARD_PAGE_SIZE`.
    pub(crate) fn allocate_normal_page_memory(&self) -> io::Result<NonNull<u8>> {
        let mut inner = self.inner.lock();
        if inner.pool.is_empty() {
            let region = self.reserve_region(PAGES_PER_REGION * PAGE_SIZE, false)?;
            let start = region.as_ptr() as usize;
            inner.regions.insert(
                start,
                Region::Normal {
                    in_use: [false; PAGES_PER_REGION],
                },
            );
            inner
                .pool
                .extend((0..PAGES_PER_REGION).rev().map(|i| start + i * PAGE_SIZE));
        }
        let Some(page) = inner.pool.pop() else {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "page pool is empty"));
        };
        self.commit_writeable(page, PAGE_SIZE)?;
        set_in_use(&mut inner.regions, page, true);
        NonNull::new(page as *mut u8).ok_or_else(null_region)
    }

    /// Decommits a normal page and returns it to the pool.
    pub(crate) fn free_normal_page_memory(&self, page: NonNull<u8>) -> io::Result<()> {
        let page = page.as_ptr() as usize;
        let mut inner = self.inner.lock();
        set_in_use(&mut inner.regions, page, false);
        self.decommit_writeable(page, PAGE_SIZE)?;
        inner.pool.push(page);
        Ok(())
    }

    /// Reserves and commits a region for a large page with
    /// `writeable_size` bytes after the leading guard page.
    pub(crate) fn allocate_large_page_memory(&self, writeable_size: usize) -> io::Result<NonNull<u8>> {
        let granularity = self.allocator.allocate_page_size().max(self.allocator.commit_page_size());
        let len = (writeable_size + 2 * GUARD_PAGE_SIZE).next_multiple_of(granularity);
        let base = self.reserve_region(len, true)?;
        let start = base.as_ptr() as usize;
        self.commit_writeable(start, len)?;
        self.inner.lock().regions.insert(start, Region::Large { len });
        Ok(base)
    }

    /// Releases the region of a large page.
    pub(crate) fn free_large_page_memory(&self, base: NonNull<u8>) -> io::Result<()> {
        let start = base.as_ptr() as usize;
        let region = self.inner.lock().regions.remove(&start);
        match region {
            Some(Region::Large { len }) => {
                let (_, writeable) = self.writeable_range(start, len);
                self.committed.fetch_sub(writeable, Ordering::Relaxed);
                self.release_region(base, len, true)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a large page region",
            )),
        }
    }

    /// Returns the memory behind the commit pages fully inside
    /// `[start, start + len)` to the OS. The range reads as zero afterwards.
    pub(crate) fn discard(&self, start: usize, len: usize) -> io::Result<usize> {
        let commit_page = self.allocator.commit_page_size();
        let begin = start.next_multiple_of(commit_page);
        let end = (start + len) & !(commit_page - 1);
        if end <= begin {
            return Ok(0);
        }
        let address = NonNull::new(begin as *mut u8).ok_or_else(null_region)?;
        self.allocator.decommit(address, end - begin)?;
        self.allocator.commit(address, end - begin)?;
        Ok(end - begin)
    }

    /// Resolves `address` to the page whose writeable area contains it.
    pub(crate) fn lookup(&self, address: usize) -> Option<NonNull<BasePage>> {
        if address < self.lowest.load(Ordering::Relaxed)
            || address >= self.highest.load(Ordering::Relaxed)
        {
            return None;
        }
        if self.cage.as_ref().is_some_and(|cage| !cage.contains(address)) {
            return None;
        }
        let inner = self.inner.lock();
        let (&start, region) = inner.regions.range(..=address).next_back()?;
        if address >= start + region.len() {
            return None;
        }
        let page = match region {
            Region::Normal { in_use } => {
                let index = (address - start) / PAGE_SIZE;
                if !in_use[index] {
                    return None;
                }
                start + index * PAGE_SIZE
            }
            Region::Large { .. } => {
                debug_assert!(self
                    .cage
                    .as_ref()
                    .is_none_or(|cage| cage.is_in_large_area(start)));
                start
            }
        };
        let len = match region {
            Region::Normal { .. } => PAGE_SIZE,
            Region::Large { len } => *len,
        };
        if address < page + GUARD_PAGE_SIZE || address >= page + len - GUARD_PAGE_SIZE {
            return None;
        }
        NonNull::new((page + GUARD_PAGE_SIZE) as *mut BasePage)
    }

    /// Number of normal pages waiting in the pool.
    pub(crate) fn pooled_pages(&self) -> usize {
        self.inner.lock().pool.len()
    }
}

fn set_in_use(regions: &mut BTreeMap<usize, Region>, page: usize, used: bool) {
    if let Some((start, Region::Normal { in_use })) = regions.range_mut(..=page).next_back() {
        in_use[(page - *start) / PAGE_SIZE] = used;
    } else {
        debug_assert!(false, "page {page:#x} has no region");
    }
}

fn null_region() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "null page address")
}

impl Drop for PageBackend {
    fn drop(&mut self) {
        let inner = std::mem::take(&mut *self.inner.lock());
        for (start, region) in inner.regions {
            let large = matches!(region, Region::Large { .. });
            if let Some(base) = NonNull::new(start as *mut u8) {
                let _ = self.release_region(base, region.len(), large);
            }
        }
    }
}

impl std::fmt::Debug for PageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBackend")
            .field("guard_pages", &self.guard_pages)
            .field("committed", &self.committed_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::DefaultPageAllocator;

    fn backend() -> PageBackend {
        PageBackend::new(Arc::new(DefaultPageAllocator::new()), None)
    }

    #[test]
    fn test_normal_pages_are_aligned_and_writable() {
        let backend = backend();
        let page = backend.allocate_normal_page_memory().unwrap();
        let base = page.as_ptr() as usize;
        assert_eq!(base % PAGE_SIZE, 0);
        let first = (base + GUARD_PAGE_SIZE) as *mut u8;
        unsafe {
            assert_eq!(first.read(), 0);
            first.write(1);
        }
        assert!(backend.committed_bytes() > 0);
    }

    #[test]
    fn test_pooled_pages_come_back_zeroed() {
        let backend = backend();
        let page = backend.allocate_normal_page_memory().unwrap();
        let probe = (page.as_ptr() as usize + GUARD_PAGE_SIZE + 64) as *mut u64;
        unsafe { probe.write(0xdead_beef) };
        backend.free_normal_page_memory(page).unwrap();

        // The pool is LIFO, so the same page is handed out again.
        let again = backend.allocate_normal_page_memory().unwrap();
        assert_eq!(again, page);
        unsafe { assert_eq!(probe.read(), 0) };
    }

    #[test]
    fn test_lookup_resolves_pages() {
        let backend = backend();
        let page = backend.allocate_normal_page_memory().unwrap();
        let base = page.as_ptr() as usize;
        let header = backend.lookup(base + GUARD_PAGE_SIZE + 100).unwrap();
        assert_eq!(header.as_ptr() as usize, base + GUARD_PAGE_SIZE);
        assert!(backend.lookup(base).is_none(), "guard page is not a page");
        assert!(backend.lookup(base + PAGE_SIZE - 8).is_none());
        assert!(backend.lookup(8).is_none());

        backend.free_normal_page_memory(page).unwrap();
        assert!(backend.lookup(base + GUARD_PAGE_SIZE + 100).is_none());
    }

    #[test]
    fn test_large_pages() {
        let backend = backend();
        let writeable = 3 * PAGE_SIZE + 40;
        let base = backend.allocate_large_page_memory(writeable).unwrap();
        let start = base.as_ptr() as usize;
        assert_eq!(start % PAGE_SIZE, 0);
        let inner = start + GUARD_PAGE_SIZE + writeable - 8;
        assert!(backend.lookup(inner).is_some());
        unsafe { (inner as *mut u8).write(3) };
        backend.free_large_page_memory(base).unwrap();
        assert!(backend.lookup(inner).is_none());
    }

    #[test]
    fn test_one_region_serves_many_pages() {
        let backend = backend();
        let pages: Vec<_> = (0..PAGES_PER_REGION)
            .map(|_| backend.allocate_normal_page_memory().unwrap())
            .collect();
        assert_eq!(backend.pooled_pages(), 0);
        let first = pages[0].as_ptr() as usize;
        for page in &pages {
            let distance = (page.as_ptr() as usize).abs_diff(first);
            assert!(distance < PAGES_PER_REGION * PAGE_SIZE);
        }
    }
}
