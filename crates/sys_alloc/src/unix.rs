use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Protection;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

const fn prot_flags(protection: Protection) -> libc::c_int {
    match protection {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

unsafe fn map_none(addr: *mut libc::c_void, len: usize, fixed: bool) -> *mut libc::c_void {
    let fixed = if fixed { libc::MAP_FIXED } else { 0 };
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE | fixed;
    unsafe { libc::mmap(addr, len, libc::PROT_NONE, flags, -1, 0) }
}

pub struct ReservationInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of inaccessible address space aligned to `alignment`.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`/`munmap`.
    pub unsafe fn reserve(
        hint_addr: usize,
        len: usize,
        alignment: usize,
    ) -> io::Result<ReservationInner> {
        let hint = if hint_addr == 0 {
            ptr::null_mut()
        } else {
            hint_addr as *mut libc::c_void
        };

        // Try the exact size first; a hint honoured by the kernel is usually aligned.
        let ptr = unsafe { map_none(hint, len, false) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        if ptr as usize % alignment == 0 {
            return Ok(ReservationInner { ptr, len });
        }
        unsafe { libc::munmap(ptr, len) };

        // Over-reserve and trim both ends down to the aligned window.
        let padded = len + alignment - page_size();
        let base = unsafe { map_none(hint, padded, false) };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        let base_addr = base as usize;
        let aligned = base_addr.next_multiple_of(alignment);
        let head = aligned - base_addr;
        let tail = padded - head - len;
        unsafe {
            if head > 0 {
                libc::munmap(base, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(ReservationInner {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        unsafe { self.protect(offset, len, Protection::ReadWrite) }
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        // Remapping replaces the pages with fresh zero pages on every Unix,
        // unlike MADV_DONTNEED whose zeroing is Linux specific.
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<libc::c_void>();
        let ptr = unsafe { map_none(addr, len, true) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<libc::c_void>();
        let ret = unsafe { libc::mprotect(addr, len, prot_flags(protection)) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
