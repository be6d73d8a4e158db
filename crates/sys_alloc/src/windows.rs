use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::Protection;

/// Number of probe-and-retry rounds used to land an over-aligned reservation.
const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

const fn protect_flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::ReadWrite => PAGE_READWRITE,
    }
}

unsafe fn reserve_at(addr: usize, len: usize) -> *mut std::ffi::c_void {
    let addr = if addr == 0 {
        ptr::null()
    } else {
        addr as *const std::ffi::c_void
    };
    unsafe { VirtualAlloc(addr, len, MEM_RESERVE, PAGE_NOACCESS) }
}

pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of inaccessible address space aligned to `alignment`.
    pub unsafe fn reserve(
        hint_addr: usize,
        len: usize,
        alignment: usize,
    ) -> io::Result<ReservationInner> {
        let mut ptr = unsafe { reserve_at(hint_addr, len) };
        if ptr.is_null() && hint_addr != 0 {
            ptr = unsafe { reserve_at(0, len) };
        }
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        if ptr as usize % alignment == 0 {
            return Ok(ReservationInner { ptr, len });
        }
        unsafe { VirtualFree(ptr, 0, MEM_RELEASE) };

        // Windows cannot release part of a reservation: probe a padded range,
        // release it, and try to grab the aligned window inside it.
        for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
            let probe = unsafe { reserve_at(0, len + alignment) };
            if probe.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = (probe as usize).next_multiple_of(alignment);
            unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

            let ptr = unsafe { reserve_at(aligned, len) };
            if !ptr.is_null() {
                return Ok(ReservationInner { ptr, len });
            }
        }
        Err(Error::new(
            io::ErrorKind::OutOfMemory,
            "could not reserve an aligned range",
        ))
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        let ret = unsafe { VirtualAlloc(addr, len, MEM_COMMIT, PAGE_READWRITE) };
        if ret.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        if unsafe { VirtualFree(addr, len, MEM_DECOMMIT) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        if unsafe { VirtualProtect(addr, len, protect_flags(protection), &mut old) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
