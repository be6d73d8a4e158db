//! Low-level virtual memory primitives.
//!
//! This crate exposes the handful of OS operations a garbage-collected heap
//! needs: reserving address space without backing it, committing and
//! decommitting pages inside a reservation, toggling page permissions and
//! picking randomized placement hints for large reservations.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Reservation addresses and hints should be aligned to this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Access permissions for a range of reserved memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults. Used for reserved-but-unused space and guard pages.
    NoAccess,
    /// Normal read/write data pages.
    ReadWrite,
}

/// Returns a randomized, allocation-granularity aligned address suitable as
/// a placement hint for a large reservation.
///
/// The hint lies in the lower part of the user address space so that large
/// reservations keep ASLR entropy without colliding with the usual mmap area.
#[must_use]
pub fn random_mmap_hint() -> usize {
    #[cfg(target_pointer_width = "64")]
    const HINT_MASK: usize = 0x3F_FFFF_F000;
    #[cfg(target_pointer_width = "32")]
    const HINT_MASK: usize = 0x3FFF_F000;

    let raw = rand::random::<u64>() as usize;
    (raw & HINT_MASK) & !(allocation_granularity() - 1)
}

/// An owned range of reserved address space.
///
/// Freshly reserved memory is inaccessible until committed. The whole range is
/// released when this handle is dropped.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Returns a pointer to the start of the reservation.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the reservation in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` for an empty reservation (never produced by `reserve`).
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside the reservation.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len()
    }

    /// Makes `[offset, offset + len)` readable and writable.
    ///
    /// Pages committed for the first time, or after a `decommit`, read as zero.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.commit(offset, len) }
    }

    /// Returns the physical memory behind `[offset, offset + len)` to the OS
    /// and makes the range inaccessible. The range reads as zero once
    /// committed again.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.decommit(offset, len) }
    }

    /// Changes the protection of an already committed range.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.protect(offset, len, protection) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        let in_bounds = offset.checked_add(len).is_some_and(|end| end <= self.len());
        if !in_bounds || offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page aligned and inside the reservation",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Configuration for reserving address space.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    alignment: usize,
    hint_addr: usize,
}

impl ReserveOptions {
    /// Creates a new `ReserveOptions` with default settings (length 0).
    /// You must set a length before reserving.
    pub fn new() -> Self {
        Self {
            len: 0,
            alignment: allocation_granularity(),
            hint_addr: 0,
        }
    }

    /// Sets the length of the reservation in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the reservation to be aligned to `alignment`.
    ///
    /// Alignments above the allocation granularity are satisfied by
    /// over-reserving and trimming (Unix) or by retrying at an aligned
    /// address inside a larger probe reservation (Windows).
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment.max(allocation_granularity());
        self
    }

    /// Sets a placement hint. The OS is free to ignore it.
    pub fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Reserves inaccessible address space.
    pub fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }
        let len = self.len.next_multiple_of(page_size());
        let hint = self.hint_addr & !(self.alignment - 1);

        let inner = unsafe { os::ReservationInner::reserve(hint, len, self.alignment)? };
        debug_assert_eq!(inner.ptr() as usize % self.alignment, 0);
        Ok(Reservation { inner })
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_reserve_commit_write() {
        let len = 4 * page_size();
        let reservation = ReserveOptions::new().len(len).reserve().expect("reserve");
        assert_eq!(reservation.len(), len);
        assert!(!reservation.is_empty());

        reservation.commit(0, page_size()).expect("commit");
        let ptr = reservation.ptr();
        unsafe {
            assert_eq!(ptr::read_volatile(ptr), 0);
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_decommit_zeroes_on_recommit() {
        let len = 2 * page_size();
        let reservation = ReserveOptions::new().len(len).reserve().expect("reserve");
        reservation.commit(0, len).expect("commit");
        unsafe { ptr::write_volatile(reservation.ptr(), 7) };

        reservation.decommit(0, len).expect("decommit");
        reservation.commit(0, len).expect("recommit");
        unsafe { assert_eq!(ptr::read_volatile(reservation.ptr()), 0) };
    }

    #[test]
    fn test_aligned_reservation() {
        let alignment = 1 << 20;
        let reservation = ReserveOptions::new()
            .len(3 * page_size())
            .alignment(alignment)
            .reserve()
            .expect("reserve");
        assert_eq!(reservation.ptr() as usize % alignment, 0);
        assert!(reservation.contains(reservation.ptr() as usize));
        assert!(!reservation.contains(reservation.ptr() as usize + reservation.len()));
    }

    #[test]
    fn test_unaligned_commit_is_rejected() {
        let reservation = ReserveOptions::new()
            .len(2 * page_size())
            .reserve()
            .expect("reserve");
        assert!(reservation.commit(1, page_size()).is_err());
        assert!(reservation.commit(0, 3 * page_size()).is_err());
    }

    #[test]
    fn test_random_hint_is_aligned() {
        for _ in 0..16 {
            let hint = random_mmap_hint();
            assert_eq!(hint % allocation_granularity(), 0);
        }
    }

    #[test]
    fn test_reserve_with_hint() {
        // The OS may ignore the hint; only the contract of returning usable
        // memory is checked.
        let len = allocation_granularity();
        let reservation = ReserveOptions::new()
            .len(len)
            .with_hint(random_mmap_hint())
            .reserve()
            .expect("reserve");
        reservation.commit(0, page_size()).expect("commit");
        unsafe {
            ptr::write_volatile(reservation.ptr(), 99);
            assert_eq!(ptr::read_volatile(reservation.ptr()), 99);
        }
    }
}
