//! Per-object metadata.
//!
//! Every managed object is preceded by an 8 byte [`HeapObjectHeader`]:
//!
//! ```text
//! | padding (32) | in-construction (1) | young (1) | gc info index (14) | size >> 3 (15) | mark (1) |
//!                 <-------------- encoded_high ----------------------> <------ encoded_low ------->
//! ```
//!
//! The mark bit is the only bit written by background markers and is always
//! updated atomically. The remaining bits belong to the allocating thread;
//! they are still stored in atomics so background markers can read them.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::gc_info::GcInfoIndex;
use crate::heap::page::LargePage;
use crate::heap::ALLOCATION_GRANULARITY;

const GC_INFO_INDEX_MASK: u16 = (1 << 14) - 1;
const YOUNG_BIT: u16 = 1 << 14;
const IN_CONSTRUCTION_BIT: u16 = 1 << 15;

const MARK_BIT: u16 = 1;
const SIZE_SHIFT: u32 = 1;

/// Largest size representable in the header. Bigger objects live on large
/// pages and store an encoded size of zero.
pub(crate) const MAX_ENCODED_SIZE: usize =
    ((u16::MAX >> SIZE_SHIFT) as usize) * ALLOCATION_GRANULARITY;

/// Header preceding every object, free-list entry and filler on the heap.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct HeapObjectHeader {
    #[cfg(target_pointer_width = "64")]
    _padding: u32,
    encoded_high: AtomicU16,
    encoded_low: AtomicU16,
}

const _: () = assert!(std::mem::size_of::<HeapObjectHeader>() == 8);

impl HeapObjectHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Writes a fresh header at `address`.
    ///
    /// `size` is the full allocation size including the header, or zero for
    /// objects on large pages. New objects start out in construction.
    ///
    /// # Safety
    ///
    /// `address` must be 8 byte aligned and valid for writes of
    /// `HeapObjectHeader::SIZE` bytes.
    pub(crate) unsafe fn create<'a>(
        address: *mut u8,
        size: usize,
        gc_info_index: GcInfoIndex,
        young: bool,
    ) -> &'a Self {
        debug_assert_eq!(address as usize % ALLOCATION_GRANULARITY, 0);
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        debug_assert!(size <= MAX_ENCODED_SIZE);
        debug_assert!(gc_info_index.0 <= GC_INFO_INDEX_MASK);

        let mut high = gc_info_index.0 & GC_INFO_INDEX_MASK;
        if young {
            high |= YOUNG_BIT;
        }
        if !gc_info_index.is_free() {
            high |= IN_CONSTRUCTION_BIT;
        }
        let header = address.cast::<Self>();
        unsafe {
            header.write(Self {
                #[cfg(target_pointer_width = "64")]
                _padding: 0,
                encoded_high: AtomicU16::new(high),
                encoded_low: AtomicU16::new(encode_size(size)),
            });
            &*header
        }
    }

    /// Writes a free-list entry or filler header covering `size` bytes.
    ///
    /// # Safety
    ///
    /// Same requirements as [`HeapObjectHeader::create`].
    pub(crate) unsafe fn create_free<'a>(address: *mut u8, size: usize) -> &'a Self {
        unsafe { Self::create(address, size, GcInfoIndex::FREE, false) }
    }

    /// Returns the header of the object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload start of a live heap object.
    #[inline]
    pub unsafe fn from_payload<'a>(payload: *const u8) -> &'a Self {
        unsafe { &*payload.sub(Self::SIZE).cast::<Self>() }
    }

    /// Address of the header itself.
    #[inline]
    pub fn address(&self) -> *mut u8 {
        std::ptr::from_ref(self).cast_mut().cast::<u8>()
    }

    /// Start of the object payload.
    #[inline]
    pub fn payload(&self) -> *mut u8 {
        self.address().wrapping_add(Self::SIZE)
    }

    /// Type-info index of the object.
    #[inline]
    pub fn gc_info_index(&self) -> GcInfoIndex {
        GcInfoIndex(self.encoded_high.load(Ordering::Relaxed) & GC_INFO_INDEX_MASK)
    }

    /// Returns `true` for free-list entries and fillers.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.gc_info_index().is_free()
    }

    /// Returns `true` if the object lives on a large page.
    #[inline]
    pub fn is_large_object(&self) -> bool {
        self.encoded_size() == 0
    }

    /// Allocated size including the header.
    ///
    /// Large objects consult their page.
    pub fn allocated_size(&self) -> usize {
        match self.encoded_size() {
            0 => unsafe { LargePage::from_payload(self.payload()).object_size() },
            size => size,
        }
    }

    /// Size of the payload in bytes.
    pub fn object_size(&self) -> usize {
        self.allocated_size() - Self::SIZE
    }

    #[inline]
    fn encoded_size(&self) -> usize {
        decode_size(self.encoded_low.load(Ordering::Relaxed))
    }

    /// Changes the recorded size of a normal-page object, keeping the mark bit.
    pub(crate) fn set_allocated_size(&self, size: usize) {
        debug_assert!(!self.is_large_object());
        debug_assert!(size > 0 && size <= MAX_ENCODED_SIZE);
        let encoded = encode_size(size);
        let _ = self
            .encoded_low
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |low| {
                Some((low & MARK_BIT) | encoded)
            });
    }

    // ========================================================================
    // Mark bit
    // ========================================================================

    /// Returns `true` if the mark bit is set.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.encoded_low.load(Ordering::Acquire) & MARK_BIT != 0
    }

    /// Sets the mark bit. Returns `true` if this call set it.
    #[inline]
    pub fn try_mark_atomic(&self) -> bool {
        self.encoded_low.fetch_or(MARK_BIT, Ordering::AcqRel) & MARK_BIT == 0
    }

    /// Clears the mark bit.
    #[inline]
    pub(crate) fn unmark(&self) {
        self.encoded_low.fetch_and(!MARK_BIT, Ordering::Relaxed);
    }

    // ========================================================================
    // Young and in-construction bits
    // ========================================================================

    /// Returns `true` if the object was allocated since the last collection
    /// in a generational heap.
    #[inline]
    pub fn is_young(&self) -> bool {
        self.encoded_high.load(Ordering::Relaxed) & YOUNG_BIT != 0
    }

    /// Promotes the object to the old generation.
    #[inline]
    pub(crate) fn set_old(&self) {
        self.encoded_high.fetch_and(!YOUNG_BIT, Ordering::Relaxed);
    }

    /// Returns `true` while the object's value has not been written yet.
    #[inline]
    pub fn is_in_construction(&self) -> bool {
        self.encoded_high.load(Ordering::Acquire) & IN_CONSTRUCTION_BIT != 0
    }

    /// Publishes the fully constructed object to concurrent markers.
    #[inline]
    pub(crate) fn mark_as_fully_constructed(&self) {
        self.encoded_high
            .fetch_and(!IN_CONSTRUCTION_BIT, Ordering::Release);
    }

    /// Turns an abandoned allocation into a free block of the same size.
    pub(crate) fn mark_as_free(&self) {
        self.encoded_high.store(GcInfoIndex::FREE.0, Ordering::Release);
        self.unmark();
    }
}

#[inline]
const fn encode_size(size: usize) -> u16 {
    ((size / ALLOCATION_GRANULARITY) << SIZE_SHIFT) as u16
}

#[inline]
const fn decode_size(low: u16) -> usize {
    ((low >> SIZE_SHIFT) as usize) * ALLOCATION_GRANULARITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Slot([u8; 64]);

    fn header_in(slot: &mut Slot, size: usize, index: u16) -> &HeapObjectHeader {
        unsafe { HeapObjectHeader::create(slot.0.as_mut_ptr(), size, GcInfoIndex(index), false) }
    }

    #[test]
    fn test_size_and_index_round_trip() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 48, 7);
        assert_eq!(header.allocated_size(), 48);
        assert_eq!(header.object_size(), 40);
        assert_eq!(header.gc_info_index(), GcInfoIndex(7));
        assert!(!header.is_free());
        assert!(!header.is_large_object());
    }

    #[test]
    fn test_new_objects_start_in_construction() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 16, 3);
        assert!(header.is_in_construction());
        header.mark_as_fully_constructed();
        assert!(!header.is_in_construction());
        assert_eq!(header.gc_info_index(), GcInfoIndex(3));
    }

    #[test]
    fn test_free_headers_are_never_in_construction() {
        let mut slot = Slot([0; 64]);
        let header = unsafe { HeapObjectHeader::create_free(slot.0.as_mut_ptr(), 32) };
        assert!(header.is_free());
        assert!(!header.is_in_construction());
        assert_eq!(header.allocated_size(), 32);
    }

    #[test]
    fn test_mark_bit_is_set_once() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 24, 1);
        assert!(!header.is_marked());
        assert!(header.try_mark_atomic());
        assert!(!header.try_mark_atomic());
        assert!(header.is_marked());
        header.unmark();
        assert!(!header.is_marked());
    }

    #[test]
    fn test_resize_keeps_mark_bit() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 64, 2);
        header.try_mark_atomic();
        header.set_allocated_size(32);
        assert!(header.is_marked());
        assert_eq!(header.allocated_size(), 32);
    }

    #[test]
    fn test_young_bit() {
        let mut slot = Slot([0; 64]);
        let header =
            unsafe { HeapObjectHeader::create(slot.0.as_mut_ptr(), 16, GcInfoIndex(5), true) };
        assert!(header.is_young());
        header.set_old();
        assert!(!header.is_young());
        assert_eq!(header.gc_info_index(), GcInfoIndex(5));
    }

    #[test]
    fn test_payload_and_from_payload_agree() {
        let mut slot = Slot([0; 64]);
        let header = header_in(&mut slot, 16, 1);
        let payload = header.payload();
        let again = unsafe { HeapObjectHeader::from_payload(payload) };
        assert_eq!(again.address(), header.address());
    }

    #[test]
    fn test_max_encoded_size_covers_normal_pages() {
        assert!(MAX_ENCODED_SIZE >= crate::heap::PAGE_SIZE);
    }
}
