//! Page headers.
//!
//! Pages are `PAGE_SIZE` aligned. The page header sits right after the
//! leading guard page, so the header of any page is found by masking an
//! address that points into its first `PAGE_SIZE` bytes:
//!
//! ```text
//! normal: | guard | NormalPage (+ bitmap) | objects ............ | guard |
//! large:  | guard | LargePage | header | payload ............... | guard |
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::heap::base::HeapHandle;
use crate::heap::header::HeapObjectHeader;
use crate::heap::object_start_bitmap::ObjectStartBitmap;
use crate::heap::space::SpaceIndex;
use crate::heap::{ALLOCATION_GRANULARITY, GUARD_PAGE_SIZE, PAGE_SIZE};

/// Kind of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    Normal,
    Large,
}

/// State shared by normal and large pages.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct BasePage {
    kind: PageKind,
    space: SpaceIndex,
    heap: *const HeapHandle,
    // Cleared when the sweeper takes the page, set once it is swept.
    swept: AtomicBool,
}

impl BasePage {
    fn new(kind: PageKind, heap: *const HeapHandle, space: SpaceIndex) -> Self {
        Self {
            kind,
            space,
            heap,
            swept: AtomicBool::new(true),
        }
    }

    /// Page owning the object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload start of an object on a live page.
    #[inline]
    pub(crate) unsafe fn from_payload<'a>(payload: *const u8) -> &'a Self {
        let header = payload as usize - HeapObjectHeader::SIZE;
        unsafe { &*(((header & !(PAGE_SIZE - 1)) + GUARD_PAGE_SIZE) as *const Self) }
    }

    #[inline]
    pub(crate) const fn kind(&self) -> PageKind {
        self.kind
    }

    #[inline]
    pub(crate) fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }

    #[inline]
    pub(crate) const fn space(&self) -> SpaceIndex {
        self.space
    }

    /// Heap owning this page.
    ///
    /// # Safety
    ///
    /// The heap must still be alive.
    #[inline]
    pub(crate) unsafe fn heap<'a>(&self) -> &'a HeapHandle {
        unsafe { &*self.heap }
    }

    pub(crate) fn heap_ptr(&self) -> *const HeapHandle {
        self.heap
    }

    pub(crate) fn is_swept(&self) -> bool {
        self.swept.load(Ordering::Acquire)
    }

    pub(crate) fn set_swept(&self, swept: bool) {
        self.swept.store(swept, Ordering::Release);
    }

    /// Start of the page memory region, including the leading guard page.
    pub(crate) fn region_base(&self) -> NonNull<u8> {
        let base = std::ptr::from_ref(self) as usize - GUARD_PAGE_SIZE;
        unsafe { NonNull::new_unchecked(base as *mut u8) }
    }

    pub(crate) fn as_normal(&self) -> &NormalPage {
        debug_assert_eq!(self.kind, PageKind::Normal);
        unsafe { &*std::ptr::from_ref(self).cast::<NormalPage>() }
    }

    pub(crate) fn as_large(&self) -> &LargePage {
        debug_assert_eq!(self.kind, PageKind::Large);
        unsafe { &*std::ptr::from_ref(self).cast::<LargePage>() }
    }

    /// Header of the object containing `address`, if any.
    ///
    /// Free-list entries and the range `[lab_start, lab_end)` are skipped.
    pub(crate) fn try_object_header_from_inner_address(
        &self,
        address: usize,
        lab: (usize, usize),
    ) -> Option<&HeapObjectHeader> {
        let header = match self.kind {
            PageKind::Normal => {
                let page = self.as_normal();
                if address < page.payload_start() || address >= page.payload_end() {
                    return None;
                }
                if address >= lab.0 && address < lab.1 {
                    return None;
                }
                let header = page.object_start_bitmap().find_header(address)?;
                unsafe { &*(header as *const HeapObjectHeader) }
            }
            PageKind::Large => {
                let page = self.as_large();
                let header = page.header();
                if address < header.address() as usize || address >= page.payload_end() {
                    return None;
                }
                header
            }
        };
        if header.is_free() {
            return None;
        }
        Some(header)
    }
}

// ============================================================================
// Normal pages
// ============================================================================

/// A page holding many objects of one space.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct NormalPage {
    base: BasePage,
    object_start_bitmap: ObjectStartBitmap,
}

impl NormalPage {
    const PAYLOAD_OFFSET: usize =
        GUARD_PAGE_SIZE + std::mem::size_of::<Self>().next_multiple_of(ALLOCATION_GRANULARITY);

    /// Bytes available for objects on one normal page.
    pub(crate) const PAYLOAD_SIZE: usize = PAGE_SIZE - GUARD_PAGE_SIZE - Self::PAYLOAD_OFFSET;

    /// Writes a page header into the zeroed page memory at `region_base`.
    ///
    /// # Safety
    ///
    /// `region_base` must be a committed, zeroed, `PAGE_SIZE` aligned normal
    /// page handed out by the page backend.
    pub(crate) unsafe fn create(
        region_base: NonNull<u8>,
        heap: *const HeapHandle,
        space: SpaceIndex,
    ) -> NonNull<Self> {
        let base = region_base.as_ptr() as usize;
        debug_assert_eq!(base % PAGE_SIZE, 0);
        let page = (base + GUARD_PAGE_SIZE) as *mut Self;
        unsafe {
            std::ptr::addr_of_mut!((*page).base).write(BasePage::new(PageKind::Normal, heap, space));
            ObjectStartBitmap::init_in_place(std::ptr::addr_of_mut!((*page).object_start_bitmap), base);
            NonNull::new_unchecked(page)
        }
    }

    /// Page containing `address`.
    ///
    /// # Safety
    ///
    /// `address` must lie inside a live normal page.
    #[inline]
    pub(crate) unsafe fn from_address<'a>(address: usize) -> &'a Self {
        unsafe { &*(((address & !(PAGE_SIZE - 1)) + GUARD_PAGE_SIZE) as *const Self) }
    }

    #[inline]
    pub(crate) const fn base(&self) -> &BasePage {
        &self.base
    }

    #[inline]
    pub(crate) const fn object_start_bitmap(&self) -> &ObjectStartBitmap {
        &self.object_start_bitmap
    }

    #[inline]
    fn region_start(&self) -> usize {
        std::ptr::from_ref(self) as usize - GUARD_PAGE_SIZE
    }

    #[inline]
    pub(crate) fn payload_start(&self) -> usize {
        self.region_start() + Self::PAYLOAD_OFFSET
    }

    #[inline]
    pub(crate) fn payload_end(&self) -> usize {
        self.region_start() + PAGE_SIZE - GUARD_PAGE_SIZE
    }

    /// Calls `f` with every header on the page in address order.
    ///
    /// The page must not contain an active linear allocation buffer.
    pub(crate) fn for_each_header(&self, mut f: impl FnMut(&HeapObjectHeader)) {
        let mut address = self.payload_start();
        let end = self.payload_end();
        while address < end {
            let header = unsafe { &*(address as *const HeapObjectHeader) };
            let size = header.allocated_size();
            debug_assert!(size > 0, "corrupted header at {address:#x}");
            f(header);
            address += size;
        }
    }
}

// ============================================================================
// Large pages
// ============================================================================

/// A page holding exactly one object.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct LargePage {
    base: BasePage,
    payload_size: usize,
}

impl LargePage {
    const HEADER_OFFSET: usize =
        GUARD_PAGE_SIZE + std::mem::size_of::<Self>().next_multiple_of(ALLOCATION_GRANULARITY);

    /// Bytes of writeable memory needed for an object with `payload_size`.
    pub(crate) const fn writeable_size(payload_size: usize) -> usize {
        Self::HEADER_OFFSET - GUARD_PAGE_SIZE + HeapObjectHeader::SIZE + payload_size
    }

    /// Writes a page header into the zeroed page memory at `region_base`.
    ///
    /// # Safety
    ///
    /// `region_base` must be committed large page memory of at least
    /// `writeable_size(payload_size)` bytes after the guard page.
    pub(crate) unsafe fn create(
        region_base: NonNull<u8>,
        heap: *const HeapHandle,
        space: SpaceIndex,
        payload_size: usize,
    ) -> NonNull<Self> {
        let page = (region_base.as_ptr() as usize + GUARD_PAGE_SIZE) as *mut Self;
        unsafe {
            page.write(Self {
                base: BasePage::new(PageKind::Large, heap, space),
                payload_size,
            });
            NonNull::new_unchecked(page)
        }
    }

    /// Page owning the large object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must belong to a live large object.
    #[inline]
    pub(crate) unsafe fn from_payload<'a>(payload: *const u8) -> &'a Self {
        unsafe { BasePage::from_payload(payload) }.as_large()
    }

    #[inline]
    pub(crate) const fn base(&self) -> &BasePage {
        &self.base
    }

    pub(crate) fn header(&self) -> &HeapObjectHeader {
        let address = std::ptr::from_ref(self) as usize - GUARD_PAGE_SIZE + Self::HEADER_OFFSET;
        unsafe { &*(address as *const HeapObjectHeader) }
    }

    /// Size of the object including its header.
    pub(crate) const fn object_size(&self) -> usize {
        self.payload_size + HeapObjectHeader::SIZE
    }

    pub(crate) fn payload_end(&self) -> usize {
        self.header().payload() as usize + self.payload_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_page_layout_fits() {
        assert_eq!(NormalPage::PAYLOAD_OFFSET % ALLOCATION_GRANULARITY, 0);
        assert!(NormalPage::PAYLOAD_SIZE > crate::heap::LARGE_OBJECT_SIZE_THRESHOLD);
    }

    #[test]
    fn test_large_header_stays_in_first_page() {
        assert!(LargePage::HEADER_OFFSET + HeapObjectHeader::SIZE < PAGE_SIZE);
        assert_eq!(LargePage::writeable_size(0) % ALLOCATION_GRANULARITY, 0);
    }
}
