//! Object allocation.
//!
//! Allocation never fails: running out of memory aborts the process. Small
//! objects are bump-allocated from the linear allocation buffer of their
//! space. When the buffer runs dry it is refilled, trying in order:
//!
//! 1. a block from the space's free list,
//! 2. lazily sweeping pages of the space until a large enough block appears,
//! 3. a fresh normal page.
//!
//! Objects of `LARGE_OBJECT_SIZE_THRESHOLD` bytes or more get a page of their
//! own.
//!
//! New objects start in construction. Their payload is registered as a root
//! until the value is written, so a collection triggered by a nested
//! allocation keeps them, and markers defer tracing them.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::gc_info::GcInfoIndex;
use crate::heap::base::{AllocationHandle, HeapHandle};
use crate::heap::header::HeapObjectHeader;
use crate::heap::page::NormalPage;
use crate::heap::space::{SpaceIndex, SpaceKind};
use crate::heap::{allocation_size, LARGE_OBJECT_SIZE_THRESHOLD, MAX_SUPPORTED_ALIGNMENT};
use crate::member::{BasicMember, MemberKind};
use crate::ptr::GcPtr;
use crate::trace::GarbageCollected;

/// Extra payload bytes reserved after the object, see
/// [`make_garbage_collected_with_additional_bytes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct AdditionalBytes(pub usize);

/// The memory an object is being constructed in.
///
/// Handed to the initializer of [`make_garbage_collected_with`]. The object
/// must not be accessed through the slot; it only exists once the
/// initializer returned.
pub struct ConstructionSlot<'a, T: GarbageCollected> {
    heap: &'a HeapHandle,
    payload: NonNull<T>,
    _marker: PhantomData<*const T>,
}

impl<'a, T: GarbageCollected> ConstructionSlot<'a, T> {
    /// Heap the object is allocated on.
    #[must_use]
    pub const fn heap(&self) -> &'a HeapHandle {
        self.heap
    }

    /// Address the object will live at.
    #[must_use]
    pub const fn address(&self) -> NonNull<T> {
        self.payload
    }

    /// A member referring to the object itself, for self-referential
    /// values.
    #[must_use]
    pub fn member<K: MemberKind>(&self) -> BasicMember<T, K> {
        BasicMember::from_raw_address(self.payload.as_ptr() as usize)
    }
}

impl<T: GarbageCollected> std::fmt::Debug for ConstructionSlot<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstructionSlot")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Allocates `value` on the heap of `handle`.
///
/// The returned pointer is not a root. Store it in a
/// [`Persistent`](crate::Persistent) or a [`Member`](crate::Member) of a
/// live object before the next collection that does not scan the stack.
///
/// # Panics
///
/// Panics when called from a finalizer, or if `T::SPACE` names a custom
/// space the heap was not created with.
pub fn make_garbage_collected<T: GarbageCollected>(handle: &AllocationHandle, value: T) -> GcPtr<T> {
    allocate_and_construct(handle, 0, move |_| value)
}

/// Allocates a `T` built by `init`.
///
/// `init` runs after the memory was reserved and may allocate itself. The
/// [`ConstructionSlot`] gives access to the final address, for example to
/// build self-referential members.
///
/// # Panics
///
/// Same as [`make_garbage_collected`]. If `init` panics, the memory is
/// released and the panic resumes.
pub fn make_garbage_collected_with<T, F>(handle: &AllocationHandle, init: F) -> GcPtr<T>
where
    T: GarbageCollected,
    F: FnOnce(&ConstructionSlot<'_, T>) -> T,
{
    allocate_and_construct(handle, 0, init)
}

/// Allocates `value` followed by `additional.0` zeroed bytes, reachable via
/// [`GcPtr::trailing_storage`].
///
/// # Panics
///
/// Same as [`make_garbage_collected`].
pub fn make_garbage_collected_with_additional_bytes<T: GarbageCollected>(
    handle: &AllocationHandle,
    additional: AdditionalBytes,
    value: T,
) -> GcPtr<T> {
    allocate_and_construct(handle, additional.0, move |_| value)
}

fn allocate_and_construct<T, F>(heap: &HeapHandle, additional: usize, init: F) -> GcPtr<T>
where
    T: GarbageCollected,
    F: FnOnce(&ConstructionSlot<'_, T>) -> T,
{
    const {
        assert!(
            std::mem::align_of::<T>() <= MAX_SUPPORTED_ALIGNMENT,
            "managed types may not require more than 8 byte alignment"
        );
    }
    assert!(
        !heap.in_finalization.get(),
        "allocation from a finalizer is not allowed"
    );

    let payload_size = std::mem::size_of::<T>()
        .checked_add(additional)
        .unwrap_or_else(|| crate::heap::oom("allocation size overflow", usize::MAX));
    let gc_info_index = heap.gc_info().index_of::<T>();
    let header = heap.allocate_object(payload_size, T::SPACE, gc_info_index);
    let payload = header.payload();

    // Allocated objects stay roots until their value is written.
    heap.construction_roots.borrow_mut().push(payload as usize);
    let guard = ConstructionGuard {
        heap,
        header,
        completed: false,
    };

    let slot = ConstructionSlot {
        heap,
        // SAFETY: `payload` comes from a header and is never null.
        payload: unsafe { NonNull::new_unchecked(payload.cast::<T>()) },
        _marker: PhantomData,
    };
    let value = init(&slot);
    // SAFETY: the payload is zeroed, sized and aligned for `T`.
    unsafe { slot.payload.as_ptr().write(value) };
    header.mark_as_fully_constructed();
    guard.complete();

    // SAFETY: the object is fully constructed.
    unsafe { GcPtr::from_raw(slot.payload) }
}

/// Pops the construction root; releases the object if the initializer
/// unwound.
struct ConstructionGuard<'a> {
    heap: &'a HeapHandle,
    header: &'a HeapObjectHeader,
    completed: bool,
}

impl ConstructionGuard<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for ConstructionGuard<'_> {
    fn drop(&mut self) {
        let payload = self.header.payload() as usize;
        let mut roots = self.heap.construction_roots.borrow_mut();
        if let Some(index) = roots.iter().rposition(|&root| root == payload) {
            roots.swap_remove(index);
        }
        drop(roots);
        if !self.completed {
            // The value was never written; the sweeper reclaims the block.
            self.heap
                .allocated_bytes
                .set(self.heap.allocated_bytes.get() - self.header.allocated_size());
            self.header.mark_as_free();
        }
    }
}

impl HeapHandle {
    /// Reserves memory for an object and writes its header. The payload is
    /// zeroed and the object is in construction.
    pub(crate) fn allocate_object(
        &self,
        payload_size: usize,
        space: SpaceKind,
        gc_info_index: GcInfoIndex,
    ) -> &HeapObjectHeader {
        let size = allocation_size(payload_size);
        // May run a collection step, so no heap borrow is held yet.
        self.on_allocation(size);

        let young = self.is_generational();
        let header = if size >= LARGE_OBJECT_SIZE_THRESHOLD {
            let payload = size - HeapObjectHeader::SIZE;
            let address = self.new_large_object(payload);
            // SAFETY: the large page reserved a header followed by `payload`
            // zeroed bytes.
            unsafe { HeapObjectHeader::create(address, 0, gc_info_index, young) }
        } else {
            let space = self.raw_heap.borrow().space_index(space, size);
            let address = self.allocate_in_space(space, size) as *mut u8;
            // SAFETY: `allocate_in_space` returned `size` unused bytes.
            unsafe {
                let header = HeapObjectHeader::create(address, size, gc_info_index, young);
                std::ptr::write_bytes(header.payload(), 0, size - HeapObjectHeader::SIZE);
                header
            }
        };

        self.allocated_bytes
            .set(self.allocated_bytes.get() + header.allocated_size());
        #[cfg(feature = "test-util")]
        self.counters
            .objects_allocated
            .set(self.counters.objects_allocated.get() + 1);
        header
    }

    /// Returns the address of `size` unused bytes of a normal page of
    /// `space`, with its object-start bit set.
    fn allocate_in_space(&self, space: SpaceIndex, size: usize) -> usize {
        if let Some(address) = self.bump_allocate(space, size) {
            return address;
        }
        if !self.refill_lab(space, size) {
            // Sweeping may free a large enough block.
            if !self.sweep_for_allocation(space, size) || !self.refill_lab(space, size) {
                let mut raw = self.raw_heap.borrow_mut();
                raw.normal[space].reset_lab();
                self.new_normal_page(&mut raw, space);
                drop(raw);
                if !self.refill_lab(space, size) {
                    crate::heap::oom("fresh page cannot hold the object", size);
                }
            }
        }
        match self.bump_allocate(space, size) {
            Some(address) => address,
            None => crate::heap::oom("linear allocation buffer too small", size),
        }
    }

    fn bump_allocate(&self, space: SpaceIndex, size: usize) -> Option<usize> {
        let mut raw = self.raw_heap.borrow_mut();
        let space = &mut raw.normal[space];
        if space.lab.size < size {
            return None;
        }
        let address = space.lab.start;
        space.lab.start += size;
        space.lab.size -= size;
        // SAFETY: the buffer lies on a normal page of this space.
        let page = unsafe { NormalPage::from_address(address) };
        page.object_start_bitmap().set_bit(address);
        Some(address)
    }

    /// Replaces the buffer of `space` with a free-list block of at least
    /// `size` bytes.
    fn refill_lab(&self, space: SpaceIndex, size: usize) -> bool {
        let mut raw = self.raw_heap.borrow_mut();
        let space = &mut raw.normal[space];
        space.reset_lab();
        let Some(block) = space.free_list.allocate(size) else {
            return false;
        };
        space.set_lab(block);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::heap::base::{Heap, HeapOptions};
    use crate::platform::DefaultPlatform;
    use crate::process::{initialize_process, ProcessConfig};
    use crate::trace::{Trace, Visitor};

    struct Pair {
        left: u64,
        right: u64,
    }

    unsafe impl Trace for Pair {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for Pair {}

    struct Blob([u64; 16 * 1024]);

    unsafe impl Trace for Blob {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for Blob {}

    fn heap() -> Heap {
        initialize_process(ProcessConfig::default());
        Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default())
    }

    #[test]
    fn test_consecutive_allocations_are_bumped() {
        let heap = heap();
        let a = make_garbage_collected(heap.allocation_handle(), Pair { left: 1, right: 2 });
        let b = make_garbage_collected(heap.allocation_handle(), Pair { left: 3, right: 4 });
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            allocation_size(std::mem::size_of::<Pair>())
        );
        assert_eq!(a.left + a.right + b.left + b.right, 10);
        assert!(!a.header().is_in_construction());
        assert_eq!(heap.stats().normal_pages, 1);
        assert_eq!(heap.stats().allocated_bytes, 2 * allocation_size(16));
    }

    #[test]
    fn test_large_objects_get_their_own_page() {
        let heap = heap();
        let blob = make_garbage_collected(heap.allocation_handle(), Blob([7; 16 * 1024]));
        assert!(blob.header().is_large_object());
        assert_eq!(blob.0[1000], 7);
        assert_eq!(heap.stats().large_pages, 1);
        assert_eq!(heap.stats().normal_pages, 0);
    }

    #[test]
    fn test_additional_bytes_are_zeroed() {
        let heap = heap();
        let pair = make_garbage_collected_with_additional_bytes(
            heap.allocation_handle(),
            AdditionalBytes(20),
            Pair { left: 0, right: 0 },
        );
        let trailing = unsafe { pair.trailing_storage().as_ref() };
        assert!(trailing.len() >= 20);
        assert!(trailing.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_object_start_bits_are_set() {
        let heap = heap();
        let pair = make_garbage_collected(heap.allocation_handle(), Pair { left: 0, right: 0 });
        let header = pair.header().address() as usize;
        let page = unsafe { NormalPage::from_address(header) };
        assert!(page.object_start_bitmap().check_bit(header));
        assert_eq!(page.object_start_bitmap().find_header(header + 12), Some(header));
    }

    #[test]
    fn test_panicking_initializer_releases_object() {
        let heap = heap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            make_garbage_collected_with::<Pair, _>(heap.allocation_handle(), |_| {
                panic!("initializer failed")
            })
        }));
        assert!(result.is_err());
        assert!(heap.construction_roots.borrow().is_empty());
        assert_eq!(heap.stats().allocated_bytes, 0);
    }
}
