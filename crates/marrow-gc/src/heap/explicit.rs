//! Explicit memory management.
//!
//! Embedders that know an object is unreachable may free it right away, and
//! objects with trailing storage may be resized in place. Both operations
//! step back while a collection owns the heap: the object then simply lives
//! until the next cycle reclaims it.

use crate::heap::allocator::AdditionalBytes;
use crate::heap::base::HeapHandle;
use crate::heap::free_list::Block;
use crate::heap::page::BasePage;
use crate::heap::{allocation_size, MIN_BLOCK_SIZE};
use crate::ptr::GcPtr;
use crate::trace::GarbageCollected;

/// Finalizes `object` and returns its memory to the heap.
///
/// Does nothing while the heap is marking, sweeping or finalizing.
///
/// # Safety
///
/// `object` must be unreachable: no member, persistent or stack slot may
/// use it afterwards.
pub unsafe fn free_unreferenced_object<T: GarbageCollected>(heap: &HeapHandle, object: GcPtr<T>) {
    if heap.is_gc_phase_active() {
        return;
    }
    let header = object.header();
    // SAFETY: `object` is a live managed object.
    let page = unsafe { BasePage::from_payload(header.payload()) };
    debug_assert!(std::ptr::eq(page.heap_ptr(), heap), "object of another heap");
    if header.is_in_construction() {
        return;
    }

    heap.with_finalization(|| heap.finalize_object(header));

    let address = header.address() as usize;
    if page.is_large() {
        let large = page.as_large();
        heap.allocated_bytes
            .set(heap.allocated_bytes.get() - large.object_size());
        heap.forget_range(address, large.payload_end());
        let page = std::ptr::NonNull::from(large);
        heap.raw_heap
            .borrow_mut()
            .large
            .pages
            .retain(|candidate| *candidate != page);
        heap.release_large_page(page);
        return;
    }

    let size = header.allocated_size();
    heap.allocated_bytes.set(heap.allocated_bytes.get() - size);
    heap.forget_range(address, address + size);
    let mut raw = heap.raw_heap.borrow_mut();
    let space = &mut raw.normal[page.space()];
    debug_assert!(page.as_normal().object_start_bitmap().check_bit(address));
    if address + size == space.lab.start {
        // Grow the buffer backwards instead of fragmenting the free list.
        page.as_normal().object_start_bitmap().clear_bit(address);
        space.lab.start = address;
        space.lab.size += size;
    } else {
        space.add_to_free_list(Block { address, size });
    }
}

/// Changes the trailing storage of `object` to `additional` bytes without
/// moving it.
///
/// Returns `false` if the heap is busy with a collection, the object is
/// large, or there is no room to grow. Shrinking by less than the smallest
/// free block keeps the old size and still succeeds.
pub fn resize<T: GarbageCollected>(object: GcPtr<T>, additional: AdditionalBytes) -> bool {
    let header = object.header();
    // SAFETY: `object` is a live managed object.
    let page = unsafe { BasePage::from_payload(header.payload()) };
    // SAFETY: the heap outlives its pages.
    let heap = unsafe { page.heap() };
    if heap.is_gc_phase_active() || page.is_large() {
        return false;
    }
    let Some(payload_size) = std::mem::size_of::<T>().checked_add(additional.0) else {
        return false;
    };
    let new_size = allocation_size(payload_size);
    let old_size = header.allocated_size();
    let address = header.address() as usize;
    let next = address + old_size;

    let mut raw = heap.raw_heap.borrow_mut();
    let space = &mut raw.normal[page.space()];

    if new_size > old_size {
        let delta = new_size - old_size;
        if next != space.lab.start || space.lab.size < delta {
            return false;
        }
        space.lab.start += delta;
        space.lab.size -= delta;
        // SAFETY: the bytes came from the buffer and belong to the object now.
        unsafe { std::ptr::write_bytes(next as *mut u8, 0, delta) };
        header.set_allocated_size(new_size);
        heap.allocated_bytes.set(heap.allocated_bytes.get() + delta);
        return true;
    }

    let delta = old_size - new_size;
    if delta == 0 {
        return true;
    }
    if next == space.lab.start {
        space.lab.start -= delta;
        space.lab.size += delta;
    } else if delta >= MIN_BLOCK_SIZE {
        space.add_to_free_list(Block {
            address: address + new_size,
            size: delta,
        });
    } else {
        return true;
    }
    drop(raw);
    header.set_allocated_size(new_size);
    heap.allocated_bytes.set(heap.allocated_bytes.get() - delta);
    heap.forget_range(address + new_size, next);
    true
}

impl HeapHandle {
    /// Drops remembered slots inside memory that is being released.
    fn forget_range(&self, start: usize, end: usize) {
        if self.is_generational() {
            self.remembered_set.borrow_mut().remove_range(start, end);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::heap::allocator::{make_garbage_collected, make_garbage_collected_with_additional_bytes};
    use crate::heap::base::{Heap, HeapOptions};
    use crate::platform::DefaultPlatform;
    use crate::process::{initialize_process, ProcessConfig};
    use crate::trace::{Trace, Visitor};

    struct Counted(Rc<Cell<usize>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    unsafe impl Trace for Counted {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for Counted {}

    struct Buffer(u64);

    unsafe impl Trace for Buffer {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for Buffer {}

    fn heap() -> Heap {
        initialize_process(ProcessConfig::default());
        Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default())
    }

    #[test]
    fn test_free_finalizes_and_returns_memory_to_lab() {
        let heap = heap();
        let drops = Rc::new(Cell::new(0));
        let object = make_garbage_collected(heap.allocation_handle(), Counted(Rc::clone(&drops)));
        let address = object.as_ptr() as usize;
        unsafe { free_unreferenced_object(&heap, object) };
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.stats().allocated_bytes, 0);

        let again = make_garbage_collected(heap.allocation_handle(), Counted(Rc::clone(&drops)));
        assert_eq!(again.as_ptr() as usize, address);
    }

    #[test]
    fn test_free_is_a_noop_while_sweeping() {
        let heap = heap();
        let drops = Rc::new(Cell::new(0));
        let object = make_garbage_collected(heap.allocation_handle(), Counted(Rc::clone(&drops)));
        heap.sweeping.set(true);
        unsafe { free_unreferenced_object(&heap, object) };
        heap.sweeping.set(false);
        assert_eq!(drops.get(), 0);
        assert!(heap.is_object_alive(object.as_ptr()));
    }

    #[test]
    fn test_resize_grows_into_lab_and_shrinks() {
        let heap = heap();
        let buffer = make_garbage_collected_with_additional_bytes(
            heap.allocation_handle(),
            AdditionalBytes(8),
            Buffer(1),
        );
        assert!(resize(buffer, AdditionalBytes(64)));
        assert!(buffer.trailing_storage().len() >= 64);
        assert_eq!(buffer.0, 1);

        assert!(resize(buffer, AdditionalBytes(0)));
        assert_eq!(heap.object_size(buffer), 8);
    }

    #[test]
    fn test_resize_fails_without_room() {
        let heap = heap();
        let first = make_garbage_collected(heap.allocation_handle(), Buffer(1));
        let _second = make_garbage_collected(heap.allocation_handle(), Buffer(2));
        assert!(!resize(first, AdditionalBytes(32)));
    }
}
