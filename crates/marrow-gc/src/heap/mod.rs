//! Heap memory management.
//!
//! Objects live on `PAGE_SIZE` aligned pages grouped into spaces. Small
//! objects share normal pages and are served from a linear allocation buffer
//! backed by a bucketed free list; objects of `LARGE_OBJECT_SIZE_THRESHOLD`
//! bytes or more get a large page of their own.

pub(crate) mod allocator;
pub(crate) mod base;
pub(crate) mod cage;
pub(crate) mod explicit;
pub(crate) mod free_list;
pub(crate) mod growing;
pub(crate) mod header;
pub(crate) mod object_start_bitmap;
pub(crate) mod page;
pub(crate) mod page_memory;
pub(crate) mod space;
pub(crate) mod sweeper;

pub use allocator::{
    make_garbage_collected, make_garbage_collected_with, make_garbage_collected_with_additional_bytes,
    AdditionalBytes, ConstructionSlot,
};
pub use base::{AllocationHandle, Heap, HeapHandle, HeapOptions, HeapStatistics};
pub use explicit::{free_unreferenced_object, resize};
pub use growing::HeapGrowingConfig;
pub use header::HeapObjectHeader;
pub use space::SpaceKind;

/// Log2 of the page size.
pub const PAGE_SIZE_LOG2: usize = 17;

/// Size and alignment of every page.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;

/// Size of the inaccessible guard area at both ends of a page.
pub const GUARD_PAGE_SIZE: usize = 4096;

/// Allocations are rounded up to this many bytes.
pub const ALLOCATION_GRANULARITY: usize = 8;

/// Largest alignment a managed type may require.
pub const MAX_SUPPORTED_ALIGNMENT: usize = ALLOCATION_GRANULARITY;

/// Objects of this size or more, header included, go to large pages.
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = PAGE_SIZE / 2;

/// Number of normal pages reserved together in one region.
pub const PAGES_PER_REGION: usize = 10;

/// Smallest block that can hold a free-list entry.
pub(crate) const MIN_BLOCK_SIZE: usize = 2 * ALLOCATION_GRANULARITY;

/// Allocation size, header included, of an object with `payload` bytes.
#[inline]
pub(crate) const fn allocation_size(payload: usize) -> usize {
    let size = (payload + HeapObjectHeader::SIZE).next_multiple_of(ALLOCATION_GRANULARITY);
    if size < MIN_BLOCK_SIZE {
        MIN_BLOCK_SIZE
    } else {
        size
    }
}

/// Aborts the process after an unrecoverable allocation failure.
#[cold]
pub(crate) fn oom(reason: &str, size: usize) -> ! {
    crate::tracing::internal::log_fatal(reason, size);
    let layout = std::alloc::Layout::from_size_align(size.max(1), ALLOCATION_GRANULARITY)
        .unwrap_or_else(|_| std::alloc::Layout::new::<u8>());
    std::alloc::handle_alloc_error(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_size_rounding() {
        assert_eq!(allocation_size(0), MIN_BLOCK_SIZE);
        assert_eq!(allocation_size(1), 16);
        assert_eq!(allocation_size(8), 16);
        assert_eq!(allocation_size(9), 24);
        assert_eq!(allocation_size(100), 112);
    }
}
