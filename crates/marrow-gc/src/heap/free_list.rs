//! Bucketed free list.
//!
//! Free blocks are threaded through the memory they describe: each entry is
//! a free [`HeapObjectHeader`] followed by the link to the next entry.
//! Bucket `i` holds blocks with sizes in `[2^i, 2^(i+1))`. Blocks too small
//! for an entry become fillers that only keep the page walkable.

use std::ptr::NonNull;

use crate::heap::header::HeapObjectHeader;
use crate::heap::MIN_BLOCK_SIZE;

const BUCKETS: usize = usize::BITS as usize;

#[repr(C)]
struct Entry {
    header: HeapObjectHeader,
    next: Option<NonNull<Entry>>,
}

const _: () = assert!(std::mem::size_of::<Entry>() == MIN_BLOCK_SIZE);

/// A contiguous range of heap memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub(crate) address: usize,
    pub(crate) size: usize,
}

#[inline]
const fn bucket_index(size: usize) -> usize {
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

#[derive(Debug)]
pub(crate) struct FreeList {
    heads: [Option<NonNull<Entry>>; BUCKETS],
    free_bytes: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; BUCKETS],
            free_bytes: 0,
        }
    }

    /// Adds `block` to the list. Returns `false` if the block was too small
    /// and became a filler instead.
    ///
    /// # Safety
    ///
    /// `block` must be unused, 8 byte aligned heap memory on a normal page.
    pub(crate) unsafe fn add(&mut self, block: Block) -> bool {
        debug_assert!(block.size >= HeapObjectHeader::SIZE);
        let address = block.address as *mut u8;
        if block.size < MIN_BLOCK_SIZE {
            unsafe { HeapObjectHeader::create_free(address, block.size) };
            return false;
        }
        let index = bucket_index(block.size);
        let entry = address.cast::<Entry>();
        unsafe {
            HeapObjectHeader::create_free(address, block.size);
            std::ptr::addr_of_mut!((*entry).next).write(self.heads[index]);
            self.heads[index] = Some(NonNull::new_unchecked(entry));
        }
        self.free_bytes += block.size;
        true
    }

    /// Takes a block of at least `size` bytes off the list.
    pub(crate) fn allocate(&mut self, size: usize) -> Option<Block> {
        let floor = bucket_index(size);
        // Every block in a bucket above the floor is large enough.
        let first_fitting = if size.is_power_of_two() { floor } else { floor + 1 };
        for index in first_fitting..BUCKETS {
            if let Some(entry) = self.heads[index] {
                unsafe { self.heads[index] = entry.as_ref().next };
                return Some(self.take(entry));
            }
        }
        if first_fitting == floor {
            return None;
        }

        // The floor bucket may still hold a large enough block.
        let mut link: *mut Option<NonNull<Entry>> = &raw mut self.heads[floor];
        unsafe {
            while let Some(entry) = *link {
                if entry.as_ref().header.allocated_size() >= size {
                    *link = entry.as_ref().next;
                    return Some(self.take(entry));
                }
                link = &raw mut (*entry.as_ptr()).next;
            }
        }
        None
    }

    fn take(&mut self, entry: NonNull<Entry>) -> Block {
        let size = unsafe { entry.as_ref().header.allocated_size() };
        self.free_bytes -= size;
        Block {
            address: entry.as_ptr() as usize,
            size,
        }
    }

    /// Forgets every entry. The entries stay behind as free headers.
    pub(crate) fn clear(&mut self) {
        self.heads = [None; BUCKETS];
        self.free_bytes = 0;
    }

    /// Total bytes held by entries.
    pub(crate) const fn free_bytes(&self) -> usize {
        self.free_bytes
    }
}
