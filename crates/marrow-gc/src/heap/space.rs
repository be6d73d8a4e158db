//! Spaces group the pages of the heap.
//!
//! Four regular normal-page spaces segregate small objects by size, custom
//! spaces hold the types that ask for one through
//! [`GarbageCollected::SPACE`](crate::GarbageCollected::SPACE), and a single
//! large-page space holds every large object.

use std::ptr::NonNull;

use crate::heap::free_list::{Block, FreeList};
use crate::heap::page::{LargePage, NormalPage};

/// Index of a space inside its heap.
pub(crate) type SpaceIndex = usize;

/// Number of regular size-class spaces.
pub(crate) const REGULAR_SPACES: usize = 4;

/// Index recorded on large pages.
pub(crate) const LARGE_SPACE: SpaceIndex = usize::MAX;

/// Space a managed type is allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpaceKind {
    /// Size-segregated regular spaces.
    #[default]
    Regular,
    /// One of the heap's custom spaces, see
    /// [`HeapOptions::custom_spaces`](crate::HeapOptions::custom_spaces).
    Custom(usize),
}

/// Regular space serving objects of `allocation_size` bytes.
#[inline]
pub(crate) const fn regular_space_for(allocation_size: usize) -> SpaceIndex {
    match allocation_size {
        0..32 => 0,
        32..64 => 1,
        64..128 => 2,
        _ => 3,
    }
}

/// Range of a page served by bump allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LinearAllocationBuffer {
    pub(crate) start: usize,
    pub(crate) size: usize,
}

impl LinearAllocationBuffer {
    #[inline]
    pub(crate) const fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    pub(crate) const fn range(&self) -> (usize, usize) {
        (self.start, self.start + self.size)
    }
}

#[derive(Debug)]
pub(crate) struct NormalPageSpace {
    pub(crate) index: SpaceIndex,
    pub(crate) pages: Vec<NonNull<NormalPage>>,
    pub(crate) free_list: FreeList,
    pub(crate) lab: LinearAllocationBuffer,
}

impl NormalPageSpace {
    fn new(index: SpaceIndex) -> Self {
        Self {
            index,
            pages: Vec::new(),
            free_list: FreeList::new(),
            lab: LinearAllocationBuffer::default(),
        }
    }

    /// Adds `block` to the free list and records it in its page's bitmap.
    pub(crate) fn add_to_free_list(&mut self, block: Block) {
        if block.size == 0 {
            return;
        }
        let page = unsafe { NormalPage::from_address(block.address) };
        page.object_start_bitmap().set_bit(block.address);
        unsafe { self.free_list.add(block) };
    }

    /// Returns the unused part of the current buffer to the free list.
    pub(crate) fn reset_lab(&mut self) {
        let lab = std::mem::take(&mut self.lab);
        self.add_to_free_list(Block {
            address: lab.start,
            size: lab.size,
        });
    }

    /// Makes `block` the current buffer.
    ///
    /// `block` must come from the free list or be a fresh page payload.
    pub(crate) fn set_lab(&mut self, block: Block) {
        debug_assert_eq!(self.lab.size, 0);
        let page = unsafe { NormalPage::from_address(block.address) };
        page.object_start_bitmap().clear_bit(block.address);
        self.lab = LinearAllocationBuffer {
            start: block.address,
            size: block.size,
        };
    }
}

#[derive(Debug, Default)]
pub(crate) struct LargePageSpace {
    pub(crate) pages: Vec<NonNull<LargePage>>,
}

/// All spaces of a heap.
#[derive(Debug)]
pub(crate) struct RawHeap {
    pub(crate) normal: Vec<NormalPageSpace>,
    pub(crate) large: LargePageSpace,
}

impl RawHeap {
    pub(crate) fn new(custom_spaces: usize) -> Self {
        Self {
            normal: (0..REGULAR_SPACES + custom_spaces)
                .map(NormalPageSpace::new)
                .collect(),
            large: LargePageSpace::default(),
        }
    }

    /// Space for an object of `allocation_size` bytes requesting `kind`.
    ///
    /// # Panics
    ///
    /// Panics if `kind` names a custom space the heap was not created with.
    pub(crate) fn space_index(&self, kind: SpaceKind, allocation_size: usize) -> SpaceIndex {
        match kind {
            SpaceKind::Regular => regular_space_for(allocation_size),
            SpaceKind::Custom(custom) => {
                let index = REGULAR_SPACES + custom;
                assert!(
                    index < self.normal.len(),
                    "custom space {custom} is not configured for this heap"
                );
                index
            }
        }
    }

    pub(crate) fn reset_labs(&mut self) {
        for space in &mut self.normal {
            space.reset_lab();
        }
    }

    /// Finds the buffer range of the space owning a normal page.
    pub(crate) fn lab_range(&self, space: SpaceIndex) -> (usize, usize) {
        self.normal
            .get(space)
            .map_or((0, 0), |space| space.lab.range())
    }

    pub(crate) fn normal_page_count(&self) -> usize {
        self.normal.iter().map(|space| space.pages.len()).sum()
    }

    pub(crate) fn free_list_bytes(&self) -> usize {
        self.normal
            .iter()
            .map(|space| space.free_list.free_bytes() + space.lab.size)
            .sum()
    }
}
