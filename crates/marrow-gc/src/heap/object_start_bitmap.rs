//! Object-start bitmap for interior pointer lookup on normal pages.
//!
//! One bit per allocation granule records where a header begins. Bits are set
//! for live objects and free-list entries alike, so the payload of a page is
//! covered without gaps and the closest set bit at or below any address names
//! the header owning that address. The linear allocation buffer is the only
//! range without bits.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::{ALLOCATION_GRANULARITY, PAGE_SIZE};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Number of words needed to cover a full page.
pub(crate) const BITMAP_WORDS: usize = PAGE_SIZE / ALLOCATION_GRANULARITY / BITS_PER_WORD;

/// Bitmap covering one normal page, indexed by granule offset from the page
/// base.
#[derive(Debug)]
pub struct ObjectStartBitmap {
    base: usize,
    words: [AtomicU64; BITMAP_WORDS],
}

impl ObjectStartBitmap {
    /// Initializes a bitmap for the page at `base` in place.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes and the memory it points to must be
    /// zeroed, which is how fresh or recycled pages are handed out.
    pub(crate) unsafe fn init_in_place(this: *mut Self, base: usize) {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        unsafe { std::ptr::addr_of_mut!((*this).base).write(base) };
    }

    #[inline]
    fn index(&self, address: usize) -> (usize, u32) {
        debug_assert!(address >= self.base && address < self.base + PAGE_SIZE);
        let granule = (address - self.base) / ALLOCATION_GRANULARITY;
        (granule / BITS_PER_WORD, (granule % BITS_PER_WORD) as u32)
    }

    /// Records a header starting at `header`.
    #[inline]
    pub fn set_bit(&self, header: usize) {
        let (word, bit) = self.index(header);
        self.words[word].fetch_or(1 << bit, Ordering::Relaxed);
    }

    /// Forgets a header starting at `header`.
    #[inline]
    pub fn clear_bit(&self, header: usize) {
        let (word, bit) = self.index(header);
        self.words[word].fetch_and(!(1 << bit), Ordering::Relaxed);
    }

    /// Returns `true` if a header starts at `header`.
    #[inline]
    pub fn check_bit(&self, header: usize) -> bool {
        let (word, bit) = self.index(header);
        self.words[word].load(Ordering::Relaxed) & (1 << bit) != 0
    }

    /// Clears the whole bitmap.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Returns the address of the closest header at or below `address`.
    pub fn find_header(&self, address: usize) -> Option<usize> {
        let (mut word, bit) = self.index(address);
        // Keep bits 0..=bit of the starting word.
        let mask = if bit == 63 {
            u64::MAX
        } else {
            (1u64 << (bit + 1)) - 1
        };
        let mut bits = self.words[word].load(Ordering::Relaxed) & mask;
        while bits == 0 {
            if word == 0 {
                return None;
            }
            word -= 1;
            bits = self.words[word].load(Ordering::Relaxed);
        }
        let highest = BITS_PER_WORD - 1 - bits.leading_zeros() as usize;
        Some(self.base + (word * BITS_PER_WORD + highest) * ALLOCATION_GRANULARITY)
    }
}
