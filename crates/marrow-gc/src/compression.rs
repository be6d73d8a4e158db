//! 32-bit compressed references into the caged heap.
//!
//! Every managed address shares its upper 32 bits with the cage base, and
//! payloads are 8 byte aligned, so an address fits in 32 bits after dropping
//! its lowest bit. The top bit of the compressed value tags regular pointers;
//! null and the sentinel stay small and never carry the tag:
//!
//! ```text
//! null      -> 0x0000_0000
//! sentinel  -> 0x0000_0001
//! pointer p -> 0x8000_0000 | (p >> 1) as u32
//! ```
//!
//! Decompression sign-extends, shifts back and masks with the cage base, so
//! the tag bit turns into all-ones upper bits that the mask replaces with the
//! base. It is valid only on threads that published a cage base.

#[cfg(all(feature = "pointer-compression", not(target_pointer_width = "64")))]
compile_error!("pointer-compression requires a 64-bit target");

use crate::heap::cage::current_cage_base;

/// Raw value of the sentinel pointer when references are compressed.
pub const COMPRESSED_SENTINEL_POINTER: usize = 0b10;

const REGULAR_TAG: u32 = 0x8000_0000;

/// Compresses `address` to 32 bits.
///
/// `address` must be zero, the sentinel, or an 8 byte aligned address inside
/// a cage aligned to 4 GiB.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn compress(address: usize) -> u32 {
    match address {
        0 => 0,
        COMPRESSED_SENTINEL_POINTER => 1,
        _ => ((address >> 1) as u32) | REGULAR_TAG,
    }
}

/// Decompresses `value` against `base`.
#[inline]
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
pub const fn decompress_with_base(value: u32, base: usize) -> usize {
    let extended = value as i32 as i64 as u64;
    ((extended << 1) & (base as u64 | 0xFFFF_FFFF)) as usize
}

/// Decompresses `value` against the cage base of the current thread.
///
/// Regular values need a published cage base; this is checked in debug
/// builds.
#[inline]
#[must_use]
pub fn decompress(value: u32) -> usize {
    let base = current_cage_base();
    debug_assert!(
        base != 0 || value & REGULAR_TAG == 0,
        "decompression without a cage base on this thread"
    );
    decompress_with_base(value, base)
}


#[cfg(all(test, feature = "pointer-compression"))]
mod caged_tests {
    use std::cell::Cell;
    use std::hint::black_box;
    use std::rc::Rc;

    use super::*;
    use crate::gc::GcConfig;
    use crate::heap::allocator::make_garbage_collected;
    use crate::heap::base::{Heap, HeapOptions};
    use crate::heap::cage::CAGE_SIZE;
    use crate::member::Member;
    use crate::persistent::Persistent;
    use crate::platform::DefaultPlatform;
    use crate::process::{initialize_process, ProcessConfig};
    use crate::trace::{GarbageCollected, Trace, Visitor};

    struct Counted {
        drops: Rc<Cell<usize>>,
    }

    unsafe impl Trace for Counted {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for Counted {}

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    struct Holder {
        child: Member<Counted>,
    }

    unsafe impl Trace for Holder {
        fn trace(&self, visitor: &mut dyn Visitor) {
            self.child.trace(visitor);
        }
    }
    impl GarbageCollected for Holder {}

    fn heap() -> Heap {
        initialize_process(ProcessConfig::default());
        Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default())
    }

    #[inline(never)]
    fn allocate_behind_compressed_reference(heap: &Heap, drops: &Rc<Cell<usize>>) -> u32 {
        let object = make_garbage_collected(
            heap.allocation_handle(),
            Counted {
                drops: Rc::clone(drops),
            },
        );
        compress(object.as_ptr() as usize)
    }

    #[test]
    fn test_members_round_trip_through_the_cage() {
        let heap = heap();
        let base = current_cage_base();
        assert_ne!(base, 0);
        assert_eq!(std::mem::size_of::<Member<Counted>>(), 4);

        let drops = Rc::new(Cell::new(0));
        let child = make_garbage_collected(
            heap.allocation_handle(),
            Counted {
                drops: Rc::clone(&drops),
            },
        );
        let address = child.as_ptr() as usize;
        assert!(address > base && address - base < CAGE_SIZE);

        let holder = Persistent::new(make_garbage_collected(
            heap.allocation_handle(),
            Holder {
                child: Member::new(child),
            },
        ));
        let stored = |holder: &Persistent<Holder>| {
            holder
                .get()
                .and_then(|holder| holder.child.get())
                .map(|child| child.as_ptr() as usize)
        };
        assert_eq!(stored(&holder), Some(address));

        heap.collect_garbage(GcConfig::precise_atomic());
        heap.finish_sweeping();

        assert_eq!(drops.get(), 0);
        assert_eq!(stored(&holder), Some(address));
    }

    #[test]
    fn test_conservative_scan_finds_compressed_half_words() {
        let heap = heap();
        let drops = Rc::new(Cell::new(0));
        let hidden = black_box(allocate_behind_compressed_reference(&heap, &drops));

        heap.collect_garbage(GcConfig::conservative_atomic());
        heap.finish_sweeping();

        let address = decompress(black_box(hidden));
        assert!(heap.is_object_alive(address as *const Counted));
        assert_eq!(drops.get(), 0);
    }
}
