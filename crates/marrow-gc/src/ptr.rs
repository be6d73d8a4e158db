//! Raw handles to managed objects.

use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::heap::header::HeapObjectHeader;
use crate::trace::GarbageCollected;

/// An unrooted pointer to a managed object.
///
/// `GcPtr` is what allocation returns. It does not keep its target alive by
/// itself: the object survives a collection only while it is reachable from
/// a [`Persistent`](crate::Persistent), from another live object through a
/// [`Member`](crate::Member), or, for collections that scan the stack
/// conservatively, from a `GcPtr` held on the mutator's stack.
///
/// `GcPtr` is `!Send` and `!Sync`; managed objects belong to the thread of
/// their heap.
pub struct GcPtr<T: GarbageCollected> {
    ptr: NonNull<T>,
}

impl<T: GarbageCollected> GcPtr<T> {
    /// Wraps a payload pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of a live managed `T`.
    #[inline]
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self { ptr }
    }

    /// Returns the payload pointer.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Returns the payload pointer.
    #[inline]
    #[must_use]
    pub const fn as_non_null(self) -> NonNull<T> {
        self.ptr
    }

    /// Header of the object.
    #[inline]
    #[must_use]
    pub fn header<'a>(self) -> &'a HeapObjectHeader {
        unsafe { HeapObjectHeader::from_payload(self.ptr.as_ptr().cast()) }
    }

    /// Bytes reserved after `T` in the same allocation, see
    /// [`make_garbage_collected_with_additional_bytes`](crate::make_garbage_collected_with_additional_bytes).
    ///
    /// The slice may be longer than requested due to allocation rounding.
    #[must_use]
    pub fn trailing_storage(self) -> NonNull<[u8]> {
        let size = std::mem::size_of::<T>();
        let len = self.header().object_size().saturating_sub(size);
        let start = unsafe { self.ptr.cast::<u8>().add(size) };
        NonNull::slice_from_raw_parts(start, len)
    }

    /// Returns `true` if both pointers refer to the same object.
    #[inline]
    #[must_use]
    pub fn ptr_eq(this: Self, other: Self) -> bool {
        this.ptr == other.ptr
    }
}

impl<T: GarbageCollected> Clone for GcPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GarbageCollected> Copy for GcPtr<T> {}

impl<T: GarbageCollected> Deref for GcPtr<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: GcPtr is only created for constructed, live objects.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: GarbageCollected> PartialEq for GcPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: GarbageCollected> Eq for GcPtr<T> {}

impl<T: GarbageCollected> std::hash::Hash for GcPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T: GarbageCollected> fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GcPtr").field(&self.ptr).finish()
    }
}

impl<T: GarbageCollected> fmt::Pointer for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}
