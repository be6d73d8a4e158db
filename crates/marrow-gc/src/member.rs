//! Heap-to-heap references.
//!
//! [`Member`], [`WeakMember`] and [`UntracedMember`] are fields of managed
//! objects. They are all [`BasicMember`] with a different [`MemberKind`]:
//!
//! | kind | traced | keeps target alive | write barrier |
//! |---|---|---|---|
//! | [`Strong`] | yes | yes | yes |
//! | [`Weak`] | yes | no, cleared after marking | yes |
//! | [`Untraced`] | no | no | no |
//!
//! Members never extend a lifetime through reference counting: the target
//! stays alive only while it is reachable when a collection marks the heap.
//! Storage is a native pointer, or a 32-bit compressed reference with the
//! `pointer-compression` feature. All accesses are relaxed atomics so that
//! concurrent markers may read a slot while the mutator writes it.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::marking::write_barrier;
use crate::ptr::GcPtr;
use crate::trace::{GarbageCollected, Trace, TraceDescriptor, Visitor};

/// Raw value of the sentinel pointer.
///
/// The sentinel is a non-null marker value that is never dereferenced,
/// traced or cleared by weak processing.
pub const SENTINEL_POINTER: usize = if cfg!(feature = "pointer-compression") {
    crate::compression::COMPRESSED_SENTINEL_POINTER
} else {
    0b1
};

// ============================================================================
// Raw storage
// ============================================================================

#[cfg(not(feature = "pointer-compression"))]
mod storage {
    use std::sync::atomic::{AtomicPtr, Ordering};

    #[repr(transparent)]
    #[derive(Debug)]
    pub struct RawStorage(AtomicPtr<u8>);

    impl RawStorage {
        #[inline]
        pub const fn new(address: usize) -> Self {
            Self(AtomicPtr::new(address as *mut u8))
        }

        #[inline]
        pub fn load(&self) -> usize {
            self.0.load(Ordering::Relaxed) as usize
        }

        #[inline]
        pub fn store(&self, address: usize) {
            self.0.store(address as *mut u8, Ordering::Relaxed);
        }

        #[inline]
        pub fn swap(&self, address: usize) -> usize {
            self.0.swap(address as *mut u8, Ordering::Relaxed) as usize
        }
    }
}

#[cfg(feature = "pointer-compression")]
mod storage {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::compression::{compress, decompress};

    #[repr(transparent)]
    #[derive(Debug)]
    pub struct RawStorage(AtomicU32);

    impl RawStorage {
        #[inline]
        pub const fn new(address: usize) -> Self {
            Self(AtomicU32::new(compress(address)))
        }

        #[inline]
        pub fn load(&self) -> usize {
            decompress(self.0.load(Ordering::Relaxed))
        }

        #[inline]
        pub fn store(&self, address: usize) {
            self.0.store(compress(address), Ordering::Relaxed);
        }

        #[inline]
        pub fn swap(&self, address: usize) -> usize {
            decompress(self.0.swap(compress(address), Ordering::Relaxed))
        }
    }
}

pub(crate) use storage::RawStorage;

#[inline]
pub(crate) const fn is_object(address: usize) -> bool {
    address != 0 && address != SENTINEL_POINTER
}

/// Location of a weak reference, handed to [`Visitor::visit_weak`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakSlot(NonNull<RawStorage>);

impl WeakSlot {
    pub(crate) fn from_storage(storage: &RawStorage) -> Self {
        Self(NonNull::from(storage))
    }

    /// Address of the slot.
    #[must_use]
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    ///
    /// The object holding the slot must be alive.
    pub(crate) unsafe fn storage<'a>(self) -> &'a RawStorage {
        unsafe { self.0.as_ref() }
    }
}

// ============================================================================
// Kinds
// ============================================================================

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Tagging trait selecting the semantics of a [`BasicMember`].
pub trait MemberKind: sealed::Sealed + 'static {
    /// Whether writes go through the write barrier.
    const HAS_BARRIER: bool;
    /// Whether the reference is weak.
    const IS_WEAK: bool;

    #[doc(hidden)]
    fn trace_slot(slot: WeakSlot, descriptor: TraceDescriptor, visitor: &mut dyn Visitor);
}

/// Tag of [`Member`].
#[derive(Debug)]
pub enum Strong {}

/// Tag of [`WeakMember`].
#[derive(Debug)]
pub enum Weak {}

/// Tag of [`UntracedMember`].
#[derive(Debug)]
pub enum Untraced {}

impl sealed::Sealed for Strong {}
impl sealed::Sealed for Weak {}
impl sealed::Sealed for Untraced {}

impl MemberKind for Strong {
    const HAS_BARRIER: bool = true;
    const IS_WEAK: bool = false;

    #[inline]
    fn trace_slot(_slot: WeakSlot, descriptor: TraceDescriptor, visitor: &mut dyn Visitor) {
        visitor.visit(descriptor);
    }
}

impl MemberKind for Weak {
    const HAS_BARRIER: bool = true;
    const IS_WEAK: bool = true;

    #[inline]
    fn trace_slot(slot: WeakSlot, descriptor: TraceDescriptor, visitor: &mut dyn Visitor) {
        visitor.visit_weak(descriptor, slot);
    }
}

impl MemberKind for Untraced {
    const HAS_BARRIER: bool = false;
    const IS_WEAK: bool = false;

    #[inline]
    fn trace_slot(_slot: WeakSlot, _descriptor: TraceDescriptor, _visitor: &mut dyn Visitor) {}
}

// ============================================================================
// BasicMember
// ============================================================================

/// A reference field of a managed object.
///
/// Construction is an initializing write and skips the write barrier;
/// [`set`](Self::set) is an assignment and runs it. Members are meant to live
/// inside managed objects; a member on the stack or in Rust-owned memory is
/// not a root.
#[repr(transparent)]
pub struct BasicMember<T: GarbageCollected, K: MemberKind> {
    storage: RawStorage,
    _marker: PhantomData<(*const T, K)>,
}

/// A strong reference between managed objects.
pub type Member<T> = BasicMember<T, Strong>;

/// A weak reference between managed objects.
pub type WeakMember<T> = BasicMember<T, Weak>;

/// A reference invisible to the collector.
pub type UntracedMember<T> = BasicMember<T, Untraced>;

impl<T: GarbageCollected, K: MemberKind> BasicMember<T, K> {
    /// Creates a member pointing at `value`.
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<Option<GcPtr<T>>>) -> Self {
        let address = value.into().map_or(0, |ptr| ptr.as_ptr() as usize);
        Self::from_raw_address(address)
    }

    /// Creates an empty member.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self::from_raw_address(0)
    }

    /// Creates a member holding the sentinel.
    #[inline]
    #[must_use]
    pub const fn sentinel() -> Self {
        Self::from_raw_address(SENTINEL_POINTER)
    }

    #[inline]
    pub(crate) const fn from_raw_address(address: usize) -> Self {
        Self {
            storage: RawStorage::new(address),
            _marker: PhantomData,
        }
    }

    /// Returns the target, or `None` for null and the sentinel.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<GcPtr<T>> {
        let address = self.storage.load();
        if is_object(address) {
            // SAFETY: non-null, non-sentinel values are payloads of live `T`s.
            Some(unsafe { GcPtr::from_raw(NonNull::new_unchecked(address as *mut T)) })
        } else {
            None
        }
    }

    /// Raw stored address, including the sentinel.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> *const T {
        self.storage.load() as *const T
    }

    /// Assigns `value`, running the write barrier.
    #[inline]
    pub fn set(&self, value: impl Into<Option<GcPtr<T>>>) {
        let address = value.into().map_or(0, |ptr| ptr.as_ptr() as usize);
        self.assign(address);
    }

    /// Assigns the sentinel.
    #[inline]
    pub fn set_sentinel(&self) {
        self.assign(SENTINEL_POINTER);
    }

    /// Assigns `value` without running the write barrier.
    ///
    /// # Safety
    ///
    /// Skipping the barrier while a collection is marking may let the
    /// collector miss `value`. The caller must guarantee that no marking is
    /// in progress or that `value` is otherwise kept alive.
    #[inline]
    pub unsafe fn set_without_barrier(&self, value: Option<GcPtr<T>>) {
        self.storage
            .store(value.map_or(0, |ptr| ptr.as_ptr() as usize));
    }

    #[inline]
    fn assign(&self, address: usize) {
        self.storage.store(address);
        if K::HAS_BARRIER && is_object(address) {
            write_barrier::member_write_barrier(self.slot_address(), address, K::IS_WEAK);
        }
    }

    /// Empties the member. Clearing never needs a barrier.
    #[inline]
    pub fn clear(&self) {
        self.storage.store(0);
    }

    /// Empties the member and returns its previous target.
    ///
    /// A second call returns `None`.
    #[inline]
    pub fn release(&self) -> Option<GcPtr<T>> {
        let address = self.storage.swap(0);
        if is_object(address) {
            Some(unsafe { GcPtr::from_raw(NonNull::new_unchecked(address as *mut T)) })
        } else {
            None
        }
    }

    /// Returns `true` if the member is empty.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.storage.load() == 0
    }

    /// Returns `true` if the member holds the sentinel.
    #[inline]
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.storage.load() == SENTINEL_POINTER
    }

    #[inline]
    fn slot_address(&self) -> usize {
        std::ptr::from_ref(&self.storage) as usize
    }
}

// SAFETY: traced kinds report their target with the slot they live in
unsafe impl<T: GarbageCollected, K: MemberKind> Trace for BasicMember<T, K> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        let address = self.storage.load();
        if is_object(address) {
            K::trace_slot(
                WeakSlot::from_storage(&self.storage),
                TraceDescriptor::of(address as *const T),
                visitor,
            );
        }
    }
}

impl<T: GarbageCollected, K: MemberKind> Default for BasicMember<T, K> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: GarbageCollected, K: MemberKind> Clone for BasicMember<T, K> {
    /// Copies the raw value into a fresh member. Like construction this is
    /// an initializing write.
    fn clone(&self) -> Self {
        Self::from_raw_address(self.storage.load())
    }
}

impl<T: GarbageCollected, K: MemberKind> From<GcPtr<T>> for BasicMember<T, K> {
    fn from(value: GcPtr<T>) -> Self {
        Self::new(value)
    }
}

impl<T: GarbageCollected, K: MemberKind, L: MemberKind> PartialEq<BasicMember<T, L>>
    for BasicMember<T, K>
{
    fn eq(&self, other: &BasicMember<T, L>) -> bool {
        self.storage.load() == other.storage.load()
    }
}

impl<T: GarbageCollected, K: MemberKind> PartialEq<GcPtr<T>> for BasicMember<T, K> {
    fn eq(&self, other: &GcPtr<T>) -> bool {
        self.storage.load() == other.as_ptr() as usize
    }
}

impl<T: GarbageCollected, K: MemberKind> fmt::Debug for BasicMember<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.storage.load();
        match address {
            0 => f.write_str("Member(null)"),
            SENTINEL_POINTER => f.write_str("Member(sentinel)"),
            _ => write!(f, "Member({address:#x})"),
        }
    }
}
