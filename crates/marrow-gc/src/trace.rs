//! Trace trait and Visitor for garbage collection.
//!
//! Managed types implement [`Trace`] to report their outgoing references and
//! [`GarbageCollected`] to opt into allocation on a [`Heap`](crate::Heap).
//! Tracing dispatches through [`TraceDescriptor`]s: a payload address paired
//! with the trace callback of its static type, resolved once per type, so the
//! marker can walk arbitrarily typed objects without per-object vtables.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, LinkedList, VecDeque};
use std::hash::BuildHasher;
use std::rc::Rc;
use std::sync::Arc;

use crate::heap::space::SpaceKind;
use crate::member::WeakSlot;

// ============================================================================
// Core Traits
// ============================================================================

/// Traces the object whose payload starts at the given address.
pub type TraceCallback = unsafe fn(&mut dyn Visitor, *const u8);

/// A payload address together with the trace callback of its type.
#[derive(Debug, Clone, Copy)]
pub struct TraceDescriptor {
    /// Start of the managed object's payload.
    pub base_object_payload: *const u8,
    /// Callback reporting the object's references.
    pub callback: TraceCallback,
}

impl TraceDescriptor {
    /// Descriptor for the `T` stored at `payload`.
    #[inline]
    #[must_use]
    pub fn of<T: Trace>(payload: *const T) -> Self {
        Self {
            base_object_payload: payload.cast(),
            callback: trace_callback::<T>,
        }
    }
}

/// Trace callback of `T`.
///
/// # Safety
///
/// `payload` must point to a valid `T`.
pub unsafe fn trace_callback<T: Trace>(visitor: &mut dyn Visitor, payload: *const u8) {
    unsafe { (*payload.cast::<T>()).trace(visitor) };
}

/// A type that can be traced by the garbage collector.
///
/// # Safety
///
/// Implementations **MUST** trace every [`Member`](crate::Member) and
/// [`WeakMember`](crate::WeakMember) reachable from `self`, including those
/// inside nested structs, enums and collections. A missed reference is a
/// use-after-free.
///
/// With concurrent marking, `trace` may run on a background thread while the
/// mutator keeps running. Member fields are read atomically and are safe to
/// trace concurrently; any other interior mutability reached from `trace`
/// (for example a `RefCell<Vec<Member<T>>>`) must not be mutated while a
/// concurrent collection is in progress.
///
/// Prefer `#[derive(Trace)]` over manual implementations.
///
/// ```ignore
/// unsafe impl Trace for Node {
///     fn trace(&self, visitor: &mut dyn Visitor) {
///         self.next.trace(visitor);
///         self.cache.trace(visitor);
///     }
/// }
/// ```
pub unsafe trait Trace {
    /// Reports all references held by `self` to `visitor`.
    fn trace(&self, visitor: &mut dyn Visitor);
}

/// A type that can be allocated on a [`Heap`](crate::Heap).
///
/// Only `GarbageCollected` types can be the target of handles, so
/// `Member<i32>` fails to compile.
pub trait GarbageCollected: Trace + 'static {
    /// Space objects of this type are allocated in.
    const SPACE: SpaceKind = SpaceKind::Regular;
}

/// A visitor that traverses the object graph during garbage collection.
///
/// Users generally do not implement this trait; handles call into it from
/// their [`Trace`] implementations.
pub trait Visitor {
    /// Visits a strong reference.
    fn visit(&mut self, descriptor: TraceDescriptor);

    /// Visits a weak reference stored in `slot`.
    ///
    /// The target is not kept alive; the slot is cleared after marking if
    /// the target was not otherwise reached.
    fn visit_weak(&mut self, descriptor: TraceDescriptor, slot: WeakSlot);
}

// ============================================================================
// Trace implementations for primitive types
// ============================================================================

macro_rules! impl_trace_for_leaves {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: Leaf types contain no managed references
            unsafe impl Trace for $t {
                #[inline]
                fn trace(&self, _visitor: &mut dyn Visitor) {}
            }
        )*
    };
}

impl_trace_for_leaves! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char, (),
    String, str,
    std::time::Duration,
    std::time::Instant,
    std::time::SystemTime,
    std::path::Path,
    std::path::PathBuf,
    std::ffi::OsStr,
    std::ffi::OsString,
    std::ffi::CString,
    std::net::IpAddr,
    std::net::SocketAddr,
    std::sync::atomic::AtomicBool,
    std::sync::atomic::AtomicU32,
    std::sync::atomic::AtomicU64,
    std::sync::atomic::AtomicUsize,
    std::num::NonZeroU32,
    std::num::NonZeroU64,
    std::num::NonZeroUsize,
}

// SAFETY: PhantomData contains no data
unsafe impl<T: ?Sized> Trace for std::marker::PhantomData<T> {
    #[inline]
    fn trace(&self, _visitor: &mut dyn Visitor) {}
}

// ============================================================================
// Trace implementations for std container types
// ============================================================================

// SAFETY: Box traces its contents
unsafe impl<T: Trace + ?Sized> Trace for Box<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        T::trace(self.as_ref(), visitor);
    }
}

// SAFETY: Rc traces its contents
unsafe impl<T: Trace + ?Sized> Trace for Rc<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        T::trace(self.as_ref(), visitor);
    }
}

// SAFETY: Arc traces its contents
unsafe impl<T: Trace + ?Sized> Trace for Arc<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        T::trace(self.as_ref(), visitor);
    }
}

// SAFETY: Vec traces all elements
unsafe impl<T: Trace> Trace for Vec<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: Arrays trace all elements
unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: Slices trace all elements
unsafe impl<T: Trace> Trace for [T] {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: Option traces its contents if Some
unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(inner) = self {
            inner.trace(visitor);
        }
    }
}

// SAFETY: Result traces whichever variant is present
unsafe impl<T: Trace, E: Trace> Trace for Result<T, E> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        match self {
            Ok(v) => v.trace(visitor),
            Err(e) => e.trace(visitor),
        }
    }
}

// SAFETY: Cell<T> traces a copy of its contents
unsafe impl<T: Trace + Copy> Trace for Cell<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.get().trace(visitor);
    }
}

// SAFETY: RefCell traces its contents even while mutably borrowed. Tracing
// happens at a collection point on the mutator thread, where the holder of
// the `RefMut` is suspended and the value is in a consistent state.
unsafe impl<T: Trace + ?Sized> Trace for RefCell<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        match self.try_borrow() {
            Ok(inner) => inner.trace(visitor),
            Err(_) => unsafe { (*self.as_ptr()).trace(visitor) },
        }
    }
}

// SAFETY: VecDeque traces all elements
unsafe impl<T: Trace> Trace for VecDeque<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: LinkedList traces all elements
unsafe impl<T: Trace> Trace for LinkedList<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: HashMap traces keys and values
unsafe impl<K: Trace, V: Trace, S: BuildHasher> Trace for HashMap<K, V, S> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for (k, v) in self {
            k.trace(visitor);
            v.trace(visitor);
        }
    }
}

// SAFETY: HashSet traces all elements
unsafe impl<T: Trace, S: BuildHasher> Trace for HashSet<T, S> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: BTreeMap traces keys and values
unsafe impl<K: Trace, V: Trace> Trace for BTreeMap<K, V> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for (k, v) in self {
            k.trace(visitor);
            v.trace(visitor);
        }
    }
}

// SAFETY: BTreeSet traces all elements
unsafe impl<T: Trace> Trace for BTreeSet<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// ============================================================================
// Trace implementations for tuples
// ============================================================================

macro_rules! impl_trace_for_tuples {
    () => {};
    ($first:ident $(, $rest:ident)*) => {
        // SAFETY: Tuples trace all their elements
        unsafe impl<$first: Trace $(, $rest: Trace)*> Trace for ($first, $($rest,)*) {
            #[inline]
            #[allow(non_snake_case)]
            fn trace(&self, visitor: &mut dyn Visitor) {
                let ($first, $($rest,)*) = self;
                $first.trace(visitor);
                $($rest.trace(visitor);)*
            }
        }
        impl_trace_for_tuples!($($rest),*);
    };
}

impl_trace_for_tuples!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingVisitor {
        strong: usize,
    }

    impl Visitor for CountingVisitor {
        fn visit(&mut self, _descriptor: TraceDescriptor) {
            self.strong += 1;
        }

        fn visit_weak(&mut self, _descriptor: TraceDescriptor, _slot: WeakSlot) {}
    }

    struct Leaf;

    unsafe impl Trace for Leaf {
        fn trace(&self, visitor: &mut dyn Visitor) {
            visitor.visit(TraceDescriptor::of(std::ptr::from_ref(self)));
        }
    }

    #[test]
    fn test_containers_trace_every_element() {
        let mut visitor = CountingVisitor::default();
        let value = (
            vec![Leaf, Leaf],
            Some(Leaf),
            None::<Leaf>,
            [Leaf, Leaf, Leaf],
            Box::new(Leaf),
        );
        value.trace(&mut visitor);
        assert_eq!(visitor.strong, 7);
    }

    #[test]
    fn test_refcell_traced_while_mutably_borrowed() {
        let cell = RefCell::new(vec![Leaf, Leaf]);
        let mut visitor = CountingVisitor::default();
        let guard = cell.borrow_mut();
        cell.trace(&mut visitor);
        drop(guard);
        assert_eq!(visitor.strong, 2);
    }

    #[test]
    fn test_trace_callback_dispatches_to_type() {
        let leaf = Leaf;
        let descriptor = TraceDescriptor::of(&raw const leaf);
        let mut visitor = CountingVisitor::default();
        unsafe { (descriptor.callback)(&mut visitor, descriptor.base_object_payload) };
        assert_eq!(visitor.strong, 1);
    }
}
