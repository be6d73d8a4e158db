//! Per-type collector callbacks.
//!
//! Objects do not carry vtables. Instead each header stores a dense
//! [`GcInfoIndex`] into a process-wide table of `{trace, finalize, name}`
//! triples, registered lazily the first time a type is allocated.

use std::any::TypeId;
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::trace::{trace_callback, GarbageCollected, TraceCallback};

/// Finalizes the object whose payload starts at the given address.
pub type FinalizationCallback = unsafe fn(*mut u8);

/// Dense identifier of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcInfoIndex(pub(crate) u16);

impl GcInfoIndex {
    /// Index reserved for free-list entries and fillers.
    pub const FREE: Self = Self(0);
    /// Largest index that fits in an object header.
    pub const MAX: Self = Self((1 << 14) - 1);

    /// Returns `true` for the free-list index.
    #[inline]
    pub const fn is_free(self) -> bool {
        self.0 == Self::FREE.0
    }

    /// Raw index value.
    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }
}

/// Callbacks registered for one type.
#[derive(Debug, Clone, Copy)]
pub struct GcInfo {
    /// Traces the outgoing references of an object.
    pub trace: TraceCallback,
    /// Runs the destructor, if the type has one.
    pub finalize: Option<FinalizationCallback>,
    /// Type name for diagnostics.
    pub name: &'static str,
}

unsafe fn finalize_callback<T>(payload: *mut u8) {
    unsafe { std::ptr::drop_in_place(payload.cast::<T>()) };
}

#[derive(Default)]
struct TableInner {
    by_type: HashMap<TypeId, GcInfoIndex>,
    // Slot 0 stays empty for `GcInfoIndex::FREE`.
    infos: Vec<Option<GcInfo>>,
}

/// Registry mapping types to their [`GcInfoIndex`].
pub struct GcInfoTable {
    inner: RwLock<TableInner>,
}

impl GcInfoTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                by_type: HashMap::new(),
                infos: vec![None],
            }),
        }
    }

    /// Returns the index for `T`, registering it on first use.
    ///
    /// # Panics
    ///
    /// Panics if more than `GcInfoIndex::MAX` types are registered.
    pub fn index_of<T: GarbageCollected>(&self) -> GcInfoIndex {
        let type_id = TypeId::of::<T>();
        if let Some(index) = self.inner.read().by_type.get(&type_id) {
            return *index;
        }

        let mut inner = self.inner.write();
        if let Some(index) = inner.by_type.get(&type_id) {
            return *index;
        }
        let raw = u16::try_from(inner.infos.len()).unwrap_or(u16::MAX);
        assert!(raw <= GcInfoIndex::MAX.0, "GcInfo table is full");
        let index = GcInfoIndex(raw);
        let finalize = std::mem::needs_drop::<T>()
            .then_some(finalize_callback::<T> as FinalizationCallback);
        inner.infos.push(Some(GcInfo {
            trace: trace_callback::<T>,
            finalize,
            name: std::any::type_name::<T>(),
        }));
        inner.by_type.insert(type_id, index);
        index
    }

    /// Looks up the callbacks for `index`.
    pub fn get(&self, index: GcInfoIndex) -> GcInfo {
        let inner = self.inner.read();
        debug_assert!(
            (index.0 as usize) < inner.infos.len(),
            "GcInfoIndex {index:?} out of range"
        );
        match inner.infos.get(index.0 as usize).copied().flatten() {
            Some(info) => info,
            None => panic!("no GcInfo registered for {index:?}"),
        }
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.inner.read().infos.len() - 1
    }

    /// Returns `true` if no type has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for GcInfoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcInfoTable")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GarbageCollected, Trace, Visitor};

    struct Plain;
    unsafe impl Trace for Plain {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for Plain {}

    struct WithDrop(#[allow(dead_code)] String);
    unsafe impl Trace for WithDrop {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for WithDrop {}

    #[test]
    fn test_registration_is_stable() {
        let table = GcInfoTable::new();
        assert!(table.is_empty());
        let a = table.index_of::<Plain>();
        let b = table.index_of::<WithDrop>();
        assert_ne!(a, b);
        assert_eq!(table.index_of::<Plain>(), a);
        assert_eq!(table.len(), 2);
        assert!(!a.is_free());
    }

    #[test]
    fn test_finalizer_only_for_drop_types() {
        let table = GcInfoTable::new();
        let plain = table.get(table.index_of::<Plain>());
        let dropping = table.get(table.index_of::<WithDrop>());
        assert!(plain.finalize.is_none());
        assert!(dropping.finalize.is_some());
        assert!(dropping.name.ends_with("WithDrop"));
    }
}
