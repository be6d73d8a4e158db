//! Hooks for deterministic tests of embedders.
//!
//! Nothing here is needed in production. The helpers let a test pin the
//! stack-scan policy, drive an incremental cycle step by step, and inspect
//! header bits.

pub use crate::gc::OverrideStackStateScope;

use crate::gc::{GcConfig, MarkingType, StackState};
use crate::heap::base::HeapHandle;
use crate::heap::header::HeapObjectHeader;
use crate::marking::marker::{MarkerState, MarkingLimits};
use crate::ptr::GcPtr;
use crate::trace::GarbageCollected;

/// Drives the collection cycle of a heap by hand.
///
/// Tasks posted to the platform still run when the embedder pumps its
/// message loop; tests that want full control should not pump it while a
/// cycle is in progress.
#[derive(Debug, Clone, Copy)]
pub struct StandaloneTestingHeap<'a> {
    heap: &'a HeapHandle,
}

impl<'a> StandaloneTestingHeap<'a> {
    /// Wraps `heap`.
    #[must_use]
    pub const fn new(heap: &'a HeapHandle) -> Self {
        Self { heap }
    }

    /// Starts an incremental cycle with `config`. Atomic marking types are
    /// upgraded to incremental marking.
    pub fn start_garbage_collection(&self, config: GcConfig) {
        let config = GcConfig {
            marking_type: config.marking_type.max(MarkingType::Incremental),
            ..config
        };
        self.heap.start_incremental_garbage_collection(config);
    }

    /// Runs one marking step. Returns `true` once marking has no work left.
    pub fn perform_marking_step(&self, limits: MarkingLimits) -> bool {
        self.heap.perform_marking_step(limits)
    }

    /// Runs the atomic pause of the current cycle.
    pub fn finalize_garbage_collection(&self, stack_state: StackState) {
        self.heap
            .finalize_incremental_garbage_collection_if_running(stack_state);
    }

    /// Sweeps all pages still pending.
    pub fn finish_sweeping(&self) {
        self.heap.finish_sweeping();
    }
}

/// Returns `true` if `object` survived a collection of a generational heap.
#[must_use]
pub fn is_heap_object_old<T: GarbageCollected>(object: GcPtr<T>) -> bool {
    !object.header().is_young()
}

/// Returns `true` if the mark bit of `object` is set.
#[must_use]
pub fn is_marked<T: GarbageCollected>(object: GcPtr<T>) -> bool {
    object.header().is_marked()
}

/// Write barrier slow-path calls recorded on `heap` since its current or
/// last cycle started.
#[must_use]
pub fn barrier_slow_path_hits(heap: &HeapHandle) -> usize {
    heap.barrier_hits.get()
}

/// State of the marker of `heap`. `NotStarted` outside of marking.
#[must_use]
pub fn marker_state(heap: &HeapHandle) -> MarkerState {
    heap.marker
        .try_borrow()
        .ok()
        .and_then(|marker| marker.as_ref().map(crate::marking::marker::Marker::state))
        .unwrap_or(if heap.is_in_atomic_pause() {
            MarkerState::ProcessingWeakness
        } else {
            MarkerState::NotStarted
        })
}

/// Header of the object of `heap` that contains `address`, if any.
#[must_use]
pub fn try_object_header_from_inner_address(
    heap: &HeapHandle,
    address: usize,
) -> Option<&HeapObjectHeader> {
    heap.find_header(address).map(|(_, header)| header)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::heap::allocator::make_garbage_collected;
    use crate::heap::base::{Heap, HeapOptions};
    use crate::persistent::Persistent;
    use crate::platform::DefaultPlatform;
    use crate::process::{initialize_process, ProcessConfig};
    use crate::trace::{Trace, Visitor};

    struct Leaf(u32);

    unsafe impl Trace for Leaf {
        fn trace(&self, _visitor: &mut dyn Visitor) {}
    }
    impl GarbageCollected for Leaf {}

    fn heap() -> Heap {
        initialize_process(ProcessConfig::default());
        Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default())
    }

    #[test]
    fn test_stepwise_cycle() {
        let heap = heap();
        let _stack = OverrideStackStateScope::new(&heap, StackState::NoHeapPointers);
        let root = Persistent::new(make_garbage_collected(heap.allocation_handle(), Leaf(1)));
        let testing = StandaloneTestingHeap::new(&heap);

        testing.start_garbage_collection(GcConfig::precise_incremental());
        assert_eq!(marker_state(&heap), MarkerState::Marking);
        let leaf = root.get().map(is_marked);
        assert_eq!(leaf, Some(true));

        while !testing.perform_marking_step(MarkingLimits::with_max_bytes(64)) {}
        testing.finalize_garbage_collection(StackState::NoHeapPointers);
        testing.finish_sweeping();
        assert_eq!(marker_state(&heap), MarkerState::NotStarted);
        assert_eq!(root.get().map(|leaf| leaf.0), Some(1));
    }

    #[test]
    fn test_inner_address_lookup() {
        let heap = heap();
        let leaf = make_garbage_collected(heap.allocation_handle(), Leaf(5));
        let inner = leaf.as_ptr() as usize + 2;
        let header = try_object_header_from_inner_address(&heap, inner);
        assert_eq!(header.map(HeapObjectHeader::payload), Some(leaf.as_ptr().cast()));
        assert!(try_object_header_from_inner_address(&heap, 0x10).is_none());
    }
}
