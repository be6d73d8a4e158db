//! Write barriers.
//!
//! Every assignment through [`Member::set`](crate::Member::set) runs
//! [`member_write_barrier`]. In the steady state both barriers are a single
//! relaxed load of a process-wide counter:
//!
//! - the Dijkstra marking barrier marks the stored value while any heap of
//!   the process is marking incrementally or concurrently, so that no black
//!   object ever references a white one;
//! - the generational barrier records old-to-young slots while any heap of
//!   the process has generational collection enabled.
//!
//! Heaps are found through the page of the stored value; the slow paths only
//! touch heaps that are actually marking or generational.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::base::HeapHandle;
use crate::heap::header::HeapObjectHeader;
use crate::heap::page::BasePage;
use crate::marking::visitor::{mark_and_push, MarkingVisitor};
use crate::ptr::GcPtr;
use crate::trace::{GarbageCollected, Trace};

static MARKING_COUNTER: AtomicUsize = AtomicUsize::new(0);
static GENERATIONAL_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Returns `true` while any heap of the process is marking incrementally or
/// concurrently.
#[inline]
#[must_use]
pub fn is_any_incremental_or_concurrent_marking() -> bool {
    MARKING_COUNTER.load(Ordering::Relaxed) > 0
}

pub(crate) fn enter_incremental_marking() {
    MARKING_COUNTER.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn leave_incremental_marking() {
    let previous = MARKING_COUNTER.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(previous > 0, "unbalanced marking counter");
}

pub(crate) fn enable_generational() {
    GENERATIONAL_COUNTER.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn disable_generational() {
    GENERATIONAL_COUNTER.fetch_sub(1, Ordering::Relaxed);
}

#[inline]
fn is_any_generational() -> bool {
    GENERATIONAL_COUNTER.load(Ordering::Relaxed) > 0
}

/// Barrier run after `value` was stored into the member at `slot`.
///
/// `value` is neither null nor the sentinel.
#[inline]
pub(crate) fn member_write_barrier(slot: usize, value: usize, weak: bool) {
    if is_any_incremental_or_concurrent_marking() {
        dijkstra_marking_barrier_slow(value);
    }
    if is_any_generational() {
        generational_barrier_slow(slot, value, weak);
    }
}

fn heap_of<'a>(payload: *const u8) -> &'a HeapHandle {
    // SAFETY: barriers only see payloads of live objects, whose heap is alive.
    unsafe { BasePage::from_payload(payload).heap() }
}

#[cold]
#[inline(never)]
fn dijkstra_marking_barrier_slow(value: usize) {
    let payload = value as *const u8;
    let heap = heap_of(payload);
    if !heap.is_incremental_marking() {
        return;
    }
    heap.record_barrier_slow_path();
    let header = unsafe { HeapObjectHeader::from_payload(payload) };
    let callback = heap.gc_info().get(header.gc_info_index()).trace;
    mark_and_push(heap.worklists(), payload, callback);
}

#[cold]
#[inline(never)]
fn generational_barrier_slow(slot: usize, value: usize, weak: bool) {
    let payload = value as *const u8;
    let heap = heap_of(payload);
    if !heap.is_generational() {
        return;
    }
    let header = unsafe { HeapObjectHeader::from_payload(payload) };
    if !header.is_young() {
        return;
    }
    heap.remember_slot(slot, weak);
}

/// Re-traces `object` if marking already processed it.
///
/// Use after mutating an object's references in a way that bypasses
/// [`Member::set`](crate::Member::set), for example by pushing members into
/// a `RefCell<Vec<Member<T>>>`.
pub fn steele_marking_barrier<T: GarbageCollected>(object: GcPtr<T>) {
    if !is_any_incremental_or_concurrent_marking() {
        return;
    }
    let payload = object.as_ptr().cast::<u8>();
    let heap = heap_of(payload);
    if !heap.is_incremental_marking() {
        return;
    }
    heap.record_barrier_slow_path();
    if object.header().is_marked() {
        heap.worklists().retrace.push(payload as usize);
    }
}

/// Applies the marking barrier to every element of `elements`.
///
/// Use after bulk-writing references into an array-like container owned by
/// an object of `heap`.
pub fn dijkstra_marking_barrier_range<E: Trace>(heap: &HeapHandle, elements: &[E]) {
    if !is_any_incremental_or_concurrent_marking() || !heap.is_incremental_marking() {
        return;
    }
    heap.record_barrier_slow_path();
    let mut visitor = MarkingVisitor::new(heap.worklists(), heap.gc_info());
    for element in elements {
        element.trace(&mut visitor);
    }
}

/// Records `object` for re-tracing by the next minor collection.
///
/// The generational counterpart of [`steele_marking_barrier`]: use it when
/// references to young objects are written into an old object without
/// going through [`Member::set`](crate::Member::set).
pub fn generational_barrier_for_source_object<T: GarbageCollected>(object: GcPtr<T>) {
    if !is_any_generational() {
        return;
    }
    let payload = object.as_ptr().cast::<u8>();
    let heap = heap_of(payload);
    if heap.is_generational() && !object.header().is_young() {
        heap.remember_source_object(payload as usize);
    }
}
