//! The marker state machine.
//!
//! ```text
//! NotStarted --start_marking--> Marking --finish_marking--> ProcessingWeakness --> Done
//!                                  |  ^
//!                                  +--+ advance_marking_with_limits
//! ```
//!
//! Atomic cycles go straight from `start_marking` to `finish_marking`.
//! Incremental cycles visit the roots when they start, run bounded steps on
//! the heap's thread, optionally spawn concurrent markers, and revisit the
//! roots in the final pause. Every object that became reachable in between
//! was greyed by the write barrier.

use std::time::{Duration, Instant};

use crate::gc::{CollectionType, GcConfig, MarkingType, StackState};
use crate::heap::base::HeapHandle;
use crate::heap::header::HeapObjectHeader;
use crate::marking::concurrent::ConcurrentMarker;
use crate::marking::visitor::MarkingVisitor;
use crate::marking::worklists::{MarkingItem, MarkingWorklists};
use crate::marking::write_barrier;
use crate::member::{is_object, RawStorage, WeakSlot};
use crate::tracing::internal::{log_incremental_step, log_phase_end, trace_phase};
use crate::tracing::GcPhase;

// Items processed between two deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 64;

/// State of a heap's marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// No cycle is marking.
    NotStarted,
    /// Tracing the object graph.
    Marking,
    /// Clearing weak references in the atomic pause.
    ProcessingWeakness,
    /// Marking is complete; sweeping may still be pending.
    Done,
}

/// Bounds of one incremental marking step.
///
/// Limits only bound how much work a step does. A started cycle always runs
/// to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkingLimits {
    /// Stop once this instant passed.
    pub deadline: Option<Instant>,
    /// Stop once this many bytes were traced by the step.
    pub max_bytes: Option<usize>,
}

impl MarkingLimits {
    /// No limits: the step drains all available work.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            deadline: None,
            max_bytes: None,
        }
    }

    /// A step of at most `duration`.
    #[must_use]
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + duration),
            max_bytes: None,
        }
    }

    /// A step tracing at most `bytes`.
    #[must_use]
    pub const fn with_max_bytes(bytes: usize) -> Self {
        Self {
            deadline: None,
            max_bytes: Some(bytes),
        }
    }

    fn bytes_exceeded(&self, traced: usize) -> bool {
        self.max_bytes.is_some_and(|max| traced >= max)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Marker of one cycle.
#[derive(Debug)]
pub(crate) struct Marker {
    config: GcConfig,
    state: MarkerState,
    concurrent: Option<ConcurrentMarker>,
    steps: usize,
}

impl Marker {
    pub(crate) const fn new(config: GcConfig) -> Self {
        Self {
            config,
            state: MarkerState::NotStarted,
            concurrent: None,
            steps: 0,
        }
    }

    pub(crate) const fn config(&self) -> GcConfig {
        self.config
    }

    pub(crate) const fn state(&self) -> MarkerState {
        self.state
    }

    pub(crate) const fn steps(&self) -> usize {
        self.steps
    }

    const fn is_incremental(&self) -> bool {
        !matches!(self.config.marking_type, MarkingType::Atomic)
    }

    pub(crate) fn start_marking(&mut self, heap: &HeapHandle) {
        debug_assert_eq!(self.state, MarkerState::NotStarted);
        heap.worklists.clear();
        self.clear_marks(heap);

        self.state = MarkerState::Marking;
        heap.marking.set(true);
        if !self.is_incremental() {
            return;
        }

        let started = Instant::now();
        let _span = trace_phase(GcPhase::Mark);
        write_barrier::enter_incremental_marking();
        heap.incremental_marking.set(true);
        {
            let mut visitor = MarkingVisitor::new(&heap.worklists, heap.gc_info());
            visit_roots(heap, &mut visitor);
        }
        if self.config.marking_type == MarkingType::IncrementalAndConcurrent {
            self.concurrent = ConcurrentMarker::start(heap, heap.options.concurrent_marking_tasks);
        }
        record_mark_time(heap, started.elapsed());
    }

    /// Resets mark bits kept by a generational heap between cycles.
    fn clear_marks(&self, heap: &HeapHandle) {
        if !heap.is_generational() || self.config.collection_type != CollectionType::Major {
            return;
        }
        let started = Instant::now();
        let _span = trace_phase(GcPhase::Clear);
        let mut raw = heap.raw_heap.borrow_mut();
        raw.reset_labs();
        let mut unmarked = 0;
        for space in &raw.normal {
            for page in &space.pages {
                unsafe { page.as_ref() }.for_each_header(|header| {
                    if !header.is_free() {
                        header.unmark();
                        unmarked += header.allocated_size();
                    }
                });
            }
        }
        for page in &raw.large.pages {
            unsafe { page.as_ref() }.header().unmark();
        }
        drop(raw);
        log_phase_end(GcPhase::Clear, unmarked);
        if let Some(cycle) = heap.cycle.borrow_mut().as_mut() {
            cycle.metrics.clear_duration = started.elapsed();
        }
    }

    /// Runs one incremental step. Returns `true` once no work is left.
    pub(crate) fn advance_marking_with_limits(
        &mut self,
        heap: &HeapHandle,
        limits: MarkingLimits,
    ) -> bool {
        if self.state != MarkerState::Marking {
            return true;
        }
        let started = Instant::now();
        self.steps += 1;
        let worklists = &*heap.worklists;
        requeue_constructed_objects(heap, worklists);
        let drained = {
            let mut visitor = MarkingVisitor::new(worklists, heap.gc_info());
            drain(&mut visitor, limits)
        };
        let concurrent_idle = match &self.concurrent {
            Some(concurrent) => {
                if !drained {
                    concurrent.notify_more_work();
                }
                !concurrent.has_active_tasks()
            }
            None => true,
        };
        let done = drained && concurrent_idle && worklists.is_drained();
        log_incremental_step(worklists.marked_bytes(), done);
        record_mark_time(heap, started.elapsed());
        done
    }

    /// The atomic pause: drains everything and processes weakness.
    pub(crate) fn finish_marking(&mut self, heap: &HeapHandle, stack_state: StackState) {
        debug_assert_eq!(self.state, MarkerState::Marking);
        let started = Instant::now();
        let worklists = &*heap.worklists;
        {
            let _span = trace_phase(GcPhase::Mark);
            if let Some(concurrent) = self.concurrent.take() {
                concurrent.join();
            }
            let mut visitor = MarkingVisitor::new(worklists, heap.gc_info());
            visit_roots(heap, &mut visitor);
            if self.config.collection_type == CollectionType::Minor {
                visit_remembered_set(heap, &mut visitor);
            }
            if stack_state == StackState::MayContainHeapPointers {
                scan_stack(heap);
            }
            loop {
                drain(&mut visitor, MarkingLimits::unlimited());
                scan_not_fully_constructed(heap, worklists);
                if worklists.is_drained() {
                    break;
                }
            }
            drop(visitor);
            log_phase_end(GcPhase::Mark, worklists.marked_bytes());
        }
        if self.is_incremental() {
            write_barrier::leave_incremental_marking();
            heap.incremental_marking.set(false);
        }
        record_mark_time(heap, started.elapsed());

        self.state = MarkerState::ProcessingWeakness;
        let weak_started = Instant::now();
        let cleared = process_weakness(heap, worklists);
        if let Some(cycle) = heap.cycle.borrow_mut().as_mut() {
            cycle.metrics.weak_duration = weak_started.elapsed();
            cycle.metrics.weak_references_cleared = cleared;
        }
        self.state = MarkerState::Done;
        heap.marking.set(false);
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        if let Some(concurrent) = self.concurrent.take() {
            concurrent.join();
        }
    }
}

fn record_mark_time(heap: &HeapHandle, elapsed: Duration) {
    if let Some(cycle) = heap.cycle.borrow_mut().as_mut() {
        cycle.mark.add(elapsed);
    }
}

fn visit_roots(heap: &HeapHandle, visitor: &mut MarkingVisitor<'_>) {
    heap.strong_persistents.trace(visitor);
    for &payload in heap.construction_roots.borrow().iter() {
        visitor.mark_payload(payload as *const u8);
    }
}

/// Roots of a minor collection: old-to-young slots and old objects written
/// without member barriers.
fn visit_remembered_set(heap: &HeapHandle, visitor: &mut MarkingVisitor<'_>) {
    let set = heap.remembered_set.borrow();
    for (slot, weak) in set.slots() {
        // SAFETY: remembered slots lie inside live old objects; slots of
        // freed objects are pruned.
        let storage = unsafe { &*(slot as *const RawStorage) };
        let value = storage.load();
        if !is_object(value) {
            continue;
        }
        if weak {
            visitor.worklists().weak_slots.push(WeakSlot::from_storage(storage));
        } else {
            visitor.mark_payload(value as *const u8);
        }
    }
    for payload in set.source_objects() {
        visitor.retrace(payload);
    }
}

/// Processes gray and retrace items until empty or `limits` is hit.
/// Returns `true` if both worklists were emptied.
fn drain(visitor: &mut MarkingVisitor<'_>, limits: MarkingLimits) -> bool {
    let worklists = visitor.worklists();
    let start_bytes = visitor.marked_bytes();
    let mut processed = 0usize;
    loop {
        if let Some(item) = worklists.marking.pop() {
            visitor.process_item(item);
        } else if let Some(payload) = worklists.retrace.pop() {
            visitor.retrace(payload);
        } else {
            return true;
        }
        processed += 1;
        if limits.bytes_exceeded(visitor.marked_bytes() - start_bytes)
            || (processed % DEADLINE_CHECK_INTERVAL == 0 && limits.deadline_passed())
        {
            return worklists.is_drained();
        }
    }
}

/// Moves deferred objects whose construction finished to the marking
/// worklist. Objects still in construction stay deferred.
fn requeue_constructed_objects(heap: &HeapHandle, worklists: &MarkingWorklists) {
    let mut pending = Vec::new();
    while let Some(payload) = worklists.not_fully_constructed.pop() {
        let header = unsafe { HeapObjectHeader::from_payload(payload as *const u8) };
        if header.is_free() {
            continue;
        }
        if header.is_in_construction() {
            pending.push(payload);
            continue;
        }
        worklists.marking.push(MarkingItem {
            payload: payload as *const u8,
            callback: heap.gc_info().get(header.gc_info_index()).trace,
        });
    }
    for payload in pending {
        worklists.not_fully_constructed.push(payload);
    }
}

/// Final-pause handling of deferred objects: constructed ones are traced
/// precisely, the rest have their payload scanned conservatively.
fn scan_not_fully_constructed(heap: &HeapHandle, worklists: &MarkingWorklists) {
    while let Some(payload) = worklists.not_fully_constructed.pop() {
        let header = unsafe { HeapObjectHeader::from_payload(payload as *const u8) };
        if header.is_free() {
            continue;
        }
        if !header.is_in_construction() {
            worklists.marking.push(MarkingItem {
                payload: payload as *const u8,
                callback: heap.gc_info().get(header.gc_info_index()).trace,
            });
            continue;
        }
        let words = header.object_size() / std::mem::size_of::<usize>();
        for index in 0..words {
            // SAFETY: the payload was zeroed at allocation and stays mapped.
            let word = unsafe { (payload as *const usize).add(index).read_volatile() };
            mark_conservatively(heap, word);
        }
    }
}

fn scan_stack(heap: &HeapHandle) {
    // SAFETY: runs on the heap's thread; words are validated before use.
    unsafe {
        crate::stack::spill_registers_and_scan(|word| {
            mark_conservatively(heap, word);
            #[cfg(feature = "pointer-compression")]
            scan_compressed_halves(heap, word);
        });
    }
}

#[cfg(feature = "pointer-compression")]
#[allow(clippy::cast_possible_truncation)]
fn scan_compressed_halves(heap: &HeapHandle, word: usize) {
    for half in [word as u32, (word >> 32) as u32] {
        if half & 0x8000_0000 != 0 {
            mark_conservatively(heap, crate::compression::decompress(half));
        }
    }
}

/// Treats `address` as a possible reference into the heap.
fn mark_conservatively(heap: &HeapHandle, address: usize) {
    let Some((_, header)) = heap.find_header(address) else {
        return;
    };
    if !header.try_mark_atomic() {
        return;
    }
    let payload = header.payload();
    if header.is_in_construction() {
        heap.worklists.not_fully_constructed.push(payload as usize);
    } else {
        heap.worklists.marking.push(MarkingItem {
            payload,
            callback: heap.gc_info().get(header.gc_info_index()).trace,
        });
    }
}

/// Clears weak members and weak persistents whose target is unmarked.
fn process_weakness(heap: &HeapHandle, worklists: &MarkingWorklists) -> usize {
    let _span = trace_phase(GcPhase::Weak);
    let mut cleared = 0;
    while let Some(slot) = worklists.weak_slots.pop() {
        // SAFETY: weak slots were reported by objects traced this cycle,
        // which stay alive until sweeping.
        let storage = unsafe { slot.storage() };
        let value = storage.load();
        if !is_object(value) {
            continue;
        }
        let header = unsafe { HeapObjectHeader::from_payload(value as *const u8) };
        if !header.is_marked() {
            storage.store(0);
            cleared += 1;
        }
    }
    cleared += heap.weak_persistents.clear_unmarked();
    log_phase_end(GcPhase::Weak, cleared);
    cleared
}
