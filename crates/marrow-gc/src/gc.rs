//! Collection configuration and the collection driver.
//!
//! A cycle runs through four phases:
//!
//! 1. **Clear**: mark bits left by a previous generational cycle are reset.
//! 2. **Mark**: roots are visited and the object graph is traced, either in
//!    one atomic pause or in incremental steps interleaved with the mutator,
//!    optionally helped by background tasks.
//! 3. **Weak**: weak members and weak persistents to unmarked objects are
//!    cleared at the end of the atomic pause.
//! 4. **Sweep**: unmarked objects are finalized and their memory reclaimed,
//!    atomically or lazily through foreground tasks and allocation.

use std::time::{Duration, Instant};

use crate::heap::base::HeapHandle;
use crate::marking::marker::{Marker, MarkingLimits};
use crate::metrics::{global_metrics, GcMetrics, PhaseTimer};
use crate::tracing::internal::{next_gc_id, trace_gc_collection, GcId};

/// Time budget of one incremental marking task.
const INCREMENTAL_STEP_DURATION: Duration = Duration::from_millis(1);

// ============================================================================
// Configuration
// ============================================================================

/// Which part of the heap a collection considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// Every object of the heap.
    Major,
    /// Young objects only; old objects are treated as live. Requires a heap
    /// created with [`HeapOptions::generational`](crate::HeapOptions::generational).
    Minor,
}

/// Whether the native stack may hold references into the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// The stack holds no references; only persistents are roots.
    NoHeapPointers,
    /// The stack is scanned conservatively for addresses of objects.
    MayContainHeapPointers,
}

/// How the mark phase is performed. Variants are ordered by capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MarkingType {
    /// In a single pause.
    Atomic,
    /// In steps on the heap's thread.
    Incremental,
    /// In steps on the heap's thread and on background tasks.
    IncrementalAndConcurrent,
}

/// How the sweep phase is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SweepingType {
    /// Right after marking.
    Atomic,
    /// Lazily, from foreground tasks and on allocation.
    Incremental,
}

/// Whether the sweeper returns memory of free blocks to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeMemoryHandling {
    /// Keep free memory committed.
    DoNotDiscardWideMemory,
    /// Discard whole OS pages inside free blocks.
    DiscardWherePossible,
}

/// Whether the heap may scan the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSupport {
    /// Conservative stack scanning is available.
    SupportsConservativeStackScan,
    /// Collections always run as if the stack held no heap pointers.
    NoConservativeStackScan,
}

/// Parameters of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Major or minor.
    pub collection_type: CollectionType,
    /// Stack state at the atomic pause.
    pub stack_state: StackState,
    /// Requested marking type; clamped to what the heap supports.
    pub marking_type: MarkingType,
    /// Requested sweeping type; clamped to what the heap supports.
    pub sweeping_type: SweepingType,
    /// Discard policy of the sweeper.
    pub free_memory_handling: FreeMemoryHandling,
    /// Set for collections requested explicitly rather than by heap growth.
    pub is_forced: bool,
}

impl GcConfig {
    const fn new(
        collection_type: CollectionType,
        stack_state: StackState,
        marking_type: MarkingType,
        sweeping_type: SweepingType,
    ) -> Self {
        Self {
            collection_type,
            stack_state,
            marking_type,
            sweeping_type,
            free_memory_handling: FreeMemoryHandling::DoNotDiscardWideMemory,
            is_forced: true,
        }
    }

    /// Major, atomic, scans the stack.
    #[must_use]
    pub const fn conservative_atomic() -> Self {
        Self::new(
            CollectionType::Major,
            StackState::MayContainHeapPointers,
            MarkingType::Atomic,
            SweepingType::Atomic,
        )
    }

    /// Major, atomic, persistents are the only roots.
    #[must_use]
    pub const fn precise_atomic() -> Self {
        Self::new(
            CollectionType::Major,
            StackState::NoHeapPointers,
            MarkingType::Atomic,
            SweepingType::Atomic,
        )
    }

    /// Major, incremental marking and sweeping, scans the stack at the
    /// final pause.
    #[must_use]
    pub const fn conservative_incremental() -> Self {
        Self::new(
            CollectionType::Major,
            StackState::MayContainHeapPointers,
            MarkingType::Incremental,
            SweepingType::Incremental,
        )
    }

    /// Major, incremental marking and sweeping, persistents only.
    #[must_use]
    pub const fn precise_incremental() -> Self {
        Self::new(
            CollectionType::Major,
            StackState::NoHeapPointers,
            MarkingType::Incremental,
            SweepingType::Incremental,
        )
    }

    /// Like [`GcConfig::conservative_incremental`] with background marking.
    #[must_use]
    pub const fn conservative_concurrent() -> Self {
        Self::new(
            CollectionType::Major,
            StackState::MayContainHeapPointers,
            MarkingType::IncrementalAndConcurrent,
            SweepingType::Incremental,
        )
    }

    /// Like [`GcConfig::precise_incremental`] with background marking.
    #[must_use]
    pub const fn precise_concurrent() -> Self {
        Self::new(
            CollectionType::Major,
            StackState::NoHeapPointers,
            MarkingType::IncrementalAndConcurrent,
            SweepingType::Incremental,
        )
    }

    /// Minor, atomic, persistents and remembered slots only.
    #[must_use]
    pub const fn minor_precise() -> Self {
        Self::new(
            CollectionType::Minor,
            StackState::NoHeapPointers,
            MarkingType::Atomic,
            SweepingType::Atomic,
        )
    }

    /// Minor, atomic, scans the stack.
    #[must_use]
    pub const fn minor_conservative() -> Self {
        Self::new(
            CollectionType::Minor,
            StackState::MayContainHeapPointers,
            MarkingType::Atomic,
            SweepingType::Atomic,
        )
    }

    /// Replaces the sweeping type.
    #[must_use]
    pub const fn with_sweeping_type(mut self, sweeping_type: SweepingType) -> Self {
        self.sweeping_type = sweeping_type;
        self
    }

    /// Replaces the discard policy.
    #[must_use]
    pub const fn with_free_memory_handling(mut self, handling: FreeMemoryHandling) -> Self {
        self.free_memory_handling = handling;
        self
    }

    pub(crate) const fn triggered_by_growth(mut self) -> Self {
        self.is_forced = false;
        self
    }
}

// ============================================================================
// Scopes
// ============================================================================

/// Suppresses collections on a heap while alive.
///
/// Requests made inside the scope, explicit or triggered by allocation, are
/// ignored rather than deferred. Scopes nest.
#[derive(Debug)]
pub struct NoGarbageCollectionScope<'a> {
    heap: &'a HeapHandle,
}

impl<'a> NoGarbageCollectionScope<'a> {
    /// Enters the scope.
    #[must_use]
    pub fn new(heap: &'a HeapHandle) -> Self {
        heap.no_gc_scopes.set(heap.no_gc_scopes.get() + 1);
        Self { heap }
    }
}

impl Drop for NoGarbageCollectionScope<'_> {
    fn drop(&mut self) {
        self.heap.no_gc_scopes.set(self.heap.no_gc_scopes.get() - 1);
    }
}

/// Forbids collections on a heap while alive.
///
/// Requesting a collection inside the scope is a bug: debug builds panic,
/// release builds ignore the request. Allocation-triggered collections are
/// suppressed silently.
#[derive(Debug)]
pub struct DisallowGarbageCollectionScope<'a> {
    heap: &'a HeapHandle,
}

impl<'a> DisallowGarbageCollectionScope<'a> {
    /// Enters the scope.
    #[must_use]
    pub fn new(heap: &'a HeapHandle) -> Self {
        heap.disallow_gc_scopes.set(heap.disallow_gc_scopes.get() + 1);
        Self { heap }
    }

    /// Returns `true` if `heap` is inside at least one such scope.
    #[must_use]
    pub fn is_gc_forbidden(heap: &HeapHandle) -> bool {
        heap.disallow_gc_scopes.get() > 0
    }
}

impl Drop for DisallowGarbageCollectionScope<'_> {
    fn drop(&mut self) {
        self.heap
            .disallow_gc_scopes
            .set(self.heap.disallow_gc_scopes.get() - 1);
    }
}

// ============================================================================
// Cycle bookkeeping
// ============================================================================

/// Measurements of the cycle in progress.
#[derive(Debug)]
pub(crate) struct CycleRecord {
    pub(crate) gc_id: GcId,
    pub(crate) metrics: GcMetrics,
    pub(crate) started: Instant,
    pub(crate) mark: PhaseTimer,
    pub(crate) sweep: PhaseTimer,
}

impl CycleRecord {
    fn new(config: GcConfig) -> Self {
        Self {
            gc_id: next_gc_id(),
            metrics: GcMetrics {
                collection_type: Some(config.collection_type),
                marking_type: config.marking_type,
                sweeping_type: config.sweeping_type,
                ..GcMetrics::new()
            },
            started: Instant::now(),
            mark: PhaseTimer::new(),
            sweep: PhaseTimer::new(),
        }
    }
}

const fn collection_name(config: &GcConfig) -> &'static str {
    match config.collection_type {
        CollectionType::Major => "major",
        CollectionType::Minor => "minor",
    }
}

// ============================================================================
// Driver
// ============================================================================

impl HeapHandle {
    /// Runs a full collection.
    ///
    /// If an incremental cycle is in progress it is finalized instead, with
    /// the stack state of `config`. Collections requested inside a
    /// [`NoGarbageCollectionScope`], during the atomic pause, or from a
    /// finalizer are ignored.
    pub fn collect_garbage(&self, config: GcConfig) {
        if self.disallow_gc_scopes.get() > 0 {
            if cfg!(debug_assertions) {
                panic!("garbage collection requested inside a DisallowGarbageCollectionScope");
            }
            return;
        }
        if !self.may_collect() {
            return;
        }
        let config = self.adjust_config(config);
        let _span = trace_gc_collection(collection_name(&config), self.current_gc_id());
        if !self.is_marking() {
            self.start_garbage_collection(config);
        }
        self.finalize_garbage_collection(config.stack_state);
        if config.sweeping_type == SweepingType::Atomic {
            self.finish_sweeping();
        }
    }

    /// Starts an incremental cycle, or does nothing if one is running, the
    /// heap only supports atomic marking, or collections are suppressed.
    ///
    /// Marking then advances through foreground tasks posted on the
    /// platform, on allocation, and through
    /// [`HeapHandle::finalize_incremental_garbage_collection_if_running`].
    pub fn start_incremental_garbage_collection(&self, config: GcConfig) {
        if self.disallow_gc_scopes.get() > 0 || !self.may_collect() || self.is_marking() {
            return;
        }
        let mut config = self.adjust_config(config);
        if config.collection_type == CollectionType::Minor {
            // Minor collections are always atomic.
            return;
        }
        if config.marking_type == MarkingType::Atomic {
            return;
        }
        config.marking_type = config.marking_type.max(MarkingType::Incremental);
        let _span = trace_gc_collection(collection_name(&config), self.current_gc_id());
        self.start_garbage_collection(config);
    }

    /// Completes a running incremental cycle with an atomic pause.
    pub fn finalize_incremental_garbage_collection_if_running(&self, stack_state: StackState) {
        if !self.is_marking() || self.in_atomic_pause.get() {
            return;
        }
        let stack_state = self.adjust_stack_state(stack_state);
        self.finalize_garbage_collection(stack_state);
    }

    fn may_collect(&self) -> bool {
        self.no_gc_scopes.get() == 0 && !self.in_atomic_pause.get() && !self.in_finalization.get()
    }

    fn current_gc_id(&self) -> GcId {
        self.cycle
            .borrow()
            .as_ref()
            .map_or_else(|| GcId(0), |cycle| cycle.gc_id)
    }

    fn adjust_stack_state(&self, stack_state: StackState) -> StackState {
        let stack_state = self.override_stack_state.get().unwrap_or(stack_state);
        if self.options.stack_support == StackSupport::NoConservativeStackScan {
            StackState::NoHeapPointers
        } else {
            stack_state
        }
    }

    pub(crate) fn adjust_config(&self, mut config: GcConfig) -> GcConfig {
        config.stack_state = self.adjust_stack_state(config.stack_state);
        if config.collection_type == CollectionType::Minor {
            if self.options.generational {
                config.marking_type = MarkingType::Atomic;
            } else {
                config.collection_type = CollectionType::Major;
            }
        }
        config.marking_type = config.marking_type.min(self.options.marking_support);
        config.sweeping_type = config.sweeping_type.min(self.options.sweeping_support);
        config
    }

    pub(crate) fn start_garbage_collection(&self, config: GcConfig) {
        self.finish_sweeping();
        *self.cycle.borrow_mut() = Some(CycleRecord::new(config));
        self.barrier_hits.set(0);
        let mut marker = Marker::new(config);
        marker.start_marking(self);
        *self.marker.borrow_mut() = Some(marker);
        if config.marking_type != MarkingType::Atomic {
            self.schedule_incremental_marking_task();
        }
    }

    fn finalize_garbage_collection(&self, stack_state: StackState) {
        let Some(mut marker) = self.marker.borrow_mut().take() else {
            return;
        };
        let pause = Instant::now();
        self.in_atomic_pause.set(true);
        marker.finish_marking(self, stack_state);
        self.remembered_set.borrow_mut().clear();
        self.epoch.set(self.epoch.get() + 1);
        let marked_bytes = self.worklists.marked_bytes();
        self.growing.borrow_mut().update_limit(marked_bytes);
        self.allocated_since_gc.set(0);
        self.in_atomic_pause.set(false);

        let config = marker.config();
        if let Some(cycle) = self.cycle.borrow_mut().as_mut() {
            cycle.metrics.marked_bytes = marked_bytes;
            cycle.metrics.incremental_steps = marker.steps();
            cycle.metrics.barrier_slow_path_hits = self.barrier_hits.get();
            cycle.metrics.atomic_pause_duration = pause.elapsed();
        }
        self.start_sweeping(config);
    }

    /// Publishes the metrics of the finished cycle.
    pub(crate) fn complete_cycle(&self) {
        let Some(cycle) = self.cycle.borrow_mut().take() else {
            return;
        };
        let mut metrics = cycle.metrics;
        metrics.mark_duration = cycle.mark.total();
        metrics.sweep_duration = cycle.sweep.total();
        metrics.duration = metrics.clear_duration
            + metrics.mark_duration
            + metrics.atomic_pause_duration
            + metrics.sweep_duration;
        metrics.total_collections = self.last_metrics.get().total_collections + 1;
        self.last_metrics.set(metrics);
        global_metrics().record(&metrics);
    }

    // ------------------------------------------------------------------------
    // Incremental marking
    // ------------------------------------------------------------------------

    /// Advances marking within `limits`. Returns `true` once no marking work
    /// is left and the cycle can be finalized.
    pub(crate) fn perform_marking_step(&self, limits: MarkingLimits) -> bool {
        let mut marker = self.marker.borrow_mut();
        let Some(marker) = marker.as_mut() else {
            return true;
        };
        marker.advance_marking_with_limits(self, limits)
    }

    fn schedule_incremental_marking_task(&self) {
        let Some(runner) = self.platform.foreground_task_runner() else {
            return;
        };
        let heap = self.self_ref.clone();
        let epoch = self.epoch.get();
        runner.post_task(Box::new(move || {
            if let Some(heap) = heap.upgrade() {
                heap.run_incremental_marking_task(epoch);
            }
        }));
    }

    fn run_incremental_marking_task(&self, epoch: usize) {
        // A task from a finished cycle.
        if self.epoch.get() != epoch || !self.is_marking() || self.in_atomic_pause.get() {
            return;
        }
        let done = self.perform_marking_step(MarkingLimits::with_duration(INCREMENTAL_STEP_DURATION));
        if !done {
            self.schedule_incremental_marking_task();
            return;
        }
        // Left to the next allocation step or an explicit finalization.
        if self.no_gc_scopes.get() > 0 {
            return;
        }
        // Tasks run from the message loop; the stack may still hold
        // references where scanning is available.
        self.finalize_incremental_garbage_collection_if_running(StackState::MayContainHeapPointers);
    }

    /// Allocation hook: advances a running incremental cycle or starts a new
    /// one once the heap outgrew its limit.
    pub(crate) fn on_allocation(&self, size: usize) {
        self.allocated_since_gc
            .set(self.allocated_since_gc.get() + size);
        if self.no_gc_scopes.get() > 0
            || self.disallow_gc_scopes.get() > 0
            || self.in_atomic_pause.get()
            || self.in_finalization.get()
        {
            return;
        }
        if self.is_marking() {
            self.allocation_driven_marking_step(size);
            return;
        }
        if self.is_sweeping() {
            return;
        }
        if !self.growing.borrow().limit_reached(self.allocated_bytes.get()) {
            return;
        }
        let config = GcConfig::conservative_incremental().triggered_by_growth();
        if self.options.marking_support != MarkingType::Atomic {
            let config = GcConfig {
                marking_type: self.options.marking_support,
                ..config
            };
            self.start_incremental_garbage_collection(config);
        } else if self.options.stack_support == StackSupport::SupportsConservativeStackScan {
            self.collect_garbage(GcConfig::conservative_atomic().triggered_by_growth());
        }
    }

    fn allocation_driven_marking_step(&self, size: usize) {
        const STEP_BYTES: usize = 256 * 1024;
        let since = self.allocated_since_step.get() + size;
        if since < STEP_BYTES {
            self.allocated_since_step.set(since);
            return;
        }
        self.allocated_since_step.set(0);
        let done = self.perform_marking_step(MarkingLimits::with_duration(INCREMENTAL_STEP_DURATION));
        if done && self.options.stack_support == StackSupport::SupportsConservativeStackScan {
            self.finalize_incremental_garbage_collection_if_running(
                StackState::MayContainHeapPointers,
            );
        }
    }
}

/// Overrides the stack state of every collection on a heap while alive.
///
/// Mostly useful in tests that must not depend on what happens to be on the
/// stack.
#[derive(Debug)]
pub struct OverrideStackStateScope<'a> {
    heap: &'a HeapHandle,
    previous: Option<StackState>,
}

impl<'a> OverrideStackStateScope<'a> {
    /// Forces `state` until the scope is dropped.
    #[must_use]
    pub fn new(heap: &'a HeapHandle, state: StackState) -> Self {
        let previous = heap.override_stack_state.replace(Some(state));
        Self { heap, previous }
    }
}

impl Drop for OverrideStackStateScope<'_> {
    fn drop(&mut self) {
        self.heap.override_stack_state.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_configs() {
        let config = GcConfig::precise_incremental();
        assert_eq!(config.collection_type, CollectionType::Major);
        assert_eq!(config.stack_state, StackState::NoHeapPointers);
        assert_eq!(config.marking_type, MarkingType::Incremental);
        assert!(config.is_forced);
        assert!(!config.triggered_by_growth().is_forced);

        let minor = GcConfig::minor_conservative();
        assert_eq!(minor.collection_type, CollectionType::Minor);
        assert_eq!(minor.marking_type, MarkingType::Atomic);
    }

    #[test]
    fn test_marking_types_are_ordered() {
        assert!(MarkingType::Atomic < MarkingType::Incremental);
        assert!(MarkingType::Incremental < MarkingType::IncrementalAndConcurrent);
        assert_eq!(
            MarkingType::IncrementalAndConcurrent.min(MarkingType::Incremental),
            MarkingType::Incremental
        );
        assert!(SweepingType::Atomic < SweepingType::Incremental);
    }

    #[test]
    fn test_builder_helpers() {
        let config = GcConfig::precise_atomic()
            .with_sweeping_type(SweepingType::Incremental)
            .with_free_memory_handling(FreeMemoryHandling::DiscardWherePossible);
        assert_eq!(config.sweeping_type, SweepingType::Incremental);
        assert_eq!(
            config.free_memory_handling,
            FreeMemoryHandling::DiscardWherePossible
        );
    }
}
