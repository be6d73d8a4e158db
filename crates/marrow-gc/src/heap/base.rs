//! The heap handle.
//!
//! A [`Heap`] owns every page its objects live on, the persistent regions
//! holding its roots, and the state of the collection cycle in progress.
//! It is bound to the thread that created it; only marking work may run on
//! background threads.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::gc::{CycleRecord, GcConfig, MarkingType, StackState, StackSupport, SweepingType};
use crate::gc_info::GcInfoTable;
use crate::heap::free_list::Block;
use crate::heap::growing::{HeapGrowing, HeapGrowingConfig};
use crate::heap::header::HeapObjectHeader;
use crate::heap::oom;
use crate::heap::page::{BasePage, LargePage, NormalPage, PageKind};
use crate::heap::page_memory::PageBackend;
use crate::heap::space::{RawHeap, SpaceIndex, LARGE_SPACE};
use crate::heap::sweeper::Sweeper;
use crate::marking::marker::Marker;
use crate::marking::remembered_set::RememberedSet;
use crate::marking::worklists::MarkingWorklists;
use crate::marking::write_barrier;
use crate::metrics::GcMetrics;
use crate::persistent::PersistentRegion;
use crate::platform::Platform;
use crate::process::{process_state, ProcessState};
use crate::ptr::GcPtr;
use crate::trace::GarbageCollected;
use crate::tracing::internal::{log_page_allocated, log_page_released};

/// Configuration of a [`Heap`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeapOptions {
    /// Number of custom spaces, addressed by
    /// [`SpaceKind::Custom`](crate::SpaceKind::Custom).
    pub custom_spaces: usize,
    /// Most capable marking the heap may use.
    pub marking_support: MarkingType,
    /// Most capable sweeping the heap may use.
    pub sweeping_support: SweepingType,
    /// Whether collections may scan the native stack.
    pub stack_support: StackSupport,
    /// Enables minor collections, the young bit and the generational
    /// barrier.
    pub generational: bool,
    /// Allocation-triggered collections; `None` collects only on request.
    pub growing: Option<HeapGrowingConfig>,
    /// Upper bound of background marking tasks per cycle.
    pub concurrent_marking_tasks: usize,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            custom_spaces: 0,
            marking_support: MarkingType::IncrementalAndConcurrent,
            sweeping_support: SweepingType::Incremental,
            stack_support: if crate::stack::IS_SUPPORTED {
                StackSupport::SupportsConservativeStackScan
            } else {
                StackSupport::NoConservativeStackScan
            },
            generational: false,
            growing: None,
            concurrent_marking_tasks: 2,
        }
    }
}

/// Point-in-time sizes of a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Bytes of live and not yet swept objects, headers included.
    pub allocated_bytes: usize,
    /// Bytes of committed page memory.
    pub resident_bytes: usize,
    /// Normal pages in use.
    pub normal_pages: usize,
    /// Large pages in use.
    pub large_pages: usize,
    /// Bytes available in free lists and allocation buffers.
    pub free_list_bytes: usize,
    /// Decommitted normal pages kept for reuse.
    pub pooled_pages: usize,
    /// Strong persistent handles pointing into the heap.
    pub persistent_count: usize,
    /// Weak persistent handles pointing into the heap.
    pub weak_persistent_count: usize,
}

/// Counters for tests, enabled by the `test-util` feature.
#[cfg(feature = "test-util")]
#[derive(Debug, Default)]
pub struct DebugCounters {
    /// Objects allocated since the heap was created.
    pub objects_allocated: Cell<usize>,
    /// Objects finalized since the heap was created.
    pub objects_finalized: Cell<usize>,
}

/// State of one heap. Reached through [`Heap`] and through the pages of its
/// objects.
pub struct HeapHandle {
    pub(crate) process: Arc<ProcessState>,
    pub(crate) platform: Rc<dyn Platform>,
    pub(crate) options: HeapOptions,
    pub(crate) backend: PageBackend,
    pub(crate) raw_heap: RefCell<RawHeap>,
    pub(crate) marker: RefCell<Option<Marker>>,
    pub(crate) worklists: Arc<MarkingWorklists>,
    pub(crate) sweeper: RefCell<Sweeper>,

    pub(crate) strong_persistents: Rc<PersistentRegion>,
    pub(crate) weak_persistents: Rc<PersistentRegion>,
    // Payloads of objects whose value is still being computed.
    pub(crate) construction_roots: RefCell<Vec<usize>>,
    pub(crate) remembered_set: RefCell<RememberedSet>,

    pub(crate) growing: RefCell<HeapGrowing>,
    pub(crate) allocated_bytes: Cell<usize>,
    pub(crate) allocated_since_gc: Cell<usize>,
    pub(crate) allocated_since_step: Cell<usize>,
    pub(crate) barrier_hits: Cell<usize>,

    pub(crate) last_metrics: Cell<GcMetrics>,
    pub(crate) cycle: RefCell<Option<CycleRecord>>,

    pub(crate) marking: Cell<bool>,
    pub(crate) incremental_marking: Cell<bool>,
    pub(crate) in_atomic_pause: Cell<bool>,
    pub(crate) in_finalization: Cell<bool>,
    pub(crate) sweeping: Cell<bool>,
    pub(crate) no_gc_scopes: Cell<usize>,
    pub(crate) disallow_gc_scopes: Cell<usize>,
    pub(crate) override_stack_state: Cell<Option<StackState>>,
    pub(crate) epoch: Cell<usize>,
    pub(crate) self_ref: Weak<HeapHandle>,

    #[cfg(feature = "test-util")]
    pub(crate) counters: DebugCounters,
}

/// Handle passed to the allocation functions.
pub type AllocationHandle = HeapHandle;

impl HeapHandle {
    fn new(platform: Rc<dyn Platform>, options: HeapOptions, self_ref: Weak<Self>) -> Self {
        let process = process_state();
        #[cfg(feature = "caged-heap")]
        let backend = PageBackend::new(
            Arc::clone(process.cage.page_allocator()),
            Some(Arc::clone(&process.cage)),
        );
        #[cfg(not(feature = "caged-heap"))]
        let backend = PageBackend::new(platform.page_allocator(), None);

        Self {
            process,
            platform,
            backend,
            raw_heap: RefCell::new(RawHeap::new(options.custom_spaces)),
            marker: RefCell::new(None),
            worklists: Arc::new(MarkingWorklists::new()),
            sweeper: RefCell::new(Sweeper::new()),
            strong_persistents: Rc::new(PersistentRegion::new()),
            weak_persistents: Rc::new(PersistentRegion::new()),
            construction_roots: RefCell::new(Vec::new()),
            remembered_set: RefCell::new(RememberedSet::default()),
            growing: RefCell::new(HeapGrowing::new(options.growing)),
            allocated_bytes: Cell::new(0),
            allocated_since_gc: Cell::new(0),
            allocated_since_step: Cell::new(0),
            barrier_hits: Cell::new(0),
            last_metrics: Cell::new(GcMetrics::new()),
            cycle: RefCell::new(None),
            marking: Cell::new(false),
            incremental_marking: Cell::new(false),
            in_atomic_pause: Cell::new(false),
            in_finalization: Cell::new(false),
            sweeping: Cell::new(false),
            no_gc_scopes: Cell::new(0),
            disallow_gc_scopes: Cell::new(0),
            override_stack_state: Cell::new(None),
            epoch: Cell::new(0),
            self_ref,
            options,
            #[cfg(feature = "test-util")]
            counters: DebugCounters::default(),
        }
    }

    // ========================================================================
    // Public state
    // ========================================================================

    /// Returns `true` while a cycle is marking, atomic pause included.
    #[inline]
    #[must_use]
    pub fn is_marking(&self) -> bool {
        self.marking.get()
    }

    /// Returns `true` while swept pages are still pending.
    #[inline]
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.get()
    }

    /// Returns `true` during the final, atomic part of marking.
    #[inline]
    #[must_use]
    pub fn is_in_atomic_pause(&self) -> bool {
        self.in_atomic_pause.get()
    }

    /// Number of completed marking phases.
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch.get()
    }

    /// Options the heap was created with.
    #[must_use]
    pub const fn options(&self) -> &HeapOptions {
        &self.options
    }

    /// The embedder's platform.
    #[must_use]
    pub fn platform(&self) -> &Rc<dyn Platform> {
        &self.platform
    }

    /// Statistics of the most recent completed collection.
    #[must_use]
    pub fn metrics(&self) -> GcMetrics {
        self.last_metrics.get()
    }

    /// Current sizes of the heap.
    #[must_use]
    pub fn stats(&self) -> HeapStatistics {
        let raw = self.raw_heap.borrow();
        let (unswept_normal, unswept_large) = self.sweeper.borrow().pending_pages();
        HeapStatistics {
            allocated_bytes: self.allocated_bytes.get(),
            resident_bytes: self.backend.committed_bytes(),
            normal_pages: raw.normal_page_count() + unswept_normal,
            large_pages: raw.large.pages.len() + unswept_large,
            free_list_bytes: raw.free_list_bytes(),
            pooled_pages: self.backend.pooled_pages(),
            persistent_count: self.strong_persistents.node_count(),
            weak_persistent_count: self.weak_persistents.node_count(),
        }
    }

    /// Returns `true` if `object` is the payload of a live object of this
    /// heap.
    ///
    /// Objects on pages that are not swept yet count as live only if they
    /// were marked.
    #[must_use]
    pub fn is_object_alive<T: ?Sized>(&self, object: *const T) -> bool {
        let address = object.cast::<u8>() as usize;
        self.find_header(address)
            .is_some_and(|(page, header)| {
                header.payload() as usize == address
                    && !header.is_in_construction()
                    && (page.is_swept() || header.is_marked())
            })
    }

    /// Payload size of `object`, trailing storage included.
    #[must_use]
    pub fn object_size<T: GarbageCollected>(&self, object: GcPtr<T>) -> usize {
        object.header().object_size()
    }

    /// Registered type name of `object`.
    #[must_use]
    pub fn type_name<T: GarbageCollected>(&self, object: GcPtr<T>) -> &'static str {
        self.gc_info().get(object.header().gc_info_index()).name
    }

    #[cfg(feature = "test-util")]
    /// Allocation and finalization counters.
    #[must_use]
    pub const fn debug_counters(&self) -> &DebugCounters {
        &self.counters
    }

    // ========================================================================
    // Internal state
    // ========================================================================

    #[inline]
    pub(crate) fn is_incremental_marking(&self) -> bool {
        self.incremental_marking.get()
    }

    #[inline]
    pub(crate) fn is_generational(&self) -> bool {
        self.options.generational
    }

    #[inline]
    pub(crate) fn gc_info(&self) -> &GcInfoTable {
        &self.process.gc_info
    }

    #[inline]
    pub(crate) fn worklists(&self) -> &MarkingWorklists {
        &self.worklists
    }

    pub(crate) fn record_barrier_slow_path(&self) {
        self.barrier_hits.set(self.barrier_hits.get() + 1);
    }

    pub(crate) fn persistent_region(&self, weak: bool) -> &Rc<PersistentRegion> {
        if weak {
            &self.weak_persistents
        } else {
            &self.strong_persistents
        }
    }

    /// Returns `true` if an explicit free or resize may touch the heap.
    pub(crate) fn is_gc_phase_active(&self) -> bool {
        self.in_atomic_pause.get()
            || self.marking.get()
            || self.sweeping.get()
            || self.in_finalization.get()
    }

    /// Header of the object of this heap containing `address`.
    pub(crate) fn find_header(&self, address: usize) -> Option<(&BasePage, &HeapObjectHeader)> {
        let page = self.backend.lookup(address)?;
        // SAFETY: the backend only returns pages that are in use.
        let page = unsafe { page.as_ref() };
        if !std::ptr::eq(page.heap_ptr(), self) {
            return None;
        }
        let lab = match page.kind() {
            PageKind::Normal => self.raw_heap.borrow().lab_range(page.space()),
            PageKind::Large => (0, 0),
        };
        let header = page.try_object_header_from_inner_address(address, lab)?;
        Some((page, header))
    }

    /// Records the member at `slot` for the next minor collection.
    pub(crate) fn remember_slot(&self, slot: usize, weak: bool) {
        let Some(page) = self.backend.lookup(slot) else {
            // Members outside the heap are roots or unreachable.
            return;
        };
        let page = unsafe { page.as_ref() };
        if !std::ptr::eq(page.heap_ptr(), self) {
            return;
        }
        let Some(owner) = page.try_object_header_from_inner_address(slot, (0, 0)) else {
            return;
        };
        if owner.is_young() {
            return;
        }
        self.remembered_set.borrow_mut().add_slot(slot, weak);
    }

    pub(crate) fn remember_source_object(&self, payload: usize) {
        self.remembered_set.borrow_mut().add_source_object(payload);
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Adds a fresh normal page to `space`. Its whole payload becomes one
    /// free-list block.
    pub(crate) fn new_normal_page(&self, raw: &mut RawHeap, space: SpaceIndex) -> NonNull<NormalPage> {
        let memory = match self.backend.allocate_normal_page_memory() {
            Ok(memory) => memory,
            Err(_) => oom("normal page allocation failed", crate::heap::PAGE_SIZE),
        };
        // SAFETY: fresh page memory from the backend is committed and zeroed.
        let page = unsafe { NormalPage::create(memory, self, space) };
        log_page_allocated(false, memory.as_ptr() as usize);
        let space = &mut raw.normal[space];
        space.pages.push(page);
        let payload_start = unsafe { page.as_ref() }.payload_start();
        space.add_to_free_list(Block {
            address: payload_start,
            size: NormalPage::PAYLOAD_SIZE,
        });
        page
    }

    /// Allocates a large page holding one object of `payload_size` bytes and
    /// returns the object's header address.
    pub(crate) fn new_large_object(&self, payload_size: usize) -> *mut u8 {
        let writeable = LargePage::writeable_size(payload_size);
        let memory = match self.backend.allocate_large_page_memory(writeable) {
            Ok(memory) => memory,
            Err(_) => oom("large page allocation failed", writeable),
        };
        // SAFETY: the region holds `writeable` committed bytes after the guard.
        let page = unsafe { LargePage::create(memory, self, LARGE_SPACE, payload_size) };
        log_page_allocated(true, memory.as_ptr() as usize);
        self.raw_heap.borrow_mut().large.pages.push(page);
        unsafe { page.as_ref() }.header().address()
    }

    /// Returns a normal page that holds no objects to the backend.
    pub(crate) fn release_normal_page(&self, page: NonNull<NormalPage>) {
        let base = unsafe { page.as_ref() }.base().region_base();
        log_page_released(false, base.as_ptr() as usize);
        if self.backend.free_normal_page_memory(base).is_err() {
            oom("normal page decommit failed", crate::heap::PAGE_SIZE);
        }
    }

    /// Releases a large page. The caller removed it from the large space.
    pub(crate) fn release_large_page(&self, page: NonNull<LargePage>) {
        let base = unsafe { page.as_ref() }.base().region_base();
        log_page_released(true, base.as_ptr() as usize);
        if self.backend.free_large_page_memory(base).is_err() {
            oom("large page release failed", 0);
        }
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Runs `f` with finalization flagged, so that finalizers cannot
    /// allocate or collect.
    pub(crate) fn with_finalization<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Reset<'a>(&'a Cell<bool>, bool);
        impl Drop for Reset<'_> {
            fn drop(&mut self) {
                self.0.set(self.1);
            }
        }
        let _reset = Reset(&self.in_finalization, self.in_finalization.replace(true));
        f()
    }

    /// Runs the destructor of the object behind `header`, if it has one.
    ///
    /// Must be called inside [`HeapHandle::with_finalization`].
    pub(crate) fn finalize_object(&self, header: &HeapObjectHeader) {
        debug_assert!(self.in_finalization.get());
        if header.is_free() || header.is_in_construction() {
            return;
        }
        #[cfg(feature = "test-util")]
        self.counters
            .objects_finalized
            .set(self.counters.objects_finalized.get() + 1);
        if let Some(finalize) = self.gc_info().get(header.gc_info_index()).finalize {
            // SAFETY: the object is fully constructed and unreachable.
            unsafe { finalize(header.payload()) };
        }
    }

    /// Finalizes every object and frees all pages.
    fn tear_down(&self) {
        self.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers);
        self.finish_sweeping();
        self.strong_persistents.clear_all();
        self.weak_persistents.clear_all();
        self.raw_heap.borrow_mut().reset_labs();

        let (normal, large) = {
            let mut raw = self.raw_heap.borrow_mut();
            let normal: Vec<_> = raw
                .normal
                .iter_mut()
                .flat_map(|space| {
                    space.free_list.clear();
                    std::mem::take(&mut space.pages)
                })
                .collect();
            (normal, std::mem::take(&mut raw.large.pages))
        };

        self.with_finalization(|| {
            for page in &normal {
                unsafe { page.as_ref() }.for_each_header(|header| self.finalize_object(header));
            }
            for page in &large {
                self.finalize_object(unsafe { page.as_ref() }.header());
            }
        });
        for page in normal {
            self.release_normal_page(page);
        }
        for page in large {
            self.release_large_page(page);
        }
        self.allocated_bytes.set(0);
    }
}

impl fmt::Debug for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapHandle")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .field("marking", &self.marking.get())
            .field("sweeping", &self.sweeping.get())
            .field("epoch", &self.epoch.get())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Heap
// ============================================================================

/// An owned garbage-collected heap.
///
/// Objects are allocated with
/// [`make_garbage_collected`](crate::make_garbage_collected) on
/// [`Heap::allocation_handle`]. Dropping the heap finalizes every remaining
/// object; persistent handles into it read back as empty afterwards.
///
/// ```
/// use std::rc::Rc;
/// use marrow_gc::{initialize_process, make_garbage_collected, GcConfig, Heap, HeapOptions};
/// use marrow_gc::{DefaultPlatform, GarbageCollected, Persistent, ProcessConfig, Trace};
///
/// #[derive(Trace, GarbageCollected)]
/// struct Node {
///     value: u32,
/// }
///
/// initialize_process(ProcessConfig::default());
/// let heap = Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default());
/// let node = make_garbage_collected(heap.allocation_handle(), Node { value: 7 });
/// let root = Persistent::new(node);
/// heap.collect_garbage(GcConfig::precise_atomic());
/// assert_eq!(root.get().map(|node| node.value), Some(7));
/// ```
pub struct Heap {
    handle: Rc<HeapHandle>,
}

impl Heap {
    /// Creates a heap.
    ///
    /// # Panics
    ///
    /// Panics if [`initialize_process`](crate::initialize_process) was not
    /// called.
    #[must_use]
    pub fn new(platform: Rc<dyn Platform>, options: HeapOptions) -> Self {
        let handle = Rc::new_cyclic(|self_ref| HeapHandle::new(platform, options, self_ref.clone()));
        #[cfg(feature = "caged-heap")]
        crate::heap::cage::set_current_cage_base(handle.process.cage.base());
        if handle.options.generational {
            write_barrier::enable_generational();
        }
        Self { handle }
    }

    /// Handle for the allocation functions.
    #[inline]
    #[must_use]
    pub fn allocation_handle(&self) -> &AllocationHandle {
        &self.handle
    }

    /// The heap's state.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &HeapHandle {
        &self.handle
    }

    /// Convenience for `collect_garbage(GcConfig::conservative_atomic())`.
    pub fn force_garbage_collection(&self) {
        self.handle.collect_garbage(GcConfig::conservative_atomic());
    }
}

impl Deref for Heap {
    type Target = HeapHandle;

    fn deref(&self) -> &HeapHandle {
        &self.handle
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.handle.tear_down();
        if self.handle.options.generational {
            write_barrier::disable_generational();
        }
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.handle, f)
    }
}
