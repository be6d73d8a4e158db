//! A tracing, non-moving garbage collector for Rust.
//!
//! `marrow-gc` manages objects on explicitly created [`Heap`]s. Objects are
//! allocated with [`make_garbage_collected`], refer to each other through
//! [`Member`] fields, and are kept alive from the outside by [`Persistent`]
//! handles. Unreachable objects are finalized and their memory reused; live
//! objects never move.
//!
//! # Features
//!
//! - **Incremental and concurrent marking**: marking runs in bounded steps
//!   on the heap's thread and on background tasks, kept correct by a
//!   Dijkstra-style write barrier in [`Member::set`].
//! - **Conservative stack scanning**: collections may treat the native
//!   stack as a root, so plain [`GcPtr`]s held in locals stay alive.
//! - **Weak references**: [`WeakMember`] and [`WeakPersistent`] are cleared
//!   when their target dies.
//! - **Generational collection**: minor collections that only trace young
//!   objects, with a remembered set fed by the generational barrier.
//! - **Explicit management**: [`free_unreferenced_object`] and [`resize`]
//!   for embedders that know better than the collector.
//!
//! # Quick Start
//!
//! ```
//! use std::rc::Rc;
//! use marrow_gc::{
//!     initialize_process, make_garbage_collected, DefaultPlatform, GarbageCollected, GcConfig,
//!     Heap, HeapOptions, Member, Persistent, ProcessConfig, Trace,
//! };
//!
//! #[derive(Trace, GarbageCollected)]
//! struct Node {
//!     value: i32,
//!     next: Member<Node>,
//! }
//!
//! initialize_process(ProcessConfig::default());
//! let heap = Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default());
//!
//! let tail = make_garbage_collected(heap.allocation_handle(), Node { value: 2, next: Member::null() });
//! let head = make_garbage_collected(heap.allocation_handle(), Node { value: 1, next: Member::new(tail) });
//! let root = Persistent::new(head);
//!
//! heap.collect_garbage(GcConfig::precise_atomic());
//! let head = root.get().unwrap();
//! assert_eq!(head.next.get().map(|next| next.value), Some(2));
//! ```
//!
//! # Threads
//!
//! A heap and its objects belong to the thread that created the heap.
//! Only marking work is offloaded to background threads, through the
//! embedder's [`Platform`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod compression;
mod gc;
mod gc_info;
/// Heap memory management internals.
///
/// This module is public for diagnostics and advanced use cases. Most users
/// only need the re-exports at the crate root.
pub mod heap;
mod marking;
mod member;
mod metrics;
mod persistent;
pub mod platform;
mod process;
mod ptr;
pub mod stack;
pub mod testing;
mod trace;
pub mod tracing;

pub use gc::{
    CollectionType, DisallowGarbageCollectionScope, FreeMemoryHandling, GcConfig, MarkingType,
    NoGarbageCollectionScope, StackState, StackSupport, SweepingType,
};
pub use gc_info::{FinalizationCallback, GcInfo, GcInfoIndex, GcInfoTable};
pub use heap::{
    free_unreferenced_object, make_garbage_collected, make_garbage_collected_with,
    make_garbage_collected_with_additional_bytes, resize, AdditionalBytes, AllocationHandle,
    ConstructionSlot, Heap, HeapGrowingConfig, HeapHandle, HeapObjectHeader, HeapOptions,
    HeapStatistics, SpaceKind,
};
#[cfg(feature = "test-util")]
pub use heap::base::DebugCounters;
pub use marking::{
    dijkstra_marking_barrier_range, generational_barrier_for_source_object,
    is_any_incremental_or_concurrent_marking, steele_marking_barrier, MarkerState, MarkingLimits,
};
pub use member::{
    BasicMember, Member, MemberKind, Strong, UntracedMember, Untraced, Weak, WeakMember, WeakSlot,
    SENTINEL_POINTER,
};
pub use metrics::{global_metrics, GcMetrics, GlobalMetrics, PhaseTimer};
pub use persistent::{BasicPersistent, Persistent, PersistentKind, WeakPersistent};
pub use platform::{DefaultPlatform, PageAllocator, Platform, TaskRunner};
pub use process::{initialize_process, is_process_initialized, shutdown_process, ProcessConfig};
pub use ptr::GcPtr;
pub use trace::{trace_callback, GarbageCollected, Trace, TraceCallback, TraceDescriptor, Visitor};

// Re-export derive macros when the feature is enabled
#[cfg(feature = "derive")]
pub use marrow_gc_derive::{GarbageCollected, Trace};
