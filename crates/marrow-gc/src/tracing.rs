//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for garbage collection operations. The crate
//! never installs a subscriber. Without the feature every helper compiles to
//! a no-op.

/// High-level GC phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Reset mark bits left over from the previous cycle.
    Clear,
    /// Trace the live object graph.
    Mark,
    /// Clear weak references to unmarked objects.
    Weak,
    /// Reclaim unreachable objects.
    Sweep,
}

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use ::tracing::{span, Level};

    use super::GcPhase;

    /// Stable identifier for a GC run.
    ///
    /// Correlates all events within a single collection. Ids start at 1 and
    /// increase monotonically across every heap of the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    pub(crate) fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection.
    pub(crate) fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Span covering one phase of a collection.
    pub(crate) fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    pub(crate) fn log_phase_end(phase: GcPhase, bytes: usize) {
        ::tracing::debug!(phase = ?phase, bytes, "phase_end");
    }

    pub(crate) fn log_incremental_step(marked_bytes: usize, done: bool) {
        ::tracing::debug!(marked_bytes, done, "incremental_step");
    }

    pub(crate) fn log_concurrent_marker(started: bool, tasks: usize) {
        if started {
            ::tracing::debug!(tasks, "concurrent_marker_start");
        } else {
            ::tracing::debug!(tasks, "concurrent_marker_stop");
        }
    }

    pub(crate) fn log_page_allocated(large: bool, address: usize) {
        ::tracing::trace!(large, address = format_args!("{address:#x}"), "page_allocated");
    }

    pub(crate) fn log_page_released(large: bool, address: usize) {
        ::tracing::trace!(large, address = format_args!("{address:#x}"), "page_released");
    }

    pub(crate) fn log_region_reserved(start: usize, len: usize, large: bool) {
        ::tracing::debug!(start = format_args!("{start:#x}"), len, large, "region_reserved");
    }

    pub(crate) fn log_cage_reserved(base: usize, size: usize) {
        ::tracing::debug!(base = format_args!("{base:#x}"), size, "cage_reserved");
    }

    pub(crate) fn log_fatal(reason: &str, size: usize) {
        ::tracing::error!(reason, size, "fatal_out_of_memory");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub(crate) mod internal {
    use super::GcPhase;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stand-in for an entered span.
    #[derive(Debug)]
    pub(crate) struct NoopSpan;

    pub(crate) fn next_gc_id() -> GcId {
        GcId(0)
    }

    pub(crate) fn trace_gc_collection(_collection_type: &str, _gc_id: GcId) -> NoopSpan {
        NoopSpan
    }

    pub(crate) fn trace_phase(_phase: GcPhase) -> NoopSpan {
        NoopSpan
    }

    pub(crate) fn log_phase_end(_phase: GcPhase, _bytes: usize) {}

    pub(crate) fn log_incremental_step(_marked_bytes: usize, _done: bool) {}

    pub(crate) fn log_concurrent_marker(_started: bool, _tasks: usize) {}

    pub(crate) fn log_page_allocated(_large: bool, _address: usize) {}

    pub(crate) fn log_page_released(_large: bool, _address: usize) {}

    pub(crate) fn log_region_reserved(_start: usize, _len: usize, _large: bool) {}

    pub(crate) fn log_cage_reserved(_base: usize, _size: usize) {}

    pub(crate) fn log_fatal(_reason: &str, _size: usize) {}
}

pub use internal::GcId;
