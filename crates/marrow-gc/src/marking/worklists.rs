//! Marking worklists.
//!
//! All worklists are lock-free queues shared by the mutator, the write
//! barrier and concurrent marking tasks. They are owned by the heap for its
//! whole lifetime and emptied at the start of every cycle.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use crate::member::WeakSlot;
use crate::trace::TraceCallback;

/// A gray object: marked, with outgoing references still to be traced.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MarkingItem {
    pub(crate) payload: *const u8,
    pub(crate) callback: TraceCallback,
}

#[derive(Debug, Default)]
pub(crate) struct MarkingWorklists {
    /// Gray objects.
    pub(crate) marking: SegQueue<MarkingItem>,
    /// Marked objects found while still in construction.
    pub(crate) not_fully_constructed: SegQueue<usize>,
    /// Black objects whose contents changed and must be traced again.
    pub(crate) retrace: SegQueue<usize>,
    /// Weak slots to process once marking is done.
    pub(crate) weak_slots: SegQueue<WeakSlot>,
    marked_bytes: AtomicUsize,
}

// Items are addresses of managed objects; every thread touching them follows
// the marking protocol.
unsafe impl Send for MarkingWorklists {}
unsafe impl Sync for MarkingWorklists {}

impl MarkingWorklists {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no traceable work is left. Deferred objects still
    /// in construction do not count.
    pub(crate) fn is_drained(&self) -> bool {
        self.marking.is_empty() && self.retrace.is_empty()
    }

    pub(crate) fn add_marked_bytes(&self, bytes: usize) {
        self.marked_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::Relaxed)
    }

    /// Drops all pending work.
    pub(crate) fn clear(&self) {
        while self.marking.pop().is_some() {}
        while self.not_fully_constructed.pop().is_some() {}
        while self.retrace.pop().is_some() {}
        while self.weak_slots.pop().is_some() {}
        self.marked_bytes.store(0, Ordering::Relaxed);
    }
}
