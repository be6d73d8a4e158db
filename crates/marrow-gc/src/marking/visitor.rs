//! The marking visitor.

use crate::gc_info::GcInfoTable;
use crate::heap::header::HeapObjectHeader;
use crate::marking::worklists::{MarkingItem, MarkingWorklists};
use crate::member::WeakSlot;
use crate::trace::{TraceCallback, TraceDescriptor, Visitor};

/// Marks `payload` and queues it for tracing.
///
/// Returns `false` if the object was already marked. Objects still in
/// construction are marked but deferred: tracing them now could read
/// uninitialized fields.
pub(crate) fn mark_and_push(
    worklists: &MarkingWorklists,
    payload: *const u8,
    callback: TraceCallback,
) -> bool {
    let header = unsafe { HeapObjectHeader::from_payload(payload) };
    if !header.try_mark_atomic() {
        return false;
    }
    if header.is_in_construction() {
        worklists.not_fully_constructed.push(payload as usize);
    } else {
        worklists.marking.push(MarkingItem { payload, callback });
    }
    true
}

/// Visitor used by the mutator and by concurrent marking tasks.
pub(crate) struct MarkingVisitor<'a> {
    worklists: &'a MarkingWorklists,
    gc_info: &'a GcInfoTable,
    marked_bytes: usize,
}

impl<'a> MarkingVisitor<'a> {
    pub(crate) const fn new(worklists: &'a MarkingWorklists, gc_info: &'a GcInfoTable) -> Self {
        Self {
            worklists,
            gc_info,
            marked_bytes: 0,
        }
    }

    pub(crate) const fn worklists(&self) -> &'a MarkingWorklists {
        self.worklists
    }

    /// Bytes traced by this visitor so far.
    pub(crate) const fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    /// Marks the object at `payload`, looking up its trace callback.
    pub(crate) fn mark_payload(&mut self, payload: *const u8) -> bool {
        let callback = self.trace_callback_of(payload);
        mark_and_push(self.worklists, payload, callback)
    }

    fn trace_callback_of(&self, payload: *const u8) -> TraceCallback {
        let header = unsafe { HeapObjectHeader::from_payload(payload) };
        self.gc_info.get(header.gc_info_index()).trace
    }

    /// Traces a gray object.
    pub(crate) fn process_item(&mut self, item: MarkingItem) {
        let header = unsafe { HeapObjectHeader::from_payload(item.payload) };
        self.marked_bytes += header.allocated_size();
        unsafe { (item.callback)(self, item.payload) };
    }

    /// Traces a fully constructed, already marked object again.
    pub(crate) fn retrace(&mut self, payload: usize) {
        let payload = payload as *const u8;
        let callback = self.trace_callback_of(payload);
        unsafe { callback(self, payload) };
    }

    /// Publishes the bytes traced by this visitor to the worklists.
    pub(crate) fn flush_marked_bytes(&mut self) -> usize {
        let bytes = std::mem::take(&mut self.marked_bytes);
        self.worklists.add_marked_bytes(bytes);
        bytes
    }
}

impl Visitor for MarkingVisitor<'_> {
    #[inline]
    fn visit(&mut self, descriptor: TraceDescriptor) {
        mark_and_push(
            self.worklists,
            descriptor.base_object_payload,
            descriptor.callback,
        );
    }

    #[inline]
    fn visit_weak(&mut self, _descriptor: TraceDescriptor, slot: WeakSlot) {
        self.worklists.weak_slots.push(slot);
    }
}

impl Drop for MarkingVisitor<'_> {
    fn drop(&mut self) {
        self.flush_marked_bytes();
    }
}
