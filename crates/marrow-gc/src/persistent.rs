//! Root handles.
//!
//! [`Persistent`] and [`WeakPersistent`] live outside the managed heap, in
//! Rust-owned memory. Each non-empty handle owns a node in its heap's
//! persistent region; the marker visits every used node of the strong
//! region on each cycle and clears weak nodes whose target ended up unmarked.
//!
//! Dropping the heap clears every node, so handles that outlive their heap
//! read back as empty.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::heap::header::HeapObjectHeader;
use crate::heap::page::BasePage;
use crate::member::{sealed, Strong, Weak, SENTINEL_POINTER};
use crate::ptr::GcPtr;
use crate::trace::{trace_callback, GarbageCollected, TraceCallback, TraceDescriptor, Visitor};

const NODES_PER_BLOCK: usize = 256;

// ============================================================================
// Persistent region
// ============================================================================

#[derive(Default)]
struct PersistentNode {
    object: Cell<usize>,
    // `None` marks a free node.
    trace: Cell<Option<TraceCallback>>,
    next_free: Cell<Option<NonNull<PersistentNode>>>,
}

type NodeBlock = [PersistentNode; NODES_PER_BLOCK];

/// Node storage for one kind of persistent handle of one heap.
///
/// Nodes are allocated in fixed blocks that never move and are recycled
/// through an intrusive free list.
pub(crate) struct PersistentRegion {
    blocks: RefCell<Vec<Box<NodeBlock>>>,
    free_list: Cell<Option<NonNull<PersistentNode>>>,
    used: Cell<usize>,
}

impl PersistentRegion {
    pub(crate) fn new() -> Self {
        Self {
            blocks: RefCell::new(Vec::new()),
            free_list: Cell::new(None),
            used: Cell::new(0),
        }
    }

    fn allocate_node(&self, object: usize, trace: TraceCallback) -> NonNull<PersistentNode> {
        if self.free_list.get().is_none() {
            self.grow();
        }
        let Some(node) = self.free_list.get() else {
            unreachable!("persistent region grew without free nodes");
        };
        let node_ref = unsafe { node.as_ref() };
        self.free_list.set(node_ref.next_free.take());
        node_ref.object.set(object);
        node_ref.trace.set(Some(trace));
        self.used.set(self.used.get() + 1);
        node
    }

    fn grow(&self) {
        let block: Box<NodeBlock> = Box::new(std::array::from_fn(|_| PersistentNode::default()));
        for node in block.iter().rev() {
            node.next_free.set(self.free_list.get());
            self.free_list.set(Some(NonNull::from(node)));
        }
        self.blocks.borrow_mut().push(block);
    }

    fn free_node(&self, node: NonNull<PersistentNode>) {
        let node_ref = unsafe { node.as_ref() };
        debug_assert!(node_ref.trace.get().is_some(), "double free of a persistent node");
        node_ref.object.set(0);
        node_ref.trace.set(None);
        node_ref.next_free.set(self.free_list.get());
        self.free_list.set(Some(node));
        self.used.set(self.used.get() - 1);
    }

    fn for_each_used(&self, mut f: impl FnMut(&PersistentNode, TraceCallback)) {
        for block in self.blocks.borrow().iter() {
            for node in block.iter() {
                if let Some(trace) = node.trace.get() {
                    f(node, trace);
                }
            }
        }
    }

    /// Number of nodes in use.
    pub(crate) fn node_count(&self) -> usize {
        self.used.get()
    }

    /// Reports every live target to `visitor` as a strong root.
    pub(crate) fn trace(&self, visitor: &mut dyn Visitor) {
        self.for_each_used(|node, trace| {
            let object = node.object.get();
            if object != 0 && object != SENTINEL_POINTER {
                visitor.visit(TraceDescriptor {
                    base_object_payload: object as *const u8,
                    callback: trace,
                });
            }
        });
    }

    /// Clears every node whose target is not marked.
    pub(crate) fn clear_unmarked(&self) -> usize {
        let mut cleared = 0;
        self.for_each_used(|node, _| {
            let object = node.object.get();
            if object == 0 || object == SENTINEL_POINTER {
                return;
            }
            let header = unsafe { HeapObjectHeader::from_payload(object as *const u8) };
            if !header.is_marked() {
                node.object.set(0);
                cleared += 1;
            }
        });
        cleared
    }

    /// Empties every node; used when the heap goes away.
    pub(crate) fn clear_all(&self) {
        self.for_each_used(|node, _| node.object.set(0));
    }
}

impl fmt::Debug for PersistentRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentRegion")
            .field("used", &self.used.get())
            .field("blocks", &self.blocks.borrow().len())
            .finish()
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Tagging trait selecting strong or weak persistent semantics.
pub trait PersistentKind: sealed::Sealed + 'static {
    /// Whether the handle is weak.
    const IS_WEAK: bool;
}

impl PersistentKind for Strong {
    const IS_WEAK: bool = false;
}

impl PersistentKind for Weak {
    const IS_WEAK: bool = true;
}

enum Slot {
    Empty,
    Sentinel,
    Node {
        region: Rc<PersistentRegion>,
        node: NonNull<PersistentNode>,
    },
}

/// A root handle living outside the managed heap.
pub struct BasicPersistent<T: GarbageCollected, K: PersistentKind> {
    slot: Slot,
    _marker: PhantomData<(*const T, K)>,
}

/// A strong root: keeps its target alive.
pub type Persistent<T> = BasicPersistent<T, Strong>;

/// A weak root: cleared once its target is no longer reachable otherwise.
pub type WeakPersistent<T> = BasicPersistent<T, Weak>;

impl<T: GarbageCollected, K: PersistentKind> BasicPersistent<T, K> {
    /// Creates a handle to `value`, registering it with the heap owning
    /// `value`.
    #[must_use]
    pub fn new(value: impl Into<Option<GcPtr<T>>>) -> Self {
        Self {
            slot: Self::slot_for(value.into()),
            _marker: PhantomData,
        }
    }

    /// Creates an empty handle.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            slot: Slot::Empty,
            _marker: PhantomData,
        }
    }

    /// Creates a handle holding the sentinel.
    #[must_use]
    pub const fn sentinel() -> Self {
        Self {
            slot: Slot::Sentinel,
            _marker: PhantomData,
        }
    }

    fn slot_for(value: Option<GcPtr<T>>) -> Slot {
        let Some(value) = value else {
            return Slot::Empty;
        };
        let payload = value.as_ptr().cast::<u8>();
        // SAFETY: `value` is a live managed object, so its page and heap are.
        let heap = unsafe { BasePage::from_payload(payload).heap() };
        let region = Rc::clone(heap.persistent_region(K::IS_WEAK));
        let node = region.allocate_node(payload as usize, trace_callback::<T>);
        Slot::Node { region, node }
    }

    /// Returns the target, or `None` if the handle is empty, holds the
    /// sentinel, or was cleared.
    #[must_use]
    pub fn get(&self) -> Option<GcPtr<T>> {
        match &self.slot {
            Slot::Node { node, .. } => {
                let object = unsafe { node.as_ref() }.object.get();
                NonNull::new(object as *mut T).map(|ptr| unsafe { GcPtr::from_raw(ptr) })
            }
            Slot::Empty | Slot::Sentinel => None,
        }
    }

    /// Points the handle at `value`.
    pub fn set(&mut self, value: impl Into<Option<GcPtr<T>>>) {
        let value = value.into();
        if let (Slot::Node { region, node }, Some(ptr)) = (&self.slot, value) {
            // Reuse the node when the new target lives on the same heap.
            let payload = ptr.as_ptr().cast::<u8>();
            let heap = unsafe { BasePage::from_payload(payload).heap() };
            if Rc::ptr_eq(region, heap.persistent_region(K::IS_WEAK)) {
                unsafe { node.as_ref() }.object.set(payload as usize);
                return;
            }
        }
        self.clear();
        self.slot = Self::slot_for(value);
    }

    /// Makes the handle hold the sentinel.
    pub fn set_sentinel(&mut self) {
        self.clear();
        self.slot = Slot::Sentinel;
    }

    /// Empties the handle.
    pub fn clear(&mut self) {
        if let Slot::Node { region, node } = std::mem::replace(&mut self.slot, Slot::Empty) {
            region.free_node(node);
        }
    }

    /// Empties the handle and returns its previous target.
    pub fn release(&mut self) -> Option<GcPtr<T>> {
        let value = self.get();
        self.clear();
        value
    }

    /// Returns `true` if the handle holds the sentinel.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        matches!(self.slot, Slot::Sentinel)
    }
}

impl<T: GarbageCollected, K: PersistentKind> Drop for BasicPersistent<T, K> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: GarbageCollected, K: PersistentKind> Default for BasicPersistent<T, K> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: GarbageCollected, K: PersistentKind> Clone for BasicPersistent<T, K> {
    fn clone(&self) -> Self {
        match self.slot {
            Slot::Sentinel => Self::sentinel(),
            _ => Self::new(self.get()),
        }
    }
}

impl<T: GarbageCollected, K: PersistentKind> From<GcPtr<T>> for BasicPersistent<T, K> {
    fn from(value: GcPtr<T>) -> Self {
        Self::new(value)
    }
}

impl<T: GarbageCollected, K: PersistentKind> fmt::Debug for BasicPersistent<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if K::IS_WEAK { "WeakPersistent" } else { "Persistent" };
        match (&self.slot, self.get()) {
            (Slot::Sentinel, _) => write!(f, "{kind}(sentinel)"),
            (_, Some(ptr)) => write!(f, "{kind}({:p})", ptr.as_ptr()),
            (_, None) => write!(f, "{kind}(null)"),
        }
    }
}
