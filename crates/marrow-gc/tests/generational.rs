//! Minor collections, the generational barrier and the remembered set.

use std::cell::Cell;
use std::rc::Rc;

use marrow_gc::testing::is_heap_object_old;
use marrow_gc::{
    initialize_process, make_garbage_collected, CollectionType, DefaultPlatform, GarbageCollected,
    GcConfig, GcPtr, Heap, HeapHandle, HeapOptions, Member, Persistent, ProcessConfig, Trace,
    WeakMember,
};

fn new_heap() -> Heap {
    initialize_process(ProcessConfig::default());
    Heap::new(
        Rc::new(DefaultPlatform::new()),
        HeapOptions {
            generational: true,
            ..HeapOptions::default()
        },
    )
}

#[derive(Trace, GarbageCollected)]
struct Object {
    child: Member<Object>,
    weak: WeakMember<Object>,
    #[marrow_gc(ignore)]
    drops: Rc<Cell<usize>>,
}

impl Drop for Object {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

fn object(heap: &HeapHandle, drops: &Rc<Cell<usize>>) -> GcPtr<Object> {
    make_garbage_collected(
        heap,
        Object {
            child: Member::null(),
            weak: WeakMember::null(),
            drops: Rc::clone(drops),
        },
    )
}

#[test]
fn test_survivors_are_promoted() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let root = Persistent::new(object(&heap, &drops));
    assert!(!is_heap_object_old(root.get().unwrap()));

    heap.collect_garbage(GcConfig::minor_precise());

    assert!(is_heap_object_old(root.get().unwrap()));
    assert_eq!(heap.metrics().collection_type, Some(CollectionType::Minor));
}

#[test]
fn test_minor_collection_reclaims_young_garbage_only() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let mut old = Persistent::new(object(&heap, &drops));
    heap.collect_garbage(GcConfig::minor_precise());
    old.clear();

    object(&heap, &drops);
    heap.collect_garbage(GcConfig::minor_precise());
    assert_eq!(drops.get(), 1, "only the young object dies");

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.get(), 2, "a major collection reclaims old garbage");
}

#[test]
fn test_old_to_young_reference_is_remembered() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let root = Persistent::new(object(&heap, &drops));
    heap.collect_garbage(GcConfig::minor_precise());

    let young = object(&heap, &drops);
    root.get().unwrap().child.set(young);

    heap.collect_garbage(GcConfig::minor_precise());

    assert_eq!(drops.get(), 0);
    let child = root.get().unwrap().child.get().unwrap();
    assert!(is_heap_object_old(child));
}

#[test]
fn test_young_weak_target_cleared_by_minor_collection() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let root = Persistent::new(object(&heap, &drops));
    heap.collect_garbage(GcConfig::minor_precise());

    root.get().unwrap().weak.set(object(&heap, &drops));
    heap.collect_garbage(GcConfig::minor_precise());

    assert_eq!(drops.get(), 1);
    assert!(root.get().unwrap().weak.get().is_none());
}

#[test]
fn test_minor_request_on_non_generational_heap_is_major() {
    initialize_process(ProcessConfig::default());
    let heap = Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default());
    let drops = Rc::new(Cell::new(0));
    object(&heap, &drops);

    heap.collect_garbage(GcConfig::minor_precise());

    assert_eq!(heap.metrics().collection_type, Some(CollectionType::Major));
    assert_eq!(drops.get(), 1);
}
