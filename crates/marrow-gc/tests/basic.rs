//! Allocation and full atomic collections.

use std::cell::Cell;
use std::hint::black_box;
use std::rc::Rc;

use marrow_gc::testing::OverrideStackStateScope;
use marrow_gc::{
    global_metrics, initialize_process, make_garbage_collected, CollectionType, DefaultPlatform,
    GarbageCollected, GcConfig, GcPtr, Heap, HeapOptions, Member, Persistent, ProcessConfig,
    StackState, Trace,
};

fn new_heap() -> Heap {
    initialize_process(ProcessConfig::default());
    Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default())
}

#[derive(Trace, GarbageCollected)]
struct Node {
    value: u32,
    next: Member<Node>,
}

#[derive(Trace, GarbageCollected)]
struct Tracked {
    peer: Member<Tracked>,
    #[marrow_gc(ignore)]
    drops: Rc<Cell<usize>>,
}

impl Tracked {
    fn new(drops: &Rc<Cell<usize>>) -> Self {
        Self {
            peer: Member::null(),
            drops: Rc::clone(drops),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[derive(Trace, GarbageCollected)]
struct Blob {
    bytes: [u8; 64 * 1024],
    #[marrow_gc(ignore)]
    drops: Rc<Cell<usize>>,
}

impl Drop for Blob {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

fn allocate_garbage(heap: &Heap, drops: &Rc<Cell<usize>>, count: usize) {
    for _ in 0..count {
        make_garbage_collected(heap.allocation_handle(), Tracked::new(drops));
    }
}

#[test]
fn test_reachable_list_survives() {
    let heap = new_heap();
    let mut head = make_garbage_collected(
        heap.allocation_handle(),
        Node {
            value: 0,
            next: Member::null(),
        },
    );
    for value in 1..100 {
        head = make_garbage_collected(
            heap.allocation_handle(),
            Node {
                value,
                next: Member::new(head),
            },
        );
    }
    let root = Persistent::new(head);

    heap.collect_garbage(GcConfig::precise_atomic());

    let mut sum = 0;
    let mut cursor = root.get();
    while let Some(node) = cursor {
        sum += node.value;
        cursor = node.next.get();
    }
    assert_eq!(sum, (0..100).sum());
    assert_eq!(heap.metrics().objects_surviving, 100);
}

#[test]
fn test_unreachable_objects_are_finalized() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    allocate_garbage(&heap, &drops, 100);

    heap.collect_garbage(GcConfig::precise_atomic());

    assert_eq!(drops.get(), 100);
    let metrics = heap.metrics();
    assert_eq!(metrics.objects_reclaimed, 100);
    assert_eq!(metrics.collection_type, Some(CollectionType::Major));
    assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn test_cycles_are_collected() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    {
        let a = make_garbage_collected(heap.allocation_handle(), Tracked::new(&drops));
        let b = make_garbage_collected(heap.allocation_handle(), Tracked::new(&drops));
        a.peer.set(b);
        b.peer.set(a);
    }

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.get(), 2);
}

#[test]
fn test_persistent_release_makes_object_collectable() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let mut root = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Tracked::new(&drops),
    ));

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.get(), 0);
    assert!(root.get().is_some());

    root.clear();
    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.get(), 1);
}

#[test]
fn test_conservative_collection_keeps_stack_references() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let local: GcPtr<Tracked> =
        black_box(make_garbage_collected(heap.allocation_handle(), Tracked::new(&drops)));

    heap.collect_garbage(GcConfig::conservative_atomic());

    let local = black_box(local);
    assert!(heap.is_object_alive(local.as_ptr()));
    assert_eq!(drops.get(), 0);
}

#[test]
fn test_override_stack_state_makes_collection_precise() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    allocate_garbage(&heap, &drops, 10);
    {
        let _precise = OverrideStackStateScope::new(&heap, StackState::NoHeapPointers);
        heap.collect_garbage(GcConfig::conservative_atomic());
    }
    assert_eq!(drops.get(), 10);
}

#[test]
fn test_large_objects_are_reclaimed() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let kept = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Blob {
            bytes: [7; 64 * 1024],
            drops: Rc::clone(&drops),
        },
    ));
    make_garbage_collected(
        heap.allocation_handle(),
        Blob {
            bytes: [0; 64 * 1024],
            drops: Rc::clone(&drops),
        },
    );
    assert_eq!(heap.stats().large_pages, 2);

    heap.collect_garbage(GcConfig::precise_atomic());

    assert_eq!(drops.get(), 1);
    assert_eq!(heap.stats().large_pages, 1);
    assert!(kept.get().is_some_and(|blob| blob.bytes.iter().all(|&byte| byte == 7)));
}

#[test]
fn test_freed_memory_is_reused() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let _anchor = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Tracked::new(&drops),
    ));
    allocate_garbage(&heap, &drops, 1000);
    assert_eq!(heap.stats().normal_pages, 1);
    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.get(), 1000);
    assert_eq!(heap.stats().normal_pages, 1);

    allocate_garbage(&heap, &drops, 1000);
    assert_eq!(heap.stats().normal_pages, 1);
}

#[test]
fn test_heap_drop_finalizes_and_clears_persistents() {
    let drops = Rc::new(Cell::new(0));
    let root = {
        let heap = new_heap();
        let root = Persistent::new(make_garbage_collected(
            heap.allocation_handle(),
            Tracked::new(&drops),
        ));
        assert!(root.get().is_some());
        root
    };
    assert_eq!(drops.get(), 1);
    assert!(root.get().is_none());
}

#[test]
fn test_metrics_are_recorded() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let before = global_metrics().total_collections();
    allocate_garbage(&heap, &drops, 8);

    heap.collect_garbage(GcConfig::precise_atomic());
    heap.collect_garbage(GcConfig::precise_atomic());

    let metrics = heap.metrics();
    assert_eq!(metrics.total_collections, 2);
    assert_eq!(metrics.objects_reclaimed, 0);
    assert_eq!(heap.epoch(), 2);
    assert!(global_metrics().total_collections() >= before + 2);
}

#[test]
fn test_stats_count_persistents() {
    let heap = new_heap();
    let node = make_garbage_collected(
        heap.allocation_handle(),
        Node {
            value: 1,
            next: Member::null(),
        },
    );
    let _first = Persistent::new(node);
    let _second = Persistent::new(node);
    let stats = heap.stats();
    assert_eq!(stats.persistent_count, 2);
    assert!(stats.allocated_bytes >= std::mem::size_of::<Node>());
    assert!(heap.type_name(node).ends_with("Node"));
}
