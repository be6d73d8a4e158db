//! `#[derive(Trace, GarbageCollected)]` on structs, enums and generics.

use std::cell::Cell;
use std::rc::Rc;

use marrow_gc::{
    initialize_process, make_garbage_collected, DefaultPlatform, GarbageCollected, GcConfig, Heap,
    HeapOptions, Member, Persistent, ProcessConfig, SpaceKind, Trace, TraceDescriptor, Visitor,
    WeakMember, WeakSlot,
};

#[derive(Default)]
struct CountingVisitor {
    strong: usize,
    weak: usize,
}

impl Visitor for CountingVisitor {
    fn visit(&mut self, _descriptor: TraceDescriptor) {
        self.strong += 1;
    }

    fn visit_weak(&mut self, _descriptor: TraceDescriptor, _slot: WeakSlot) {
        self.weak += 1;
    }
}

fn new_heap(custom_spaces: usize) -> Heap {
    initialize_process(ProcessConfig::default());
    Heap::new(
        Rc::new(DefaultPlatform::new()),
        HeapOptions {
            custom_spaces,
            ..HeapOptions::default()
        },
    )
}

#[derive(Trace, GarbageCollected)]
struct Leaf {
    value: u64,
}

#[derive(Trace, GarbageCollected)]
enum Shape {
    Empty,
    One(Member<Leaf>),
    Two {
        first: Member<Leaf>,
        second: WeakMember<Leaf>,
    },
}

#[derive(Trace, GarbageCollected)]
struct Boxed<T: GarbageCollected> {
    item: Member<T>,
    extra: Vec<Member<T>>,
}

#[derive(Trace, GarbageCollected)]
struct WithIgnored {
    traced: Member<Leaf>,
    #[marrow_gc(ignore)]
    untraced: Cell<usize>,
}

#[derive(Trace, GarbageCollected)]
#[marrow_gc(space = 0)]
struct InCustomSpace {
    next: Member<InCustomSpace>,
}

#[test]
fn test_enum_variants_trace_their_fields() {
    let heap = new_heap(0);
    let leaf = make_garbage_collected(heap.allocation_handle(), Leaf { value: 1 });

    let mut visitor = CountingVisitor::default();
    Shape::Empty.trace(&mut visitor);
    Shape::One(Member::new(leaf)).trace(&mut visitor);
    Shape::Two {
        first: Member::new(leaf),
        second: WeakMember::new(leaf),
    }
    .trace(&mut visitor);

    assert_eq!(visitor.strong, 2);
    assert_eq!(visitor.weak, 1);
}

#[test]
fn test_generic_struct_traces_collections() {
    let heap = new_heap(0);
    let leaves: Vec<_> = (0..3)
        .map(|value| make_garbage_collected(heap.allocation_handle(), Leaf { value }))
        .collect();
    let boxed = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Boxed {
            item: Member::new(leaves[0]),
            extra: leaves[1..].iter().copied().map(Member::new).collect(),
        },
    ));

    heap.collect_garbage(GcConfig::precise_atomic());

    let boxed = boxed.get().unwrap();
    assert_eq!(boxed.item.get().map(|leaf| leaf.value), Some(0));
    let extra: Vec<u64> = boxed
        .extra
        .iter()
        .filter_map(|member| member.get().map(|leaf| leaf.value))
        .collect();
    assert_eq!(extra, vec![1, 2]);
}

#[test]
fn test_ignored_fields_are_skipped() {
    let heap = new_heap(0);
    let leaf = make_garbage_collected(heap.allocation_handle(), Leaf { value: 9 });
    let object = WithIgnored {
        traced: Member::new(leaf),
        untraced: Cell::new(3),
    };
    let mut visitor = CountingVisitor::default();
    object.trace(&mut visitor);
    assert_eq!(visitor.strong, 1);
    assert_eq!(object.untraced.get(), 3);
}

#[test]
fn test_custom_space_attribute() {
    assert_eq!(InCustomSpace::SPACE, SpaceKind::Custom(0));
    assert_eq!(Leaf::SPACE, SpaceKind::Regular);

    let heap = new_heap(1);
    let tail = make_garbage_collected(
        heap.allocation_handle(),
        InCustomSpace {
            next: Member::null(),
        },
    );
    let head = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        InCustomSpace {
            next: Member::new(tail),
        },
    ));

    heap.collect_garbage(GcConfig::precise_atomic());

    assert!(head.get().unwrap().next.get().is_some());
    assert_eq!(heap.metrics().objects_surviving, 2);
}
