//! Weak members and weak persistents.

use std::rc::Rc;

use marrow_gc::{
    initialize_process, make_garbage_collected, DefaultPlatform, GarbageCollected, GcConfig, Heap,
    HeapOptions, Member, Persistent, ProcessConfig, Trace, WeakMember, WeakPersistent,
};

fn new_heap() -> Heap {
    initialize_process(ProcessConfig::default());
    Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default())
}

#[derive(Trace, GarbageCollected)]
struct Target {
    id: u32,
}

#[derive(Trace, GarbageCollected)]
struct Holder {
    strong: Member<Target>,
    weak: WeakMember<Target>,
}

#[derive(Trace, GarbageCollected)]
struct Cache {
    entries: Vec<WeakMember<Target>>,
}

#[test]
fn test_weak_member_cleared_when_target_dies() {
    let heap = new_heap();
    let target = make_garbage_collected(heap.allocation_handle(), Target { id: 1 });
    let holder = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Holder {
            strong: Member::null(),
            weak: WeakMember::new(target),
        },
    ));

    heap.collect_garbage(GcConfig::precise_atomic());

    let holder = holder.get().unwrap();
    assert!(holder.weak.get().is_none());
    assert!(holder.weak.is_null());
    assert_eq!(heap.metrics().weak_references_cleared, 1);
}

#[test]
fn test_weak_member_kept_while_strongly_reachable() {
    let heap = new_heap();
    let target = make_garbage_collected(heap.allocation_handle(), Target { id: 2 });
    let holder = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Holder {
            strong: Member::new(target),
            weak: WeakMember::new(target),
        },
    ));

    heap.collect_garbage(GcConfig::precise_atomic());

    let holder = holder.get().unwrap();
    assert_eq!(holder.weak.get().map(|target| target.id), Some(2));
    assert!(holder.weak == holder.strong);
}

#[test]
fn test_weak_members_in_collections() {
    let heap = new_heap();
    let kept = Persistent::new(make_garbage_collected(heap.allocation_handle(), Target { id: 0 }));
    let entries = (1..=4)
        .map(|id| WeakMember::new(make_garbage_collected(heap.allocation_handle(), Target { id })))
        .chain(std::iter::once(WeakMember::new(kept.get())))
        .collect();
    let cache = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Cache { entries },
    ));

    heap.collect_garbage(GcConfig::precise_atomic());

    let cache = cache.get().unwrap();
    let live: Vec<u32> = cache
        .entries
        .iter()
        .filter_map(|entry| entry.get().map(|target| target.id))
        .collect();
    assert_eq!(live, vec![0]);
}

#[test]
fn test_weak_persistent_cleared() {
    let heap = new_heap();
    let target = make_garbage_collected(heap.allocation_handle(), Target { id: 3 });
    let weak = WeakPersistent::new(target);
    assert_eq!(heap.stats().weak_persistent_count, 1);

    heap.collect_garbage(GcConfig::precise_atomic());

    assert!(weak.get().is_none());
}

#[test]
fn test_weak_persistent_does_not_keep_target_alive_but_follows_strong_root() {
    let heap = new_heap();
    let target = make_garbage_collected(heap.allocation_handle(), Target { id: 4 });
    let strong = Persistent::new(target);
    let weak = WeakPersistent::new(target);

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(weak.get().map(|target| target.id), Some(4));

    drop(strong);
    heap.collect_garbage(GcConfig::precise_atomic());
    assert!(weak.get().is_none());
}

#[test]
fn test_sentinel_is_not_traced_or_cleared() {
    let heap = new_heap();
    let holder = Persistent::new(make_garbage_collected(
        heap.allocation_handle(),
        Holder {
            strong: Member::sentinel(),
            weak: WeakMember::sentinel(),
        },
    ));

    heap.collect_garbage(GcConfig::precise_atomic());

    let holder = holder.get().unwrap();
    assert!(holder.strong.is_sentinel());
    assert!(holder.weak.is_sentinel());
    assert!(holder.weak.get().is_none());
}
