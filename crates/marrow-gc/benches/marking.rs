//! Benchmark: marking
//!
//! Compares atomic, incremental and concurrent marking of the same live
//! object graph, and measures the cost of the write barrier while marking.

use std::hint::black_box;
use std::rc::Rc;

use criterion::{criterion_group, criterion_main, Criterion};
use marrow_gc::testing::StandaloneTestingHeap;
use marrow_gc::{
    initialize_process, make_garbage_collected, DefaultPlatform, GarbageCollected, GcConfig, GcPtr,
    Heap, HeapHandle, HeapOptions, MarkingLimits, Member, Persistent, ProcessConfig, StackState,
    Trace,
};

#[derive(Trace, GarbageCollected)]
struct Tree {
    left: Member<Tree>,
    right: Member<Tree>,
}

fn build(heap: &HeapHandle, depth: u32) -> GcPtr<Tree> {
    let node = make_garbage_collected(
        heap,
        Tree {
            left: Member::null(),
            right: Member::null(),
        },
    );
    if depth > 0 {
        node.left.set(build(heap, depth - 1));
        node.right.set(build(heap, depth - 1));
    }
    node
}

fn setup(depth: u32) -> (Heap, Persistent<Tree>) {
    initialize_process(ProcessConfig::default());
    let heap = Heap::new(
        Rc::new(DefaultPlatform::new()),
        HeapOptions {
            growing: None,
            ..HeapOptions::default()
        },
    );
    let root = Persistent::new(build(&heap, depth));
    (heap, root)
}

fn bench_atomic_marking(c: &mut Criterion) {
    let (heap, _root) = setup(14);
    c.bench_function("mark_atomic_tree_14", |b| {
        b.iter(|| heap.collect_garbage(GcConfig::precise_atomic()));
    });
}

fn bench_incremental_marking(c: &mut Criterion) {
    let (heap, _root) = setup(14);
    let testing = StandaloneTestingHeap::new(&heap);
    c.bench_function("mark_incremental_tree_14", |b| {
        b.iter(|| {
            testing.start_garbage_collection(GcConfig::precise_incremental());
            while !testing.perform_marking_step(MarkingLimits::with_max_bytes(64 * 1024)) {}
            testing.finalize_garbage_collection(StackState::NoHeapPointers);
            testing.finish_sweeping();
        });
    });
}

fn bench_concurrent_marking(c: &mut Criterion) {
    let (heap, _root) = setup(14);
    c.bench_function("mark_concurrent_tree_14", |b| {
        b.iter(|| {
            heap.start_incremental_garbage_collection(GcConfig::precise_concurrent());
            heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers);
            heap.finish_sweeping();
        });
    });
}

fn bench_write_barrier(c: &mut Criterion) {
    let (heap, root) = setup(4);
    let target = build(&heap, 0);
    let holder = root.get().expect("root is set");
    let mut group = c.benchmark_group("member_set");
    group.bench_function("idle", |b| {
        b.iter(|| holder.left.set(black_box(target)));
    });
    let testing = StandaloneTestingHeap::new(&heap);
    testing.start_garbage_collection(GcConfig::precise_incremental());
    group.bench_function("marking", |b| {
        b.iter(|| holder.left.set(black_box(target)));
    });
    group.finish();
    testing.finalize_garbage_collection(StackState::NoHeapPointers);
    testing.finish_sweeping();
}

criterion_group!(
    benches,
    bench_atomic_marking,
    bench_incremental_marking,
    bench_concurrent_marking,
    bench_write_barrier
);
criterion_main!(benches);
