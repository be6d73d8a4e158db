//! Integration tests for the `tracing` feature.
//!
//! A capturing layer records the names of spans and events emitted while a
//! collection runs.

#![cfg(feature = "tracing")]

use std::rc::Rc;
use std::sync::{Arc, Mutex};

use marrow_gc::{
    initialize_process, make_garbage_collected, DefaultPlatform, GarbageCollected, GcConfig, Heap,
    HeapOptions, Member, Persistent, ProcessConfig, Trace,
};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

#[derive(Clone, Default)]
struct Capture {
    names: Arc<Mutex<Vec<String>>>,
}

impl Capture {
    fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap()
            .iter()
            .any(|recorded| recorded == name)
    }
}

impl<S: Subscriber> Layer<S> for Capture {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.names
            .lock()
            .unwrap()
            .push(attrs.metadata().name().to_owned());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        event.record(&mut |field: &tracing::field::Field, value: &dyn std::fmt::Debug| {
            if field.name() == "message" {
                message = format!("{value:?}");
            }
        });
        self.names.lock().unwrap().push(message);
    }
}

#[derive(Trace, GarbageCollected)]
struct Node {
    next: Member<Node>,
}

fn with_capture(run: impl FnOnce()) -> Capture {
    let capture = Capture::default();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    tracing::subscriber::with_default(subscriber, run);
    capture
}

#[test]
fn test_atomic_collection_emits_spans() {
    let capture = with_capture(|| {
        initialize_process(ProcessConfig::default());
        let heap = Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default());
        let tail = make_garbage_collected(heap.allocation_handle(), Node { next: Member::null() });
        let _root = Persistent::new(make_garbage_collected(
            heap.allocation_handle(),
            Node {
                next: Member::new(tail),
            },
        ));
        heap.collect_garbage(GcConfig::precise_atomic());
    });

    assert!(capture.contains("gc_collect"));
    assert!(capture.contains("gc_phase"));
    assert!(capture.contains("phase_end"));
}

#[test]
fn test_incremental_collection_logs_steps() {
    let capture = with_capture(|| {
        initialize_process(ProcessConfig::default());
        let platform = Rc::new(DefaultPlatform::new());
        let heap = Heap::new(platform.clone(), HeapOptions::default());
        let _root = Persistent::new(make_garbage_collected(
            heap.allocation_handle(),
            Node { next: Member::null() },
        ));
        heap.start_incremental_garbage_collection(GcConfig::precise_incremental());
        platform.run_until_idle();
        heap.finalize_incremental_garbage_collection_if_running(marrow_gc::StackState::NoHeapPointers);
        heap.finish_sweeping();
    });

    assert!(capture.contains("incremental_step"));
}

#[test]
fn test_collections_without_subscriber() {
    initialize_process(ProcessConfig::default());
    let heap = Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default());
    for _ in 0..3 {
        make_garbage_collected(heap.allocation_handle(), Node { next: Member::null() });
        heap.collect_garbage(GcConfig::precise_atomic());
    }
    assert_eq!(heap.metrics().total_collections, 3);
}
