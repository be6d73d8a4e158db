//! Explicit free and in-place resize through the public API.

use std::cell::Cell;
use std::rc::Rc;

use marrow_gc::{
    free_unreferenced_object, initialize_process, make_garbage_collected,
    make_garbage_collected_with_additional_bytes, resize, AdditionalBytes, DefaultPlatform,
    GarbageCollected, GcConfig, Heap, HeapOptions, ProcessConfig, Trace,
};

fn new_heap() -> Heap {
    initialize_process(ProcessConfig::default());
    Heap::new(Rc::new(DefaultPlatform::new()), HeapOptions::default())
}

#[derive(Trace, GarbageCollected)]
struct Counted {
    #[marrow_gc(ignore)]
    drops: Rc<Cell<usize>>,
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[derive(Trace, GarbageCollected)]
struct Header {
    len: usize,
}

#[test]
fn test_free_large_object_releases_page() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let object = make_garbage_collected_with_additional_bytes(
        heap.allocation_handle(),
        AdditionalBytes(100 * 1024),
        Counted {
            drops: Rc::clone(&drops),
        },
    );
    assert_eq!(heap.stats().large_pages, 1);

    unsafe { free_unreferenced_object(&heap, object) };

    assert_eq!(drops.get(), 1);
    assert_eq!(heap.stats().large_pages, 0);
    assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn test_freed_object_is_not_finalized_again() {
    let heap = new_heap();
    let drops = Rc::new(Cell::new(0));
    let object = make_garbage_collected(
        heap.allocation_handle(),
        Counted {
            drops: Rc::clone(&drops),
        },
    );
    unsafe { free_unreferenced_object(&heap, object) };
    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.get(), 1);
}

#[test]
fn test_resize_trailing_storage() {
    let heap = new_heap();
    let array = make_garbage_collected_with_additional_bytes(
        heap.allocation_handle(),
        AdditionalBytes(16),
        Header { len: 16 },
    );
    let before = heap.object_size(array);

    assert!(resize(array, AdditionalBytes(256)));
    let storage = array.trailing_storage();
    assert!(storage.len() >= 256);
    let bytes = unsafe { storage.as_ref() };
    assert!(bytes.iter().all(|&byte| byte == 0));
    assert_eq!(array.len, 16);

    assert!(resize(array, AdditionalBytes(16)));
    assert_eq!(heap.object_size(array), before);
}

#[test]
fn test_resize_refused_during_sweeping() {
    let heap = new_heap();
    let array = make_garbage_collected_with_additional_bytes(
        heap.allocation_handle(),
        AdditionalBytes(8),
        Header { len: 8 },
    );
    let _root = marrow_gc::Persistent::new(array);
    heap.collect_garbage(GcConfig::precise_incremental());
    if heap.is_sweeping() {
        assert!(!resize(array, AdditionalBytes(64)));
        heap.finish_sweeping();
    }
    assert!(!heap.is_sweeping());
}
