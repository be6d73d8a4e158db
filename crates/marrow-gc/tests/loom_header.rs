//! Loom tests for the atomic protocol of object headers.
//!
//! The header packs the mark bit and the in-construction bit into two
//! 16-bit atomics. These models replay the same bit operations and orderings
//! on loom atomics to check what a background marker may observe.

use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicU16, Ordering};
use loom::sync::Arc;

const MARK_BIT: u16 = 1;
const IN_CONSTRUCTION_BIT: u16 = 1 << 15;

struct ModelHeader {
    encoded_low: AtomicU16,
    encoded_high: AtomicU16,
    payload: UnsafeCell<u64>,
}

impl ModelHeader {
    fn new() -> Self {
        Self {
            encoded_low: AtomicU16::new(0),
            encoded_high: AtomicU16::new(IN_CONSTRUCTION_BIT),
            payload: UnsafeCell::new(0),
        }
    }

    fn try_mark_atomic(&self) -> bool {
        self.encoded_low.fetch_or(MARK_BIT, Ordering::AcqRel) & MARK_BIT == 0
    }

    fn is_in_construction(&self) -> bool {
        self.encoded_high.load(Ordering::Acquire) & IN_CONSTRUCTION_BIT != 0
    }

    fn mark_as_fully_constructed(&self) {
        self.encoded_high
            .fetch_and(!IN_CONSTRUCTION_BIT, Ordering::Release);
    }
}

/// Two markers racing on the same object: exactly one wins.
#[test]
#[ignore = "loom test - run with cargo test --test loom_header --release -- --ignored"]
fn test_only_one_marker_wins() {
    loom::model(|| {
        let header = Arc::new(ModelHeader::new());
        let markers: Vec<_> = (0..2)
            .map(|_| {
                let header = Arc::clone(&header);
                loom::thread::spawn(move || header.try_mark_atomic())
            })
            .collect();
        let wins = markers
            .into_iter()
            .map(|marker| marker.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    });
}

/// A marker that sees the object as fully constructed also sees its payload.
#[test]
#[ignore = "loom test - run with cargo test --test loom_header --release -- --ignored"]
fn test_constructed_payload_is_visible_to_marker() {
    loom::model(|| {
        let header = Arc::new(ModelHeader::new());

        let marker = loom::thread::spawn({
            let header = Arc::clone(&header);
            move || {
                if !header.try_mark_atomic() || header.is_in_construction() {
                    // Deferred to the atomic pause.
                    return None;
                }
                Some(header.payload.with(|payload| unsafe { *payload }))
            }
        });

        header.payload.with_mut(|payload| unsafe { *payload = 42 });
        header.mark_as_fully_constructed();

        if let Some(value) = marker.join().unwrap() {
            assert_eq!(value, 42);
        }
    });
}
