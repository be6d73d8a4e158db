//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::gc::{CollectionType, MarkingType, SweepingType};

/// Statistics from the most recent completed collection of a heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcMetrics {
    /// Kind of the collection, `None` before the first one completed.
    pub collection_type: Option<CollectionType>,
    /// How marking was performed.
    pub marking_type: MarkingType,
    /// How sweeping was performed.
    pub sweeping_type: SweepingType,
    /// Total time spent in the cycle, across all steps and tasks on the
    /// heap's thread.
    pub duration: Duration,
    /// Duration of the clear phase.
    pub clear_duration: Duration,
    /// Duration of the mark phase, incremental steps included.
    pub mark_duration: Duration,
    /// Duration of the atomic pause.
    pub atomic_pause_duration: Duration,
    /// Duration of weak processing.
    pub weak_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Bytes found live by marking, headers included.
    pub marked_bytes: usize,
    /// Bytes returned to free lists or the page pool.
    pub bytes_reclaimed: usize,
    /// Number of objects finalized and reclaimed.
    pub objects_reclaimed: usize,
    /// Number of objects that survived.
    pub objects_surviving: usize,
    /// Number of weak members and weak persistents cleared.
    pub weak_references_cleared: usize,
    /// Write barrier slow-path calls on this heap while the cycle was
    /// marking.
    ///
    /// Every barrier call that reaches a marking heap counts once, whether
    /// or not the stored value was already marked. Range and retrace
    /// barriers count once per call.
    pub barrier_slow_path_hits: usize,
    /// Incremental marking steps executed before the atomic pause.
    pub incremental_steps: usize,
    /// Collections completed by this heap so far.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Creates metrics with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collection_type: None,
            marking_type: MarkingType::Atomic,
            sweeping_type: SweepingType::Atomic,
            duration: Duration::ZERO,
            clear_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            atomic_pause_duration: Duration::ZERO,
            weak_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            marked_bytes: 0,
            bytes_reclaimed: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            weak_references_cleared: 0,
            barrier_slow_path_hits: 0,
            incremental_steps: 0,
            total_collections: 0,
        }
    }
}

/// Accumulates phase durations across the steps of one cycle.
///
/// ```
/// use marrow_gc::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... mark some objects ...
/// let elapsed = timer.stop();
/// assert!(elapsed <= timer.total());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    total: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Creates a timer with nothing recorded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total: Duration::ZERO,
            current_start: None,
        }
    }

    /// Starts timing a slice of the phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Ends the current slice and returns its duration.
    pub fn stop(&mut self) -> Duration {
        let elapsed = self
            .current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed());
        self.total += elapsed;
        elapsed
    }

    /// Adds a slice measured elsewhere.
    pub fn add(&mut self, elapsed: Duration) {
        self.total += elapsed;
    }

    /// Sum of all completed slices.
    #[must_use]
    pub const fn total(&self) -> Duration {
        self.total
    }
}

/// Process-level cumulative GC statistics.
///
/// Counters are summed over every heap of the process.
///
/// ```
/// use marrow_gc::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Total collections: {}", metrics.total_collections());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    minor_collections: AtomicUsize,
    major_collections: AtomicUsize,
    incremental_collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Creates counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            minor_collections: AtomicUsize::new(0),
            major_collections: AtomicUsize::new(0),
            incremental_collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, metrics: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        match metrics.collection_type {
            Some(CollectionType::Minor) => {
                self.minor_collections.fetch_add(1, Ordering::Relaxed);
            }
            Some(CollectionType::Major) | None => {
                self.major_collections.fetch_add(1, Ordering::Relaxed);
            }
        }
        if metrics.marking_type != MarkingType::Atomic {
            self.incremental_collections.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed, Ordering::Relaxed);
        self.objects_reclaimed
            .fetch_add(metrics.objects_reclaimed, Ordering::Relaxed);
        let pause = u64::try_from(metrics.atomic_pause_duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(pause, Ordering::Relaxed);
    }

    /// Returns the total number of collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of minor collections performed.
    #[inline]
    #[must_use]
    pub fn total_minor_collections(&self) -> usize {
        self.minor_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of major collections performed.
    #[inline]
    #[must_use]
    pub fn total_major_collections(&self) -> usize {
        self.major_collections.load(Ordering::Relaxed)
    }

    /// Returns the number of collections that marked incrementally.
    #[inline]
    #[must_use]
    pub fn total_incremental_collections(&self) -> usize {
        self.incremental_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes reclaimed.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects reclaimed.
    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns the total time spent in atomic pauses, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Cumulative GC metrics of the process.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}
