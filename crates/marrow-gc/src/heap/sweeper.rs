//! Sweeping.
//!
//! When marking finishes every page moves to the sweeper's unswept lists.
//! Each page is swept in two passes:
//!
//! 1. **Finalize**: destructors of unmarked objects run. No heap borrows
//!    are held, so destructors may drop persistents or inspect the heap.
//! 2. **Reclaim**: the object-start bitmap is rebuilt, runs of dead and free
//!    blocks are coalesced into free-list entries, and survivors are
//!    unmarked (or promoted in a generational heap).
//!
//! Pages left without live objects are returned to the page backend.
//! Incremental sweeping runs on foreground tasks and on allocation; memory of
//! an unswept page is never reused.

use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::gc::{FreeMemoryHandling, GcConfig, SweepingType};
use crate::heap::base::HeapHandle;
use crate::heap::free_list::Block;
use crate::heap::page::{LargePage, NormalPage};
use crate::heap::space::SpaceIndex;
use crate::heap::MIN_BLOCK_SIZE;
use crate::tracing::internal::{log_phase_end, trace_phase};
use crate::tracing::GcPhase;

/// Time budget of one incremental sweeping task.
const SWEEP_STEP_DURATION: Duration = Duration::from_millis(2);

#[derive(Debug, Default, Clone, Copy)]
struct SweepStats {
    bytes_reclaimed: usize,
    objects_reclaimed: usize,
    objects_surviving: usize,
}

/// Pages waiting to be swept.
#[derive(Debug, Default)]
pub(crate) struct Sweeper {
    normal: Vec<Vec<NonNull<NormalPage>>>,
    large: Vec<NonNull<LargePage>>,
    config: Option<GcConfig>,
    stats: SweepStats,
}

impl Sweeper {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Unswept normal and large pages.
    pub(crate) fn pending_pages(&self) -> (usize, usize) {
        (self.normal.iter().map(Vec::len).sum(), self.large.len())
    }

    fn pop_normal(&mut self, space: Option<SpaceIndex>) -> Option<(SpaceIndex, NonNull<NormalPage>)> {
        match space {
            Some(space) => self.normal.get_mut(space)?.pop().map(|page| (space, page)),
            None => self
                .normal
                .iter_mut()
                .enumerate()
                .find_map(|(space, pages)| pages.pop().map(|page| (space, page))),
        }
    }
}

/// Outcome of sweeping one normal page.
struct PageSweep {
    empty: bool,
    largest_free: usize,
}

impl HeapHandle {
    /// Hands every page to the sweeper and sweeps atomically or schedules
    /// incremental sweeping.
    pub(crate) fn start_sweeping(&self, config: GcConfig) {
        debug_assert!(!self.is_sweeping());
        let started = Instant::now();
        {
            let _span = trace_phase(GcPhase::Sweep);
            let mut raw = self.raw_heap.borrow_mut();
            raw.reset_labs();
            let mut sweeper = self.sweeper.borrow_mut();
            sweeper.config = Some(config);
            sweeper.stats = SweepStats::default();
            sweeper.normal = raw
                .normal
                .iter_mut()
                .map(|space| {
                    space.free_list.clear();
                    let pages = std::mem::take(&mut space.pages);
                    for page in &pages {
                        unsafe { page.as_ref() }.base().set_swept(false);
                    }
                    pages
                })
                .collect();
            sweeper.large = std::mem::take(&mut raw.large.pages);
            for page in &sweeper.large {
                unsafe { page.as_ref() }.base().set_swept(false);
            }
        }
        self.sweeping.set(true);
        self.record_sweep_time(started.elapsed());

        let incremental = config.sweeping_type == SweepingType::Incremental
            && self.platform.foreground_task_runner().is_some();
        if incremental {
            self.schedule_sweeping_task();
        } else {
            self.finish_sweeping();
        }
    }

    /// Sweeps every remaining page.
    pub fn finish_sweeping(&self) {
        if !self.is_sweeping() || self.in_finalization.get() {
            return;
        }
        let started = Instant::now();
        let _span = trace_phase(GcPhase::Sweep);
        while self.sweep_next_page(None).is_some() {}
        self.record_sweep_time(started.elapsed());
        self.complete_sweeping();
    }

    /// Sweeps pages of `space` until a free block of `size` bytes appeared.
    pub(crate) fn sweep_for_allocation(&self, space: SpaceIndex, size: usize) -> bool {
        if !self.is_sweeping() || self.in_finalization.get() {
            return false;
        }
        let started = Instant::now();
        let mut found = false;
        while let Some(sweep) = self.sweep_next_page(Some(space)) {
            if sweep.largest_free >= size {
                found = true;
                break;
            }
        }
        self.record_sweep_time(started.elapsed());
        found
    }

    /// Sweeps until `deadline` (in platform seconds). Returns `true` once
    /// everything is swept.
    fn sweep_with_deadline(&self, deadline: f64) -> bool {
        let started = Instant::now();
        let mut done = false;
        loop {
            if self.sweep_next_page(None).is_none() {
                done = true;
                break;
            }
            if self.platform.monotonically_increasing_time() >= deadline {
                break;
            }
        }
        self.record_sweep_time(started.elapsed());
        if done {
            self.complete_sweeping();
        }
        done
    }

    fn schedule_sweeping_task(&self) {
        let Some(runner) = self.platform.foreground_task_runner() else {
            return;
        };
        let heap = self.self_ref.clone();
        let epoch = self.epoch.get();
        runner.post_task(Box::new(move || {
            let Some(heap) = heap.upgrade() else {
                return;
            };
            // Stale tasks of an earlier cycle.
            if heap.epoch.get() != epoch || !heap.is_sweeping() || heap.in_finalization.get() {
                return;
            }
            let deadline =
                heap.platform.monotonically_increasing_time() + SWEEP_STEP_DURATION.as_secs_f64();
            if !heap.sweep_with_deadline(deadline) {
                heap.schedule_sweeping_task();
            }
        }));
    }

    /// Sweeps one page. Returns `None` when no page is left.
    fn sweep_next_page(&self, space: Option<SpaceIndex>) -> Option<PageSweep> {
        let next = self.sweeper.borrow_mut().pop_normal(space);
        if let Some((space, page)) = next {
            return Some(self.sweep_normal_page(space, page));
        }
        if space.is_some() {
            return None;
        }
        let large = self.sweeper.borrow_mut().large.pop()?;
        self.sweep_large_page(large);
        Some(PageSweep {
            empty: true,
            largest_free: 0,
        })
    }

    fn sweep_normal_page(&self, space: SpaceIndex, page_ptr: NonNull<NormalPage>) -> PageSweep {
        let page = unsafe { page_ptr.as_ref() };

        // Pass 1: finalize.
        self.with_finalization(|| {
            page.for_each_header(|header| {
                if !header.is_free() && !header.is_marked() {
                    self.finalize_object(header);
                }
            });
        });

        // Pass 2: reclaim.
        let (discard, generational) = {
            let sweeper = self.sweeper.borrow();
            let discard = sweeper.config.is_some_and(|config| {
                config.free_memory_handling == FreeMemoryHandling::DiscardWherePossible
            });
            (discard, self.is_generational())
        };
        let mut stats = SweepStats::default();
        let mut free_runs: Vec<Block> = Vec::new();
        let mut run_start: Option<usize> = None;
        let mut live = 0usize;
        page.object_start_bitmap().clear();
        page.for_each_header(|header| {
            let address = header.address() as usize;
            if header.is_free() || !header.is_marked() {
                if !header.is_free() {
                    stats.objects_reclaimed += 1;
                    stats.bytes_reclaimed += header.allocated_size();
                }
                run_start.get_or_insert(address);
                return;
            }
            if let Some(start) = run_start.take() {
                free_runs.push(Block {
                    address: start,
                    size: address - start,
                });
            }
            page.object_start_bitmap().set_bit(address);
            if generational {
                header.set_old();
            } else {
                header.unmark();
            }
            live += 1;
        });
        if let Some(start) = run_start {
            free_runs.push(Block {
                address: start,
                size: page.payload_end() - start,
            });
        }
        stats.objects_surviving = live;
        self.allocated_bytes
            .set(self.allocated_bytes.get() - stats.bytes_reclaimed);

        if generational {
            let mut remembered = self.remembered_set.borrow_mut();
            for run in &free_runs {
                remembered.remove_range(run.address, run.address + run.size);
            }
        }

        let empty = live == 0;
        let mut largest_free = 0;
        if empty {
            page.base().set_swept(true);
            self.release_normal_page(page_ptr);
        } else {
            let mut raw = self.raw_heap.borrow_mut();
            let space_ref = &mut raw.normal[space];
            for run in free_runs {
                largest_free = largest_free.max(run.size);
                space_ref.add_to_free_list(run);
                if discard && run.size > MIN_BLOCK_SIZE {
                    let _ = self
                        .backend
                        .discard(run.address + MIN_BLOCK_SIZE, run.size - MIN_BLOCK_SIZE);
                }
            }
            space_ref.pages.push(page_ptr);
            page.base().set_swept(true);
        }
        self.add_sweep_stats(stats);
        PageSweep { empty, largest_free }
    }

    fn sweep_large_page(&self, page_ptr: NonNull<LargePage>) {
        let page = unsafe { page_ptr.as_ref() };
        let header = page.header();
        let mut stats = SweepStats::default();
        if !header.is_free() && header.is_marked() {
            if self.is_generational() {
                header.set_old();
            } else {
                header.unmark();
            }
            stats.objects_surviving = 1;
            self.raw_heap.borrow_mut().large.pages.push(page_ptr);
            page.base().set_swept(true);
            self.add_sweep_stats(stats);
            return;
        }
        if !header.is_free() {
            self.with_finalization(|| self.finalize_object(header));
            stats.objects_reclaimed = 1;
            stats.bytes_reclaimed = page.object_size();
            self.allocated_bytes
                .set(self.allocated_bytes.get() - stats.bytes_reclaimed);
        }
        if self.is_generational() {
            self.remembered_set
                .borrow_mut()
                .remove_range(header.address() as usize, page.payload_end());
        }
        self.release_large_page(page_ptr);
        self.add_sweep_stats(stats);
    }

    fn add_sweep_stats(&self, stats: SweepStats) {
        let mut sweeper = self.sweeper.borrow_mut();
        sweeper.stats.bytes_reclaimed += stats.bytes_reclaimed;
        sweeper.stats.objects_reclaimed += stats.objects_reclaimed;
        sweeper.stats.objects_surviving += stats.objects_surviving;
    }

    fn record_sweep_time(&self, elapsed: Duration) {
        if let Some(cycle) = self.cycle.borrow_mut().as_mut() {
            cycle.sweep.add(elapsed);
        }
    }

    fn complete_sweeping(&self) {
        if !self.is_sweeping() {
            return;
        }
        self.sweeping.set(false);
        let stats = {
            let mut sweeper = self.sweeper.borrow_mut();
            sweeper.config = None;
            std::mem::take(&mut sweeper.stats)
        };
        log_phase_end(GcPhase::Sweep, stats.bytes_reclaimed);
        if let Some(cycle) = self.cycle.borrow_mut().as_mut() {
            cycle.metrics.bytes_reclaimed = stats.bytes_reclaimed;
            cycle.metrics.objects_reclaimed = stats.objects_reclaimed;
            cycle.metrics.objects_surviving = stats.objects_surviving;
        }
        self.complete_cycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sweeper_has_no_pages() {
        let mut sweeper = Sweeper::new();
        assert_eq!(sweeper.pending_pages(), (0, 0));
        assert!(sweeper.pop_normal(None).is_none());
        assert!(sweeper.pop_normal(Some(3)).is_none());
    }
}
