//! Background marking tasks.
//!
//! Concurrent markers pop gray objects from the shared worklists and trace
//! them while the mutator runs. They only ever set mark bits and push to the
//! worklists; objects still in construction are deferred by
//! [`mark_and_push`](super::visitor::mark_and_push) exactly as on the
//! mutator thread. Re-tracing is left to the mutator, which owns the
//! objects whose contents changed.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::heap::base::HeapHandle;
use crate::marking::visitor::MarkingVisitor;
use crate::marking::worklists::MarkingWorklists;
use crate::platform::Platform;
use crate::process::ProcessState;
use crate::tracing::internal::log_concurrent_marker;

struct Shared {
    worklists: Arc<MarkingWorklists>,
    process: Arc<ProcessState>,
    #[cfg(feature = "caged-heap")]
    cage_base: usize,
    active: Mutex<usize>,
    idle: Condvar,
    cancelled: AtomicBool,
}

/// Pool of background marking tasks of one cycle.
pub(crate) struct ConcurrentMarker {
    shared: Arc<Shared>,
    platform: Rc<dyn Platform>,
    max_tasks: usize,
}

impl ConcurrentMarker {
    /// Spawns up to `max_tasks` markers, as far as there is work for them.
    /// Returns `None` if concurrent marking is disabled.
    pub(crate) fn start(heap: &HeapHandle, max_tasks: usize) -> Option<Self> {
        if max_tasks == 0 {
            return None;
        }
        let marker = Self {
            shared: Arc::new(Shared {
                worklists: Arc::clone(&heap.worklists),
                process: Arc::clone(&heap.process),
                #[cfg(feature = "caged-heap")]
                cage_base: heap.process.cage.base(),
                active: Mutex::new(0),
                idle: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
            platform: Rc::clone(&heap.platform),
            max_tasks,
        };
        let spawned = marker.spawn_tasks();
        log_concurrent_marker(true, spawned);
        Some(marker)
    }

    /// Tops the pool back up after the mutator found more work.
    pub(crate) fn notify_more_work(&self) {
        self.spawn_tasks();
    }

    pub(crate) fn has_active_tasks(&self) -> bool {
        *self.shared.active.lock() > 0
    }

    /// Stops all tasks and waits for them. Work they did not get to stays
    /// on the worklists.
    pub(crate) fn join(self) {
        self.shared.cancelled.store(true, Ordering::Release);
        let mut active = self.shared.active.lock();
        while *active > 0 {
            self.shared.idle.wait(&mut active);
        }
        drop(active);
        log_concurrent_marker(false, self.max_tasks);
    }

    fn spawn_tasks(&self) -> usize {
        let mut spawned = 0;
        loop {
            {
                let mut active = self.shared.active.lock();
                if *active >= self.max_tasks || self.shared.worklists.marking.is_empty() {
                    break;
                }
                *active += 1;
            }
            let shared = Arc::clone(&self.shared);
            if !self
                .platform
                .spawn_background_task(Box::new(move || run_marking_task(&shared)))
            {
                *self.shared.active.lock() -= 1;
                break;
            }
            spawned += 1;
        }
        spawned
    }
}

impl std::fmt::Debug for ConcurrentMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMarker")
            .field("active", &*self.shared.active.lock())
            .field("max_tasks", &self.max_tasks)
            .finish_non_exhaustive()
    }
}

fn run_marking_task(shared: &Shared) {
    #[cfg(feature = "caged-heap")]
    crate::heap::cage::set_current_cage_base(shared.cage_base);
    {
        let mut visitor = MarkingVisitor::new(&shared.worklists, &shared.process.gc_info);
        while !shared.cancelled.load(Ordering::Acquire) {
            let Some(item) = shared.worklists.marking.pop() else {
                break;
            };
            visitor.process_item(item);
        }
    }
    #[cfg(feature = "caged-heap")]
    crate::heap::cage::set_current_cage_base(0);

    let mut active = shared.active.lock();
    *active -= 1;
    shared.idle.notify_all();
}
