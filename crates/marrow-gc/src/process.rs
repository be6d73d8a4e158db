//! Process-scoped collector state.
//!
//! The GCInfo table and, with the `caged-heap` feature, the cage are shared
//! by every heap of the process. They are created by
//! [`initialize_process`] and released by [`shutdown_process`] once the last
//! heap referencing them is gone. Creating a heap before initialization
//! panics.

use std::sync::Arc;

use parking_lot::RwLock;

#[cfg(feature = "caged-heap")]
use crate::heap::cage::CagedHeap;
use crate::gc_info::GcInfoTable;
use crate::platform::{DefaultPageAllocator, PageAllocator};

/// Configuration of [`initialize_process`].
#[derive(Clone)]
pub struct ProcessConfig {
    /// Allocator backing the cage. Without the `caged-heap` feature every
    /// heap allocates its pages through its own platform instead.
    pub page_allocator: Arc<dyn PageAllocator>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            page_allocator: Arc::new(DefaultPageAllocator::new()),
        }
    }
}

impl std::fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConfig").finish_non_exhaustive()
    }
}

/// State shared by all heaps of the process.
pub(crate) struct ProcessState {
    pub(crate) gc_info: GcInfoTable,
    #[cfg(feature = "caged-heap")]
    pub(crate) cage: Arc<CagedHeap>,
}

impl std::fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessState")
            .field("gc_info", &self.gc_info)
            .finish_non_exhaustive()
    }
}

static PROCESS: RwLock<Option<Arc<ProcessState>>> = RwLock::new(None);

/// Initializes the collector for this process.
///
/// Calling it again while initialized keeps the existing state.
pub fn initialize_process(config: ProcessConfig) {
    let mut process = PROCESS.write();
    if process.is_some() {
        return;
    }
    #[cfg(feature = "caged-heap")]
    let cage = Arc::new(CagedHeap::reserve(config.page_allocator));
    #[cfg(not(feature = "caged-heap"))]
    drop(config);
    *process = Some(Arc::new(ProcessState {
        gc_info: GcInfoTable::new(),
        #[cfg(feature = "caged-heap")]
        cage,
    }));
}

/// Releases the process state.
///
/// Heaps that are still alive keep using the state they were created with;
/// it is freed when the last of them is dropped.
pub fn shutdown_process() {
    let previous = PROCESS.write().take();
    #[cfg(feature = "caged-heap")]
    if previous.is_some() {
        crate::heap::cage::set_current_cage_base(0);
    }
    drop(previous);
}

/// Returns `true` between [`initialize_process`] and [`shutdown_process`].
#[must_use]
pub fn is_process_initialized() -> bool {
    PROCESS.read().is_some()
}

/// Current process state.
///
/// # Panics
///
/// Panics if the process is not initialized.
pub(crate) fn process_state() -> Arc<ProcessState> {
    match PROCESS.read().as_ref() {
        Some(state) => Arc::clone(state),
        None => panic!("marrow-gc is not initialized; call `initialize_process` first"),
    }
}
