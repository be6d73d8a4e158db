//! Services the collector consumes from its embedder.
//!
//! The heap never talks to the OS or a task scheduler directly. It reserves
//! memory through a [`PageAllocator`] and schedules incremental and
//! concurrent work through a [`Platform`]. [`DefaultPlatform`] implements
//! both on top of `sys_alloc` and `std::thread` for embedders without their
//! own event loop.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sys_alloc::{Reservation, ReserveOptions};

pub use sys_alloc::Protection;

// ============================================================================
// Page allocation
// ============================================================================

/// Reserves and commits address space on behalf of the heap.
///
/// Reservations start inaccessible. Committed memory must read as zero the
/// first time it is committed and again after every `decommit`.
pub trait PageAllocator: Send + Sync {
    /// Granularity of reservations, and alignment of returned addresses.
    fn allocate_page_size(&self) -> usize;

    /// Granularity of commit, decommit and protect operations.
    fn commit_page_size(&self) -> usize;

    /// A randomized, allocation-granularity aligned placement hint.
    fn random_mmap_addr(&self) -> usize;

    /// Reserves `len` bytes aligned to `alignment`, preferably at `hint`.
    fn reserve(&self, hint: usize, len: usize, alignment: usize) -> io::Result<NonNull<u8>>;

    /// Makes `[address, address + len)` readable and writable.
    fn commit(&self, address: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Returns the memory behind `[address, address + len)` to the OS.
    fn decommit(&self, address: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Changes the protection of a committed range.
    fn protect(&self, address: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()>;

    /// Releases a whole reservation returned by [`PageAllocator::reserve`].
    fn release(&self, address: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// [`PageAllocator`] backed by the OS through `sys_alloc`.
#[derive(Debug, Default)]
pub struct DefaultPageAllocator {
    reservations: Mutex<BTreeMap<usize, Reservation>>,
}

impl DefaultPageAllocator {
    /// Creates an allocator with no reservations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_reservation<R>(
        &self,
        address: NonNull<u8>,
        f: impl FnOnce(&Reservation, usize) -> io::Result<R>,
    ) -> io::Result<R> {
        let address = address.as_ptr() as usize;
        let reservations = self.reservations.lock();
        let Some((base, reservation)) = reservations.range(..=address).next_back() else {
            return Err(unknown_address());
        };
        if !reservation.contains(address) {
            return Err(unknown_address());
        }
        f(reservation, address - base)
    }
}

fn unknown_address() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "address does not belong to a reservation",
    )
}

impl PageAllocator for DefaultPageAllocator {
    fn allocate_page_size(&self) -> usize {
        sys_alloc::allocation_granularity()
    }

    fn commit_page_size(&self) -> usize {
        sys_alloc::page_size()
    }

    fn random_mmap_addr(&self) -> usize {
        sys_alloc::random_mmap_hint()
    }

    fn reserve(&self, hint: usize, len: usize, alignment: usize) -> io::Result<NonNull<u8>> {
        let reservation = ReserveOptions::new()
            .len(len)
            .alignment(alignment)
            .with_hint(hint)
            .reserve()?;
        let base = NonNull::new(reservation.ptr()).ok_or_else(unknown_address)?;
        self.reservations
            .lock()
            .insert(base.as_ptr() as usize, reservation);
        Ok(base)
    }

    fn commit(&self, address: NonNull<u8>, len: usize) -> io::Result<()> {
        self.with_reservation(address, |reservation, offset| {
            reservation.commit(offset, len)
        })
    }

    fn decommit(&self, address: NonNull<u8>, len: usize) -> io::Result<()> {
        self.with_reservation(address, |reservation, offset| {
            reservation.decommit(offset, len)
        })
    }

    fn protect(&self, address: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()> {
        self.with_reservation(address, |reservation, offset| {
            reservation.protect(offset, len, protection)
        })
    }

    fn release(&self, address: NonNull<u8>, len: usize) -> io::Result<()> {
        let removed = self.reservations.lock().remove(&(address.as_ptr() as usize));
        match removed {
            Some(reservation) => {
                debug_assert_eq!(reservation.len(), len.next_multiple_of(self.commit_page_size()));
                drop(reservation);
                Ok(())
            }
            None => Err(unknown_address()),
        }
    }
}

// ============================================================================
// Task scheduling
// ============================================================================

/// A task run on the heap's thread.
pub type Task = Box<dyn FnOnce()>;

/// A task run on an arbitrary background thread.
pub type BackgroundTask = Box<dyn FnOnce() + Send>;

/// Runs tasks on the thread that owns the heap.
pub trait TaskRunner {
    /// Queues `task` to run as soon as possible.
    fn post_task(&self, task: Task);

    /// Queues `task` to run no earlier than `delay` from now.
    fn post_delayed_task(&self, task: Task, delay: Duration);
}

/// Everything the heap needs from its embedder.
pub trait Platform {
    /// Page allocator used for heap memory.
    fn page_allocator(&self) -> Arc<dyn PageAllocator>;

    /// Monotonic time in seconds.
    fn monotonically_increasing_time(&self) -> f64;

    /// Runner for incremental marking and sweeping tasks. `None` disables
    /// scheduled incremental work; steps then only happen when driven
    /// explicitly.
    fn foreground_task_runner(&self) -> Option<Rc<dyn TaskRunner>>;

    /// Runs `task` on a background thread. Returns `false` if background
    /// work is not supported, in which case the task is dropped.
    fn spawn_background_task(&self, task: BackgroundTask) -> bool;
}

/// Task runner that queues tasks until the embedder pumps it.
#[derive(Default)]
pub struct DefaultTaskRunner {
    ready: RefCell<VecDeque<Task>>,
    delayed: RefCell<Vec<(Instant, Task)>>,
}

impl DefaultTaskRunner {
    fn pop_task(&self) -> Option<Task> {
        let now = Instant::now();
        let mut delayed = self.delayed.borrow_mut();
        let mut index = 0;
        while index < delayed.len() {
            if delayed[index].0 <= now {
                let (_, task) = delayed.remove(index);
                self.ready.borrow_mut().push_back(task);
            } else {
                index += 1;
            }
        }
        drop(delayed);
        self.ready.borrow_mut().pop_front()
    }

    fn has_pending(&self) -> bool {
        !self.ready.borrow().is_empty() || !self.delayed.borrow().is_empty()
    }
}

impl TaskRunner for DefaultTaskRunner {
    fn post_task(&self, task: Task) {
        self.ready.borrow_mut().push_back(task);
    }

    fn post_delayed_task(&self, task: Task, delay: Duration) {
        self.delayed.borrow_mut().push((Instant::now() + delay, task));
    }
}

/// Platform backed by the OS and `std::thread`.
///
/// Foreground tasks run when the embedder calls
/// [`DefaultPlatform::pump_message_loop`].
pub struct DefaultPlatform {
    page_allocator: Arc<dyn PageAllocator>,
    runner: Rc<DefaultTaskRunner>,
    start: Instant,
    background_threads: bool,
}

impl DefaultPlatform {
    /// Creates a platform with a [`DefaultPageAllocator`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_allocator(Arc::new(DefaultPageAllocator::new()))
    }

    /// Creates a platform using `page_allocator`.
    #[must_use]
    pub fn with_page_allocator(page_allocator: Arc<dyn PageAllocator>) -> Self {
        Self {
            page_allocator,
            runner: Rc::new(DefaultTaskRunner::default()),
            start: Instant::now(),
            background_threads: true,
        }
    }

    /// Disables background threads; concurrent marking then falls back to
    /// incremental marking on the heap's thread.
    #[must_use]
    pub const fn without_background_threads(mut self) -> Self {
        self.background_threads = false;
        self
    }

    /// Runs one ready task. Returns `true` if a task ran.
    pub fn pump_message_loop(&self) -> bool {
        match self.runner.pop_task() {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until no ready or delayed task is left.
    pub fn run_until_idle(&self) {
        while self.runner.has_pending() {
            if !self.pump_message_loop() {
                std::thread::yield_now();
            }
        }
    }
}

impl Default for DefaultPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DefaultPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultPlatform")
            .field("background_threads", &self.background_threads)
            .finish_non_exhaustive()
    }
}

impl Platform for DefaultPlatform {
    fn page_allocator(&self) -> Arc<dyn PageAllocator> {
        Arc::clone(&self.page_allocator)
    }

    fn monotonically_increasing_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn foreground_task_runner(&self) -> Option<Rc<dyn TaskRunner>> {
        let runner: Rc<dyn TaskRunner> = self.runner.clone();
        Some(runner)
    }

    fn spawn_background_task(&self, task: BackgroundTask) -> bool {
        if !self.background_threads {
            return false;
        }
        std::thread::Builder::new()
            .name("marrow-gc-worker".into())
            .spawn(task)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_default_page_allocator_round_trip() {
        let allocator = DefaultPageAllocator::new();
        let page = allocator.commit_page_size();
        let len = 4 * page;
        let base = allocator.reserve(0, len, allocator.allocate_page_size()).unwrap();
        allocator.commit(base, page).unwrap();
        unsafe {
            assert_eq!(base.as_ptr().read(), 0);
            base.as_ptr().write(5);
        }
        allocator.decommit(base, page).unwrap();
        allocator.commit(base, page).unwrap();
        unsafe { assert_eq!(base.as_ptr().read(), 0) };
        allocator.release(base, len).unwrap();
        assert!(allocator.commit(base, page).is_err());
    }

    #[test]
    fn test_interior_addresses_resolve() {
        let allocator = DefaultPageAllocator::new();
        let page = allocator.commit_page_size();
        let base = allocator.reserve(0, 8 * page, allocator.allocate_page_size()).unwrap();
        let interior = NonNull::new(unsafe { base.as_ptr().add(2 * page) }).unwrap();
        allocator.commit(interior, page).unwrap();
        unsafe { interior.as_ptr().write(1) };
        allocator.release(base, 8 * page).unwrap();
    }

    #[test]
    fn test_task_runner_order() {
        let platform = DefaultPlatform::new();
        let runner = platform.foreground_task_runner().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = Rc::clone(&log);
            runner.post_task(Box::new(move || log.borrow_mut().push(i)));
        }
        platform.run_until_idle();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(!platform.pump_message_loop());
    }

    #[test]
    fn test_delayed_task_runs_after_delay() {
        let platform = DefaultPlatform::new();
        let runner = platform.foreground_task_runner().unwrap();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        runner.post_delayed_task(Box::new(move || flag.set(true)), Duration::from_millis(5));
        platform.run_until_idle();
        assert!(ran.get());
    }

    #[test]
    fn test_background_tasks_can_be_disabled() {
        let platform = DefaultPlatform::new().without_background_threads();
        assert!(!platform.spawn_background_task(Box::new(|| {})));
    }
}
