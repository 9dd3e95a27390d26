//! Fixed-size worker pool backing per-connection handler tasks.
//!
//! Workers block on a condition variable with a 100 ms timeout so the
//! shutdown flag is observed within one tick even when no work arrives.
//! Submission is best-effort during teardown: once the pool is stopping (or
//! shutdown was requested) new tasks are dropped silently, and a submitter
//! that cannot take the queue lock quickly while shutdown is in progress
//! drops its task instead of risking a hang.
//!
//! [`stop`](WorkerPool::stop) clears the pending queue: work that never
//! started is abandoned, not drained.

use crate::logging::Logger;
use crate::shutdown::ShutdownCoordinator;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A unit of work executed on a pool thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long a submitter waits for the queue lock before giving up
/// (only when shutdown is already in progress).
const SUBMIT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Condition-wait tick inside the worker loop.
const WORKER_WAIT_TICK: Duration = Duration::from_millis(100);

/// Total budget `stop` spends waiting for workers to exit.
const STOP_JOIN_BUDGET: Duration = Duration::from_secs(3);

struct PoolState {
    queue: Mutex<VecDeque<Task>>,
    work_cv: Condvar,
    stopping: AtomicBool,
    live_workers: AtomicUsize,
    exit_lock: Mutex<()>,
    exit_cv: Condvar,
}

/// Fixed pool of worker threads consuming a shared task queue.
pub struct WorkerPool {
    state: Arc<PoolState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    coordinator: ShutdownCoordinator,
    logger: Logger,
    thread_count: usize,
}

impl WorkerPool {
    /// Spawn `thread_count` workers immediately.
    #[must_use]
    pub fn new(thread_count: usize, coordinator: ShutdownCoordinator, logger: Logger) -> Self {
        let state = Arc::new(PoolState {
            queue: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            stopping: AtomicBool::new(false),
            live_workers: AtomicUsize::new(thread_count),
            exit_lock: Mutex::new(()),
            exit_cv: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let state = Arc::clone(&state);
            let coordinator = coordinator.clone();
            let logger = logger.clone();
            workers.push(std::thread::spawn(move || {
                worker_loop(&state, &coordinator, &logger);
            }));
        }

        logger.info(format!("worker pool started with {thread_count} threads"));

        Self {
            state,
            workers: Mutex::new(workers),
            coordinator,
            logger,
            thread_count,
        }
    }

    /// Enqueue a task.
    ///
    /// Dropped silently when the pool is stopping or shutdown has been
    /// requested. When the queue lock cannot be acquired within 100 ms and
    /// shutdown is in progress the task is also dropped; otherwise the caller
    /// blocks until the lock is available.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state.stopping.load(Ordering::Acquire) || self.coordinator.is_shutdown_requested()
        {
            return;
        }

        let boxed: Task = Box::new(task);
        let mut queue = match self.state.queue.try_lock_for(SUBMIT_LOCK_TIMEOUT) {
            Some(guard) => guard,
            None => {
                if self.coordinator.is_shutdown_requested() {
                    return;
                }
                self.state.queue.lock()
            }
        };

        if self.state.stopping.load(Ordering::Acquire) {
            return;
        }
        queue.push_back(boxed);
        drop(queue);

        self.state.work_cv.notify_one();
    }

    /// Stop the pool: wake everyone, wait up to 3 seconds total for workers
    /// to exit, detach any straggler, and clear the pending queue.
    pub fn stop(&self) {
        if self.state.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut queue = self.state.queue.lock();
            let abandoned = queue.len();
            queue.clear();
            if abandoned > 0 {
                self.logger
                    .info(format!("worker pool dropped {abandoned} pending tasks"));
            }
        }
        self.state.work_cv.notify_all();

        let deadline = Instant::now() + STOP_JOIN_BUDGET;
        {
            let mut guard = self.state.exit_lock.lock();
            while self.state.live_workers.load(Ordering::Acquire) > 0 {
                if self
                    .state
                    .exit_cv
                    .wait_until(&mut guard, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }

        let mut workers = self.workers.lock();
        let mut detached = 0usize;
        for handle in workers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                detached += 1;
                drop(handle);
            }
        }
        if detached > 0 {
            self.logger
                .warn(format!("worker pool detached {detached} stuck workers"));
        }
    }

    /// Pending task count; `0` when the queue lock cannot be taken quickly.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        match self.state.queue.try_lock_for(Duration::from_millis(10)) {
            Some(queue) => queue.len(),
            None => 0,
        }
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(state: &PoolState, coordinator: &ShutdownCoordinator, logger: &Logger) {
    loop {
        let task = {
            let mut queue = state.queue.lock();
            if queue.is_empty() && !state.stopping.load(Ordering::Acquire) {
                let _ = state.work_cv.wait_for(&mut queue, WORKER_WAIT_TICK);
            }

            if state.stopping.load(Ordering::Acquire) || coordinator.is_shutdown_requested() {
                break;
            }
            queue.pop_front()
        };

        let Some(task) = task else {
            continue;
        };

        // Run outside the lock; a panicking task must not take the worker down.
        if catch_unwind(AssertUnwindSafe(task)).is_err()
            && !state.stopping.load(Ordering::Acquire)
            && !coordinator.is_shutdown_requested()
        {
            logger.error("worker task panicked");
        }
    }

    let previous = state.live_workers.fetch_sub(1, Ordering::AcqRel);
    if previous == 1 {
        let _guard = state.exit_lock.lock();
    }
    state.exit_cv.notify_all();
}
