//! Graceful shutdown coordination.
//!
//! A single [`ShutdownCoordinator`] is created in `main` and handed (by
//! cheap clone) to every component that runs a loop. Each loop phrases its
//! pacing as "sleep OR wake on shutdown" via
//! [`wait_for_shutdown`](ShutdownCoordinator::wait_for_shutdown); a plain
//! sleep anywhere would stretch shutdown latency by the sleep duration.
//!
//! The coordinator also keeps thread accounting: background threads are
//! handed over with [`register_thread`](ShutdownCoordinator::register_thread)
//! and announce their exit with
//! [`thread_exiting`](ShutdownCoordinator::thread_exiting); the last exit
//! wakes [`wait_for_all_threads`](ShutdownCoordinator::wait_for_all_threads).
//!
//! # Example
//!
//! ```ignore
//! let coordinator = ShutdownCoordinator::new();
//!
//! let sweeper = {
//!     let coordinator = coordinator.clone();
//!     std::thread::spawn(move || {
//!         while !coordinator.wait_for_shutdown(Duration::from_secs(1)) {
//!             sweep_once();
//!         }
//!         coordinator.thread_exiting();
//!     })
//! };
//! coordinator.register_thread(sweeper);
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct CoordinatorState {
    /// Once set, never cleared.
    shutdown_requested: AtomicBool,
    /// Number of registered threads that have not yet called `thread_exiting`.
    active_threads: AtomicUsize,
    /// Guards the condition variables below.
    lock: Mutex<()>,
    shutdown_cv: Condvar,
    all_exited_cv: Condvar,
    /// Handles of registered background threads, abandoned on forced shutdown.
    registry: Mutex<Vec<JoinHandle<()>>>,
}

/// Process-wide shutdown latch with thread accounting.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<CoordinatorState>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(CoordinatorState {
                shutdown_requested: AtomicBool::new(false),
                active_threads: AtomicUsize::new(0),
                lock: Mutex::new(()),
                shutdown_cv: Condvar::new(),
                all_exited_cv: Condvar::new(),
                registry: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Set the shutdown flag and wake every waiter. Idempotent.
    pub fn request_shutdown(&self) {
        {
            let _guard = self.state.lock.lock();
            self.state.shutdown_requested.store(true, Ordering::Release);
        }
        self.state.shutdown_cv.notify_all();
        // Waiters on the thread count also need to re-check their deadline.
        self.state.all_exited_cv.notify_all();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.state.shutdown_requested.load(Ordering::Acquire)
    }

    /// Block up to `timeout`; returns `true` iff shutdown was requested.
    ///
    /// This is the pacing primitive for every background loop: a sweep that
    /// fires once per second calls `wait_for_shutdown(1s)` and treats `true`
    /// as "exit now" and `false` as "do one cycle".
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        if self.is_shutdown_requested() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock.lock();
        while !self.is_shutdown_requested() {
            if self
                .state
                .shutdown_cv
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        self.is_shutdown_requested()
    }

    /// Take ownership of a background thread handle and count it as active.
    pub fn register_thread(&self, handle: JoinHandle<()>) {
        self.state.registry.lock().push(handle);
        self.state.active_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Called by a registered thread immediately before it returns.
    ///
    /// The last exit wakes `wait_for_all_threads`.
    pub fn thread_exiting(&self) {
        // Saturating: a thread abandoned by `force_shutdown_threads` may still
        // announce its exit after the count was already zeroed.
        let previous = self
            .state
            .active_threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous <= 1 {
            let _guard = self.state.lock.lock();
            self.state.all_exited_cv.notify_all();
        }
    }

    #[must_use]
    pub fn active_thread_count(&self) -> usize {
        self.state.active_threads.load(Ordering::Acquire)
    }

    /// Wait until every registered thread has called `thread_exiting`.
    ///
    /// Returns `true` iff the count reached zero within `timeout`.
    pub fn wait_for_all_threads(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock.lock();
        while self.state.active_threads.load(Ordering::Acquire) > 0 {
            if self
                .state
                .all_exited_cv
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        self.state.active_threads.load(Ordering::Acquire) == 0
    }

    /// Best effort: give stragglers a short grace period, then abandon them.
    ///
    /// Abandoned handles are dropped (detached); leaking a stuck thread is
    /// preferred over hanging the process at exit.
    pub fn force_shutdown_threads(&self) {
        std::thread::sleep(Duration::from_millis(100));

        let mut registry = self.state.registry.lock();
        for handle in registry.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                drop(handle);
            }
        }
        self.state.active_threads.store(0, Ordering::Release);
        drop(registry);

        let _guard = self.state.lock.lock();
        self.state.all_exited_cv.notify_all();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear_and_sticks() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_requested());

        coordinator.request_shutdown();
        assert!(coordinator.is_shutdown_requested());

        // Idempotent.
        coordinator.request_shutdown();
        assert!(coordinator.is_shutdown_requested());
    }

    #[test]
    fn wait_times_out_when_not_requested() {
        let coordinator = ShutdownCoordinator::new();
        let started = Instant::now();
        assert!(!coordinator.wait_for_shutdown(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_returns_immediately_after_request() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown();

        let started = Instant::now();
        assert!(coordinator.wait_for_shutdown(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_wakes_on_request_from_other_thread() {
        let coordinator = ShutdownCoordinator::new();
        let requester = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                coordinator.request_shutdown();
            })
        };

        assert!(coordinator.wait_for_shutdown(Duration::from_secs(5)));
        requester.join().expect("requester thread");
    }

    #[test]
    fn thread_accounting_reaches_zero() {
        let coordinator = ShutdownCoordinator::new();

        for _ in 0..3 {
            let inner = coordinator.clone();
            let handle = std::thread::spawn(move || {
                inner.wait_for_shutdown(Duration::from_secs(5));
                inner.thread_exiting();
            });
            coordinator.register_thread(handle);
        }
        assert_eq!(coordinator.active_thread_count(), 3);

        coordinator.request_shutdown();
        assert!(coordinator.wait_for_all_threads(Duration::from_secs(5)));
        assert_eq!(coordinator.active_thread_count(), 0);
    }

    #[test]
    fn wait_for_all_threads_times_out_on_straggler() {
        let coordinator = ShutdownCoordinator::new();
        let inner = coordinator.clone();
        let handle = std::thread::spawn(move || {
            // Never calls thread_exiting before the deadline below.
            inner.wait_for_shutdown(Duration::from_secs(60));
            inner.thread_exiting();
        });
        coordinator.register_thread(handle);

        assert!(!coordinator.wait_for_all_threads(Duration::from_millis(50)));

        coordinator.request_shutdown();
        assert!(coordinator.wait_for_all_threads(Duration::from_secs(5)));
    }

    #[test]
    fn force_shutdown_abandons_handles() {
        let coordinator = ShutdownCoordinator::new();
        let inner = coordinator.clone();
        let handle = std::thread::spawn(move || {
            inner.wait_for_shutdown(Duration::from_secs(60));
            inner.thread_exiting();
        });
        coordinator.register_thread(handle);

        coordinator.force_shutdown_threads();
        assert_eq!(coordinator.active_thread_count(), 0);
        assert!(coordinator.wait_for_all_threads(Duration::from_millis(10)));

        // Unstick the abandoned thread so the test process exits promptly.
        coordinator.request_shutdown();
    }
}
