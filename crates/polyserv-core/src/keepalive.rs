//! Keep-alive connection tracking and idle sweeping.
//!
//! Each kept-alive connection is tracked as `fd -> last activity instant`
//! plus a cloned socket handle. A background sweeper fires once per second
//! and performs an orderly shutdown+close of every entry idle longer than
//! the configured timeout.
//!
//! Locking discipline: the sweeper collects expired entries under the lock,
//! releases it, then closes the sockets; the lock is never held across
//! `shutdown()`. If the lock cannot be acquired within 500 ms the cycle is
//! skipped entirely.

use crate::logging::Logger;
use crate::resources::ResourceRegistry;
use crate::shutdown::ShutdownCoordinator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sweep cadence.
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Lock budget for one sweep cycle; on timeout the cycle is skipped.
const SWEEP_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

struct TrackedConnection {
    stream: TcpStream,
    last_activity: Instant,
}

struct TrackerState {
    connections: Mutex<HashMap<RawFd, TrackedConnection>>,
    idle_timeout: Duration,
}

/// Map of kept-alive connections with an idle sweeper.
#[derive(Clone)]
pub struct KeepAliveTracker {
    state: Arc<TrackerState>,
}

impl KeepAliveTracker {
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            state: Arc::new(TrackerState {
                connections: Mutex::new(HashMap::new()),
                idle_timeout,
            }),
        }
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.state.idle_timeout
    }

    /// Start tracking a connection. Keeps a cloned handle for the sweeper.
    pub fn add(&self, stream: &TcpStream) -> io::Result<()> {
        let clone = stream.try_clone()?;
        let fd = clone.as_raw_fd();
        self.state.connections.lock().insert(
            fd,
            TrackedConnection {
                stream: clone,
                last_activity: Instant::now(),
            },
        );
        Ok(())
    }

    /// Refresh the last-activity instant; no-op for untracked fds.
    pub fn touch(&self, fd: RawFd) {
        let mut connections = self.state.connections.lock();
        if let Some(entry) = connections.get_mut(&fd) {
            entry.last_activity = Instant::now();
        }
    }

    /// Stop tracking a connection without closing it.
    pub fn remove(&self, fd: RawFd) {
        self.state.connections.lock().remove(&fd);
    }

    /// Tracked connection count; `0` when the lock is contended.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        match self
            .state
            .connections
            .try_lock_for(Duration::from_millis(10))
        {
            Some(connections) => connections.len(),
            None => 0,
        }
    }

    /// Drop every entry without closing sockets (forced-close path owns that).
    pub fn clear(&self) {
        self.state.connections.lock().clear();
    }

    /// One sweep cycle: expire everything idle longer than the timeout.
    ///
    /// Returns the number of connections closed. Skips (returning 0) when
    /// the lock is not available within 500 ms.
    pub fn sweep(&self, resources: &ResourceRegistry, logger: &Logger) -> usize {
        let expired: Vec<(RawFd, TcpStream)> = {
            let Some(mut connections) =
                self.state.connections.try_lock_for(SWEEP_LOCK_TIMEOUT)
            else {
                return 0;
            };

            let now = Instant::now();
            let dead: Vec<RawFd> = connections
                .iter()
                .filter(|(_, entry)| {
                    now.duration_since(entry.last_activity) > self.state.idle_timeout
                })
                .map(|(fd, _)| *fd)
                .collect();

            dead.into_iter()
                .filter_map(|fd| connections.remove(&fd).map(|entry| (fd, entry.stream)))
                .collect()
        };

        // Close outside the lock.
        let closed = expired.len();
        for (fd, stream) in expired {
            let _ = stream.shutdown(Shutdown::Both);
            resources.unregister(fd);
            logger.debug(format!("closed idle connection fd={fd}"));
        }
        closed
    }

    /// Spawn the sweeper thread. It runs until shutdown and registers itself
    /// with the coordinator.
    pub fn spawn_sweeper(
        &self,
        coordinator: &ShutdownCoordinator,
        resources: ResourceRegistry,
        logger: Logger,
    ) {
        let tracker = self.clone();
        let inner = coordinator.clone();
        let handle = std::thread::spawn(move || {
            while !inner.wait_for_shutdown(SWEEP_PERIOD) {
                tracker.sweep(&resources, &logger);
            }
            inner.thread_exiting();
        });
        coordinator.register_thread(handle);
    }
}
