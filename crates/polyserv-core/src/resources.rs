//! Registry of every accepted socket, for forced close during shutdown.
//!
//! Handlers own their connections; the registry only keeps a cloned handle
//! keyed by the raw fd so teardown can `shutdown(RDWR)` everything that is
//! still open, which unblocks any handler sitting in a read.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

/// Shared socket registry. Cloning is cheap.
#[derive(Clone)]
pub struct ResourceRegistry {
    sockets: Arc<Mutex<HashMap<RawFd, TcpStream>>>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sockets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Track a freshly accepted connection. Keeps a cloned handle.
    pub fn register(&self, stream: &TcpStream) -> io::Result<()> {
        let clone = stream.try_clone()?;
        self.sockets.lock().insert(clone.as_raw_fd(), clone);
        Ok(())
    }

    /// Stop tracking a connection; called when its handler exits.
    pub fn unregister(&self, fd: RawFd) {
        self.sockets.lock().remove(&fd);
    }

    /// Force-close everything still registered. Returns the number closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<TcpStream> = {
            let mut sockets = self.sockets.lock();
            sockets.drain().map(|(_, stream)| stream).collect()
        };
        let count = drained.len();
        for stream in drained {
            let _ = stream.shutdown(Shutdown::Both);
        }
        count
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
