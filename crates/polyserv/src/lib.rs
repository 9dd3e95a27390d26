//! polyserv — multi-protocol web server.
//!
//! Umbrella crate re-exporting the public surface of the core and protocol
//! crates. The binary in `src/main.rs` wires CLI flags and signal handling
//! around [`Server`].

pub use polyserv_core::{
    ConfigError, FileReader, KeepAliveTracker, LogLevel, Logger, PerformanceMetrics,
    ResourceRegistry, ServerConfig, ShutdownCoordinator, TlsSettings, User, UserStore, WorkerPool,
};
pub use polyserv_http::{Request, ResponseWriter, Router, Server, ServerError, WebSocketHandler};
