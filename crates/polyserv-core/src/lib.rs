//! polyserv-core — concurrency substrate and shared state for the polyserv
//! web server.
//!
//! This crate hosts everything below the protocol layer: the shutdown
//! coordinator every loop paces on, the worker pool that runs connection
//! handlers, keep-alive tracking with its idle sweeper, the forced-close
//! socket registry, performance metrics with their JSON producers, the demo
//! user store, static file access, configuration, and logging.

pub mod config;
pub mod keepalive;
pub mod logging;
pub mod metrics;
pub mod resources;
pub mod shutdown;
pub mod static_files;
pub mod users;
pub mod worker;

pub use config::{ConfigError, ServerConfig, TlsSettings};
pub use keepalive::KeepAliveTracker;
pub use logging::{LogLevel, Logger};
pub use metrics::PerformanceMetrics;
pub use resources::ResourceRegistry;
pub use shutdown::ShutdownCoordinator;
pub use static_files::{mime_type, FileReader};
pub use users::{User, UserStore};
pub use worker::WorkerPool;
