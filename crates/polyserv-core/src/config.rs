//! Server configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Certificate and key file locations; presence enables TLS.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Full server configuration, normally assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port (1..=65535).
    pub port: u16,
    /// Static file root.
    pub document_root: PathBuf,
    /// Worker pool size (> 0).
    pub worker_threads: usize,
    /// Keep-alive globally enabled.
    pub keep_alive: bool,
    /// Idle timeout for kept-alive connections.
    pub keep_alive_timeout: Duration,
    /// Accept HTTP/2 (preface detection and ALPN `h2`).
    pub http2_enabled: bool,
    /// TLS material; `None` disables the TLS branch entirely.
    pub tls: Option<TlsSettings>,
}

impl ServerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            port: 8080,
            document_root: PathBuf::from("./www"),
            worker_threads: 4,
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(5),
            http2_enabled: true,
            tls: None,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.document_root = root.into();
        self
    }

    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, enabled: bool, timeout: Duration) -> Self {
        self.keep_alive = enabled;
        self.keep_alive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_http2(mut self, enabled: bool) -> Self {
        self.http2_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsSettings {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }
        if self.keep_alive_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    InvalidPort,
    InvalidThreadCount,
    InvalidTimeout,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort => write!(f, "port must be between 1 and 65535"),
            Self::InvalidThreadCount => write!(f, "thread count must be greater than 0"),
            Self::InvalidTimeout => write!(f, "keep-alive timeout must be greater than 0"),
        }
    }
}

impl std::error::Error for ConfigError {}
