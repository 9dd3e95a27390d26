//! The connection dispatcher: accept loop, protocol detection, and the
//! per-connection handler flows.
//!
//! The accept loop runs on the caller's thread (normally `main`) and pokes
//! at the listener with a 1-second readiness wait so shutdown is observed
//! without blocking in `accept`. Every accepted socket gets 30-second
//! read/write timeouts, lands in the forced-close registry, is tracked for
//! keep-alive when enabled, and is handed to the worker pool.
//!
//! Protocol detection, per connection:
//!
//! 1. TLS enabled and the first peeked byte is `0x16` — TLS handshake,
//!    then ALPN routes to the HTTP/2 engine or the HTTP/1.1 loop, both
//!    reading through the TLS session.
//! 2. The first read starts with the 24-byte HTTP/2 preface — cleartext
//!    HTTP/2, with the already-read bytes fed as initial data.
//! 3. Otherwise HTTP/1.1. A request for `/ws` or `/websocket` carrying the
//!    upgrade headers hands the socket to the WebSocket engine; everything
//!    else goes through the router, looping while keep-alive holds.

use crate::http2::{Http2Error, Http2Session, SessionConfig};
use crate::net::{wait_readable, write_all, Transport};
use crate::request::{find_header_end, ParseError, Request};
use crate::response::ResponseWriter;
use crate::routes::Router;
use crate::tls::{NegotiatedProtocol, TlsAcceptor, TlsError};
use crate::websocket::{build_upgrade_response, is_upgrade_request, WebSocketHandler};
use polyserv_core::{
    ConfigError, FileReader, KeepAliveTracker, Logger, PerformanceMetrics, ResourceRegistry,
    ServerConfig, ShutdownCoordinator, UserStore, WorkerPool,
};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Socket-level read/write timeout applied to every accepted connection.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for receiving a complete HTTP/1.1 request head.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Readiness tick used by the accept loop and connection loops.
const POLL_TICK: Duration = Duration::from_secs(1);

/// Cap on a buffered request head.
const MAX_HEADER_BYTES: usize = 8192;

/// Cap on a buffered request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    Config(ConfigError),
    Tls(TlsError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Tls(e) => write!(f, "TLS setup error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Tls(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<TlsError> for ServerError {
    fn from(e: TlsError) -> Self {
        Self::Tls(e)
    }
}

/// How an HTTP/1.1 connection loop ended.
enum HttpOutcome {
    /// Served to completion (or failed); the socket closes.
    Done,
    /// A WebSocket upgrade was accepted; the 101 response has been sent and
    /// the socket should be handed to the WebSocket engine.
    UpgradedToWebSocket,
}

/// The assembled server: listener, worker pool, trackers, protocol engines.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    coordinator: ShutdownCoordinator,
    logger: Logger,
    pool: Arc<WorkerPool>,
    keepalive: KeepAliveTracker,
    resources: ResourceRegistry,
    metrics: Arc<PerformanceMetrics>,
    websockets: WebSocketHandler,
    router: Router,
    files: Arc<FileReader>,
    writer: ResponseWriter,
    tls: Option<Arc<TlsAcceptor>>,
    total_requests: Arc<AtomicU64>,
    stopped: AtomicBool,
}

impl Server {
    /// Bind the listener and assemble all components.
    ///
    /// Port 0 binds an ephemeral port (used by tests); CLI-level validation
    /// happens before this.
    pub fn bind(
        config: ServerConfig,
        coordinator: ShutdownCoordinator,
        logger: Logger,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))?;

        let tls = match &config.tls {
            Some(settings) => Some(Arc::new(TlsAcceptor::new(
                &settings.cert_path,
                &settings.key_path,
                config.http2_enabled,
            )?)),
            None => None,
        };

        let writer = ResponseWriter::new(config.keep_alive, config.keep_alive_timeout.as_secs());
        let metrics = Arc::new(PerformanceMetrics::new());
        let pool = Arc::new(WorkerPool::new(
            config.worker_threads,
            coordinator.clone(),
            logger.clone(),
        ));
        let keepalive = KeepAliveTracker::new(config.keep_alive_timeout);
        let resources = ResourceRegistry::new();
        let files = Arc::new(FileReader::new(&config.document_root));
        let users = Arc::new(UserStore::new());
        let websockets =
            WebSocketHandler::new(Arc::clone(&metrics), coordinator.clone(), logger.clone());
        let total_requests = Arc::new(AtomicU64::new(0));
        let router = Router::new(
            Arc::clone(&files),
            users,
            writer.clone(),
            Arc::clone(&pool),
            keepalive.clone(),
            websockets.clone(),
            Arc::clone(&total_requests),
        );

        logger.info(format!(
            "server initialized on port {} (docroot {}, {} workers, keep-alive {})",
            config.port,
            config.document_root.display(),
            config.worker_threads,
            if config.keep_alive { "on" } else { "off" }
        ));

        Ok(Self {
            config,
            listener,
            coordinator,
            logger,
            pool,
            keepalive,
            resources,
            metrics,
            websockets,
            router,
            files,
            writer,
            tls,
            total_requests,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Run the accept loop until shutdown. Also starts the background
    /// loops: WebSocket broadcast/ping, the keep-alive sweeper, and the
    /// metrics sampler.
    pub fn run(self: &Arc<Self>) {
        self.websockets.start();
        if self.config.keep_alive {
            self.keepalive.spawn_sweeper(
                &self.coordinator,
                self.resources.clone(),
                self.logger.clone(),
            );
        }
        self.spawn_metrics_sampler();

        let listener_fd = self.listener.as_raw_fd();
        self.logger.info("accept loop running");

        while !self.coordinator.is_shutdown_requested() {
            match wait_readable(listener_fd, POLL_TICK) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    self.logger.error(format!("listener poll failed: {e}"));
                    break;
                }
            }

            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    if !self.coordinator.is_shutdown_requested() {
                        self.logger.error(format!("accept failed: {e}"));
                    }
                    continue;
                }
            };

            if self.coordinator.is_shutdown_requested() {
                break;
            }

            let _ = stream.set_read_timeout(Some(SOCKET_TIMEOUT));
            let _ = stream.set_write_timeout(Some(SOCKET_TIMEOUT));

            if self.resources.register(&stream).is_err() {
                continue;
            }
            if self.config.keep_alive {
                let _ = self.keepalive.add(&stream);
            }

            self.logger.debug(format!("accepted connection from {peer}"));

            let server = Arc::clone(self);
            self.pool.submit(move || {
                server.handle_client(stream);
            });
        }

        self.logger.info("accept loop exiting");
    }

    /// Coordinated teardown, idempotent. Mirrors the startup order in
    /// reverse: stop WebSocket loops, stop workers, force-close sockets,
    /// then wait (bounded) for registered threads.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.coordinator.request_shutdown();
        self.logger.info("initiating server cleanup");

        self.websockets.stop();
        self.pool.stop();

        let closed = self.resources.close_all();
        if closed > 0 {
            self.logger.info(format!("force-closed {closed} sockets"));
        }
        self.keepalive.clear();

        if !self.coordinator.wait_for_all_threads(Duration::from_secs(3)) {
            self.logger
                .warn("some threads did not exit in time; forcing shutdown");
            self.coordinator.force_shutdown_threads();
        }

        self.logger.info("server cleanup completed");
    }

    fn spawn_metrics_sampler(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while !server.coordinator.wait_for_shutdown(Duration::from_secs(1)) {
                let active = server.keepalive.connection_count()
                    + server.websockets.connection_count();
                server.metrics.record_system_metrics(
                    0,
                    -1.0,
                    active,
                    server.pool.queue_size(),
                    server.pool.thread_count(),
                );
            }
            server.coordinator.thread_exiting();
        });
        self.coordinator.register_thread(handle);
    }

    /// Worker-side entry point for one accepted connection.
    fn handle_client(&self, stream: TcpStream) {
        let fd = stream.as_raw_fd();

        if self.coordinator.is_shutdown_requested() {
            self.keepalive.remove(fd);
            self.resources.unregister(fd);
            return;
        }

        // On a WebSocket handover the tracking entries were already removed
        // before the socket changed owners, and the fd may have been reused
        // by a newer connection by the time we get back here.
        let handed_over = match self.dispatch_connection(stream) {
            Ok(handed_over) => handed_over,
            Err(e) => {
                if !self.coordinator.is_shutdown_requested() {
                    self.logger.debug(format!("connection ended: {e}"));
                }
                false
            }
        };

        if !handed_over {
            self.keepalive.remove(fd);
            self.resources.unregister(fd);
        }
    }

    /// Returns `Ok(true)` when the socket was handed to the WebSocket engine.
    fn dispatch_connection(&self, stream: TcpStream) -> Result<bool, ServerError> {
        // TLS detection: the first byte of a TLS ClientHello record is 0x16.
        if let Some(acceptor) = &self.tls {
            let mut first = [0u8; 1];
            match stream.peek(&mut first) {
                Ok(0) => return Ok(false),
                Ok(_) if first[0] == 0x16 => {
                    self.handle_tls_connection(acceptor.clone(), stream)?;
                    return Ok(false);
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(ServerError::Io(e)),
            }
        }

        self.handle_plain_connection(stream)
    }

    fn handle_plain_connection(&self, mut stream: TcpStream) -> Result<bool, ServerError> {
        // One read both detects the HTTP/2 preface and seeds HTTP/1.1
        // parsing with whatever arrived.
        let mut buffer = vec![0u8; 4096];
        let n = match stream.read(&mut buffer) {
            Ok(0) => return Ok(false),
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(false);
            }
            Err(e) => return Err(ServerError::Io(e)),
        };
        let initial = &buffer[..n];

        if self.config.http2_enabled
            && n >= crate::http2::PREFACE.len()
            && &initial[..crate::http2::PREFACE.len()] == crate::http2::PREFACE
        {
            self.logger.debug("HTTP/2 preface detected");
            let mut transport = Transport::Plain(stream);
            self.run_http2(&mut transport, initial)?;
            return Ok(false);
        }

        let fd = stream.as_raw_fd();
        let mut transport = Transport::Plain(stream);
        match self.run_http1(&mut transport, initial.to_vec())? {
            HttpOutcome::Done => Ok(false),
            HttpOutcome::UpgradedToWebSocket => {
                // The socket leaves HTTP land: stop tracking it here, the
                // WebSocket registry owns it from now on.
                self.keepalive.remove(fd);
                self.resources.unregister(fd);

                let Transport::Plain(stream) = transport else {
                    return Ok(true);
                };
                if let Err(e) = self.websockets.handle_connection(stream) {
                    if !self.coordinator.is_shutdown_requested() {
                        self.logger.debug(format!("websocket session ended: {e}"));
                    }
                }
                Ok(true)
            }
        }
    }

    fn handle_tls_connection(
        &self,
        acceptor: Arc<TlsAcceptor>,
        stream: TcpStream,
    ) -> Result<(), ServerError> {
        let (mut transport, protocol) = match acceptor.accept(stream) {
            Ok(done) => done,
            Err(e) => {
                self.logger.debug(format!("TLS handshake failed: {e}"));
                return Ok(());
            }
        };

        match protocol {
            NegotiatedProtocol::H2 => {
                self.logger.debug("ALPN selected h2");
                self.run_http2(&mut transport, &[])
            }
            NegotiatedProtocol::Http11 => {
                self.logger.debug("ALPN selected http/1.1");
                // Upgrades are a cleartext-only affair; over TLS the /ws
                // path just routes normally.
                self.run_http1(&mut transport, Vec::new()).map(|_| ())
            }
        }
    }

    // ------------------------------------------------------------------
    // HTTP/1.1
    // ------------------------------------------------------------------

    fn run_http1(
        &self,
        transport: &mut Transport,
        initial: Vec<u8>,
    ) -> Result<HttpOutcome, ServerError> {
        let fd = transport.raw_fd();
        let mut pending = initial;

        loop {
            if self.coordinator.is_shutdown_requested() {
                return Ok(HttpOutcome::Done);
            }

            let started = Instant::now();
            let Some(raw) = self.read_http1_request(transport, &mut pending)? else {
                return Ok(HttpOutcome::Done);
            };

            let request = match Request::parse(&raw) {
                Ok(request) => request,
                Err(error) => {
                    self.finish_bad_request(transport, error, started);
                    return Ok(HttpOutcome::Done);
                }
            };

            // WebSocket upgrade: cleartext connections only.
            if !transport.is_tls()
                && is_websocket_path(&request.path)
                && is_upgrade_request(&request)
            {
                let Some(key) = request.header("sec-websocket-key") else {
                    return Ok(HttpOutcome::Done);
                };
                let response = build_upgrade_response(key);
                write_all(transport, &response)?;
                self.logger
                    .request(&request.method, &request.path, 101, 0);
                return Ok(HttpOutcome::UpgradedToWebSocket);
            }

            let keep_alive = self.should_keep_alive(&request);
            let routed = self.router.handle(&request, keep_alive);

            if self.coordinator.is_shutdown_requested() {
                return Ok(HttpOutcome::Done);
            }
            write_all(transport, &routed.bytes)?;

            if routed.keep_alive && self.config.keep_alive {
                self.keepalive.touch(fd);
            }

            let elapsed_ms = started.elapsed().as_millis();
            self.logger
                .request(&request.method, &request.path, routed.status, elapsed_ms);
            self.metrics.record_request(
                &request.method,
                &request.path,
                routed.status,
                elapsed_ms as f64,
            );
            self.total_requests.fetch_add(1, Ordering::Relaxed);

            if !routed.keep_alive {
                return Ok(HttpOutcome::Done);
            }
        }
    }

    fn finish_bad_request(&self, transport: &mut Transport, error: ParseError, started: Instant) {
        if self.coordinator.is_shutdown_requested() {
            return;
        }
        self.logger.debug(format!("request parse failed: {error}"));
        let _ = write_all(transport, &self.writer.bad_request());

        let elapsed_ms = started.elapsed().as_millis();
        self.logger.request("INVALID", "INVALID", 400, elapsed_ms);
        self.metrics
            .record_request("INVALID", "INVALID", 400, elapsed_ms as f64);
    }

    /// Collect one complete request (head plus declared body) from the
    /// transport. `pending` carries bytes already read; leftover pipelined
    /// bytes are put back for the next call.
    ///
    /// `None` means the connection should close: timeout, EOF, oversized
    /// head, or shutdown.
    fn read_http1_request(
        &self,
        transport: &mut Transport,
        pending: &mut Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ServerError> {
        let deadline = Instant::now() + HEADER_READ_TIMEOUT;
        let mut data = std::mem::take(pending);
        let mut chunk = vec![0u8; 4096];

        let head_end = loop {
            if let Some(end) = find_header_end(&data) {
                break end + 4;
            }
            if data.len() > MAX_HEADER_BYTES {
                return Ok(None);
            }
            if Instant::now() >= deadline || self.coordinator.is_shutdown_requested() {
                return Ok(None);
            }

            match transport.wait_readable(POLL_TICK) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => return Err(ServerError::Io(e)),
            }
            match transport.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(ServerError::Io(e)),
            }
        };

        // Complete the body up to Content-Length.
        let declared = scan_content_length(&data[..head_end]).unwrap_or(0);
        let declared = declared.min(MAX_BODY_BYTES);
        let total = head_end + declared;
        let body_deadline = Instant::now() + HEADER_READ_TIMEOUT;

        while data.len() < total {
            if Instant::now() >= body_deadline || self.coordinator.is_shutdown_requested() {
                return Ok(None);
            }
            match transport.wait_readable(POLL_TICK) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => return Err(ServerError::Io(e)),
            }
            match transport.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(ServerError::Io(e)),
            }
        }

        // Anything past this request belongs to the next one.
        if data.len() > total {
            *pending = data.split_off(total);
        }
        Ok(Some(data))
    }

    /// Keep-alive iff globally enabled, the request is HTTP/1.1, and the
    /// client did not send `Connection: close`.
    fn should_keep_alive(&self, request: &Request) -> bool {
        if !self.config.keep_alive {
            return false;
        }
        if request.version != "HTTP/1.1" {
            return false;
        }
        !request
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // HTTP/2
    // ------------------------------------------------------------------

    fn run_http2(&self, transport: &mut Transport, initial: &[u8]) -> Result<(), ServerError> {
        let scheme = if transport.is_tls() { "https" } else { "http" };
        let mut session = Http2Session::new(
            Arc::clone(&self.files),
            SessionConfig {
                push_enabled: true,
                scheme,
            },
        );

        if let Err(e) = self.drive_http2(&mut session, transport, initial) {
            if !self.coordinator.is_shutdown_requested() {
                self.logger.debug(format!("HTTP/2 session ended: {e}"));
            }
        }
        // Codec errors close this session, never the process.
        Ok(())
    }

    fn drive_http2(
        &self,
        session: &mut Http2Session,
        transport: &mut Transport,
        initial: &[u8],
    ) -> Result<(), Http2Error> {
        session.start()?;
        write_all(transport, &session.take_output())?;

        if !initial.is_empty() {
            session.feed(initial)?;
            let out = session.take_output();
            if !out.is_empty() {
                write_all(transport, &out)?;
            }
        }

        let mut buffer = vec![0u8; 16384];
        while !self.coordinator.is_shutdown_requested()
            && (session.want_read() || session.want_write())
        {
            let out = session.take_output();
            if !out.is_empty() {
                write_all(transport, &out)?;
            }
            if !session.want_read() && !session.want_write() {
                break;
            }

            match transport.wait_readable(POLL_TICK) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => return Err(Http2Error::Io(e)),
            }
            let n = match transport.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(Http2Error::Io(e)),
            };
            session.feed(&buffer[..n])?;

            let out = session.take_output();
            if !out.is_empty() {
                write_all(transport, &out)?;
            }
        }

        // Drain whatever is still queued before closing.
        let out = session.take_output();
        if !out.is_empty() {
            let _ = write_all(transport, &out);
        }
        Ok(())
    }
}

fn is_websocket_path(path: &str) -> bool {
    path == "/ws" || path == "/websocket"
}

/// Light scan of the head for `Content-Length` without a full parse.
fn scan_content_length(head: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_paths() {
        assert!(is_websocket_path("/ws"));
        assert!(is_websocket_path("/websocket"));
        assert!(!is_websocket_path("/ws/extra"));
        assert!(!is_websocket_path("/"));
    }

    #[test]
    fn content_length_scan() {
        assert_eq!(
            scan_content_length(b"POST / HTTP/1.1\r\nContent-Length: 42\r\n\r\n"),
            Some(42)
        );
        assert_eq!(
            scan_content_length(b"POST / HTTP/1.1\r\ncontent-length:7\r\n\r\n"),
            Some(7)
        );
        assert_eq!(
            scan_content_length(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            None
        );
    }

    #[test]
    fn server_error_display() {
        let err = ServerError::Io(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(err.to_string().contains("I/O error"));
        assert!(ServerError::Config(ConfigError::InvalidPort)
            .to_string()
            .contains("configuration"));
    }
}
