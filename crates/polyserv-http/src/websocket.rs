//! WebSocket support (RFC 6455): handshake, frame codec, connection
//! registry, and the broadcast/ping background loops.
//!
//! SHA-1 and base64 are implemented here; the handshake is the only
//! consumer and needs no crypto dependency.
//!
//! # Concurrency
//!
//! Each accepted WebSocket runs its receive loop on the worker thread that
//! performed the upgrade, pacing on a 1-second readiness wait so shutdown is
//! observed promptly. The registry (`client id -> connection`) is shared
//! with two background loops:
//!
//! - broadcast loop: system metrics every second, request rate every fifth
//!   tick; skips a cycle when the registry lock is not free within 100 ms
//! - ping loop: a ping to every client every 30 seconds; send failures mark
//!   the connection dead and remove it
//!
//! All writes from the loops happen under the registry lock, which
//! serializes them against command replies.

use crate::net::wait_readable;
use polyserv_core::{Logger, PerformanceMetrics, ShutdownCoordinator};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Handshake GUID (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on accepted frame payloads.
const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Readiness tick for the receive loop.
const RECEIVE_POLL: Duration = Duration::from_secs(1);

/// Broadcast cadence; every fifth tick also carries the request rate.
const BROADCAST_PERIOD: Duration = Duration::from_secs(1);
const RATE_BROADCAST_EVERY: u32 = 5;

/// Ping cadence.
const PING_PERIOD: Duration = Duration::from_secs(30);

/// Budget for joining each background loop during stop().
const LOOP_JOIN_BUDGET: Duration = Duration::from_secs(2);

/// Frame opcodes (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, WebSocketError> {
        match value & 0x0F {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WebSocketError::Protocol(format!("unknown opcode 0x{other:X}"))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

#[derive(Debug)]
pub enum WebSocketError {
    Io(io::Error),
    Protocol(String),
    ConnectionClosed,
    FrameTooLarge(usize),
}

impl std::fmt::Display for WebSocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "websocket I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "websocket protocol error: {msg}"),
            Self::ConnectionClosed => write!(f, "websocket connection closed"),
            Self::FrameTooLarge(size) => write!(f, "websocket frame too large: {size} bytes"),
        }
    }
}

impl std::error::Error for WebSocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WebSocketError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// `Sec-WebSocket-Accept` for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key.trim());
    input.push_str(WS_GUID);
    base64_encode(&sha1(input.as_bytes()))
}

/// Does this request carry the WebSocket upgrade headers?
///
/// Requires `Connection` to list `upgrade`, `Upgrade: websocket`, and a
/// non-empty `Sec-WebSocket-Key`.
#[must_use]
pub fn is_upgrade_request(request: &crate::request::Request) -> bool {
    let connection_upgrades = request
        .header("connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let upgrade_websocket = request
        .header("upgrade")
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_key = request
        .header("sec-websocket-key")
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);

    connection_upgrades && upgrade_websocket && has_key
}

/// The `101 Switching Protocols` response completing the handshake.
#[must_use]
pub fn build_upgrade_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

// ============================================================================
// Frame codec
// ============================================================================

/// One parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Read a single frame.
///
/// Client frames are normally masked; unmasked frames are tolerated and
/// passed through, matching the permissive receive path this server always
/// had.
pub fn read_frame(reader: &mut impl Read) -> Result<WsFrame, WebSocketError> {
    let mut head = [0u8; 2];
    read_exact_or_closed(reader, &mut head)?;

    let fin = head[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(head[0])?;
    let masked = head[1] & 0x80 != 0;

    let payload_len = match head[1] & 0x7F {
        len @ 0..=125 => usize::from(len),
        126 => {
            let mut ext = [0u8; 2];
            read_exact_or_closed(reader, &mut ext)?;
            usize::from(u16::from_be_bytes(ext))
        }
        _ => {
            let mut ext = [0u8; 8];
            read_exact_or_closed(reader, &mut ext)?;
            usize::try_from(u64::from_be_bytes(ext))
                .map_err(|_| WebSocketError::FrameTooLarge(usize::MAX))?
        }
    };
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(WebSocketError::FrameTooLarge(payload_len));
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        read_exact_or_closed(reader, &mut key)?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        read_exact_or_closed(reader, &mut payload)?;
    }
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(WsFrame {
        fin,
        opcode,
        payload,
    })
}

/// Write a single server frame: FIN set, never masked, smallest length form.
pub fn write_frame(
    writer: &mut impl Write,
    opcode: Opcode,
    payload: &[u8],
) -> Result<(), WebSocketError> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x80 | opcode.to_u8());

    match payload.len() {
        len @ 0..=125 => frame.push(len as u8),
        len @ 126..=0xFFFF => {
            frame.push(126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);

    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

fn read_exact_or_closed(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), WebSocketError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(WebSocketError::ConnectionClosed),
        Err(e) => Err(WebSocketError::Io(e)),
    }
}

// ============================================================================
// Connection registry and handler
// ============================================================================

struct WsConnection {
    stream: TcpStream,
    last_ping: Instant,
    #[allow(dead_code)]
    authenticated: bool,
}

struct WsHandlerState {
    connections: Mutex<HashMap<u64, WsConnection>>,
    next_client_id: AtomicU64,
    running: AtomicBool,
    metrics: Arc<PerformanceMetrics>,
    coordinator: ShutdownCoordinator,
    logger: Logger,
    loop_handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// WebSocket engine: registry plus broadcast and ping loops.
#[derive(Clone)]
pub struct WebSocketHandler {
    state: Arc<WsHandlerState>,
}

impl WebSocketHandler {
    #[must_use]
    pub fn new(
        metrics: Arc<PerformanceMetrics>,
        coordinator: ShutdownCoordinator,
        logger: Logger,
    ) -> Self {
        Self {
            state: Arc::new(WsHandlerState {
                connections: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                metrics,
                coordinator,
                logger,
                loop_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the broadcast and ping loops.
    pub fn start(&self) {
        self.state.running.store(true, Ordering::Release);

        let broadcast = {
            let handler = self.clone();
            std::thread::spawn(move || handler.broadcast_loop())
        };
        let ping = {
            let handler = self.clone();
            std::thread::spawn(move || handler.ping_loop())
        };

        let mut handles = self.state.loop_handles.lock();
        handles.push(("broadcast", broadcast));
        handles.push(("ping", ping));
    }

    /// Stop the loops (2-second join budget each, detach on timeout) and
    /// force-close every registered connection.
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        self.state.coordinator.request_shutdown();

        let handles: Vec<(&'static str, JoinHandle<()>)> =
            self.state.loop_handles.lock().drain(..).collect();
        for (name, handle) in handles {
            self.join_with_budget(name, handle);
        }

        let mut connections = self.state.connections.lock();
        for (_, connection) in connections.drain() {
            let _ = connection.stream.shutdown(Shutdown::Both);
        }
    }

    fn join_with_budget(&self, name: &'static str, handle: JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let joiner = std::thread::spawn(move || {
            let _ = handle.join();
            let _ = tx.send(());
        });
        match rx.recv_timeout(LOOP_JOIN_BUDGET) {
            Ok(()) => {
                let _ = joiner.join();
            }
            Err(_) => {
                self.state
                    .logger
                    .warn(format!("websocket {name} loop did not exit in time; detaching"));
            }
        }
    }

    /// Registered connection count; `0` when the lock is contended.
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

    /// Run the receive loop for an upgraded connection. Blocks until the
    /// client closes, an error occurs, or shutdown is requested.
    ///
    /// The 101 response must already have been written by the caller.
    pub fn handle_connection(&self, stream: TcpStream) -> Result<(), WebSocketError> {
        let client_id = self.state.next_client_id.fetch_add(1, Ordering::Relaxed);

        let registry_handle = stream.try_clone()?;
        self.state.connections.lock().insert(
            client_id,
            WsConnection {
                stream: registry_handle,
                last_ping: Instant::now(),
                authenticated: false,
            },
        );
        self.state
            .logger
            .debug(format!("websocket client {client_id} connected"));

        let result = self.receive_loop(client_id, stream);

        // Removing the registry entry is the single close point for the
        // socket owned there; the loop's own handle drops with this frame.
        self.remove_connection(client_id);
        self.state
            .logger
            .debug(format!("websocket client {client_id} disconnected"));
        result
    }

    fn receive_loop(&self, client_id: u64, mut stream: TcpStream) -> Result<(), WebSocketError> {
        let fd = stream.as_raw_fd();

        while self.state.running.load(Ordering::Acquire)
            && !self.state.coordinator.is_shutdown_requested()
        {
            match wait_readable(fd, RECEIVE_POLL) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => return Err(WebSocketError::Io(e)),
            }

            let frame = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(WebSocketError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match frame.opcode {
                Opcode::Close => return Ok(()),
                Opcode::Ping => {
                    write_frame(&mut stream, Opcode::Pong, &frame.payload)?;
                }
                Opcode::Text => {
                    let command = String::from_utf8_lossy(&frame.payload);
                    self.handle_command(client_id, command.trim());
                }
                // Binary, pong and stray continuations are ignored.
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_command(&self, client_id: u64, command: &str) {
        let reply = match command {
            "request_metrics" => self.state.metrics.metrics_json(),
            "request_rate" => self.state.metrics.request_rate_json(),
            "system_metrics" => self.state.metrics.system_metrics_json(),
            _ => return,
        };
        self.send_to_client(client_id, &reply);
    }

    /// Send a text message to one client; drops the connection on failure.
    pub fn send_to_client(&self, client_id: u64, message: &str) {
        let Some(mut connections) = self
            .state
            .connections
            .try_lock_for(Duration::from_millis(100))
        else {
            return;
        };

        let failed = match connections.get_mut(&client_id) {
            Some(connection) => {
                write_frame(&mut connection.stream, Opcode::Text, message.as_bytes()).is_err()
            }
            None => false,
        };
        if failed {
            if let Some(connection) = connections.remove(&client_id) {
                let _ = connection.stream.shutdown(Shutdown::Both);
            }
        }
    }

    /// Best-effort text broadcast to every client. Skips the cycle when the
    /// registry lock is not available within 100 ms.
    pub fn broadcast(&self, message: &str) {
        if !self.state.running.load(Ordering::Acquire)
            || self.state.coordinator.is_shutdown_requested()
        {
            return;
        }
        let Some(mut connections) = self
            .state
            .connections
            .try_lock_for(Duration::from_millis(100))
        else {
            return;
        };

        let mut dead = Vec::new();
        for (client_id, connection) in connections.iter_mut() {
            if write_frame(&mut connection.stream, Opcode::Text, message.as_bytes()).is_err() {
                dead.push(*client_id);
            }
        }
        for client_id in dead {
            if let Some(connection) = connections.remove(&client_id) {
                let _ = connection.stream.shutdown(Shutdown::Both);
            }
        }
    }

    fn broadcast_loop(&self) {
        let mut tick: u32 = 0;
        while self.state.running.load(Ordering::Acquire)
            && !self.state.coordinator.wait_for_shutdown(BROADCAST_PERIOD)
        {
            tick = tick.wrapping_add(1);
            if self.connection_count() == 0 {
                continue;
            }

            self.broadcast(&self.state.metrics.system_metrics_json());
            if tick % RATE_BROADCAST_EVERY == 0 {
                self.broadcast(&self.state.metrics.request_rate_json());
            }
        }
    }

    fn ping_loop(&self) {
        while self.state.running.load(Ordering::Acquire)
            && !self.state.coordinator.wait_for_shutdown(PING_PERIOD)
        {
            let Some(mut connections) = self
                .state
                .connections
                .try_lock_for(Duration::from_millis(500))
            else {
                continue;
            };

            let mut dead = Vec::new();
            for (client_id, connection) in connections.iter_mut() {
                if write_frame(&mut connection.stream, Opcode::Ping, b"").is_err() {
                    dead.push(*client_id);
                } else {
                    connection.last_ping = Instant::now();
                }
            }
            for client_id in dead {
                if let Some(connection) = connections.remove(&client_id) {
                    let _ = connection.stream.shutdown(Shutdown::Both);
                }
            }
        }
    }

    fn remove_connection(&self, client_id: u64) {
        let removed = self.state.connections.lock().remove(&client_id);
        if let Some(connection) = removed {
            let _ = connection.stream.shutdown(Shutdown::Both);
        }
    }
}

// ============================================================================
// SHA-1 (RFC 3174) — handshake only
// ============================================================================

/// Standard SHA-1 round variables per RFC 3174.
#[allow(clippy::many_single_char_names)]
fn sha1(data: &[u8]) -> [u8; 20] {
    let mut h: [u32; 5] = [
        0x6745_2301,
        0xEFCD_AB89,
        0x98BA_DCFE,
        0x1032_5476,
        0xC3D2_E1F0,
    ];

    let bit_len = (data.len() as u64) * 8;
    let mut message = data.to_vec();
    message.push(0x80);
    while message.len() % 64 != 56 {
        message.push(0);
    }
    message.extend_from_slice(&bit_len.to_be_bytes());

    for block in message.chunks_exact(64) {
        let mut w = [0u32; 80];
        for (i, word) in w.iter_mut().take(16).enumerate() {
            *word = u32::from_be_bytes([
                block[i * 4],
                block[i * 4 + 1],
                block[i * 4 + 2],
                block[i * 4 + 3],
            ]);
        }
        for i in 16..80 {
            w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
        }

        let (mut a, mut b, mut c, mut d, mut e) = (h[0], h[1], h[2], h[3], h[4]);
        for (i, &word) in w.iter().enumerate() {
            let (f, k) = match i {
                0..=19 => ((b & c) | (!b & d), 0x5A82_7999u32),
                20..=39 => (b ^ c ^ d, 0x6ED9_EBA1),
                40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDC),
                _ => (b ^ c ^ d, 0xCA62_C1D6),
            };
            let temp = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(word);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = temp;
        }

        h[0] = h[0].wrapping_add(a);
        h[1] = h[1].wrapping_add(b);
        h[2] = h[2].wrapping_add(c);
        h[3] = h[3].wrapping_add(d);
        h[4] = h[4].wrapping_add(e);
    }

    let mut digest = [0u8; 20];
    for (i, word) in h.iter().enumerate() {
        digest[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    digest
}

// ============================================================================
// Base64 — handshake only
// ============================================================================

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = u32::from(chunk[0]);
        let b1 = chunk.get(1).copied().map(u32::from).unwrap_or(0);
        let b2 = chunk.get(2).copied().map(u32::from).unwrap_or(0);
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(BASE64_ALPHABET[(triple >> 18 & 0x3F) as usize] as char);
        out.push(BASE64_ALPHABET[(triple >> 12 & 0x3F) as usize] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6 & 0x3F) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[(triple & 0x3F) as usize] as char
        } else {
            '='
        });
    }
    out
}
