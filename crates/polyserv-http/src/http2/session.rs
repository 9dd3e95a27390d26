//! HTTP/2 server session engine.
//!
//! One [`Http2Session`] per connection. The dispatcher feeds it raw bytes
//! and flushes [`take_output`](Http2Session::take_output) to the transport
//! after every feed; the session never performs I/O itself.
//!
//! The engine owns:
//!
//! - the stream table (`BTreeMap` keyed by stream id, so frame emission
//!   order is deterministic),
//! - the priority table — entries may arrive via PRIORITY before the stream
//!   they describe exists,
//! - flow-control windows (connection + per-stream send windows, credited by
//!   WINDOW_UPDATE),
//! - server push: PUSH_PROMISE plus a synthesized request-complete stream
//!   for each pushed resource,
//! - the connection preface, tracked per session.
//!
//! Response bodies drain through [`pump`](Http2Session::pump), which chunks
//! them into DATA frames bounded by the peer's MAX_FRAME_SIZE and both send
//! windows; a stream leaves the table the moment its END_STREAM goes out.

use super::frame::{
    self, encode_frame, encode_settings, flags, parse_settings, FrameDecoder, FrameHeader,
    FrameType, PREFACE,
};
use super::hpack::{encode_header_block, HpackDecoder};
use super::Http2Error;
use polyserv_core::static_files::mime_type;
use polyserv_core::FileReader;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// RFC 7540 default flow-control window.
const DEFAULT_WINDOW: i32 = 65_535;

/// Frame size floor/ceiling per RFC 7540 §6.5.2.
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_ALLOWED_FRAME_SIZE: u32 = 16_777_215;

/// The SETTINGS this server announces.
const SERVER_SETTINGS: [(u16, u32); 5] = [
    (frame::settings::MAX_CONCURRENT_STREAMS, 100),
    (frame::settings::INITIAL_WINDOW_SIZE, 65_536),
    (frame::settings::MAX_FRAME_SIZE, 16_384),
    (frame::settings::ENABLE_PUSH, 1),
    (frame::settings::MAX_HEADER_LIST_SIZE, 8_192),
];

/// Static push map: request path -> resources promised alongside it.
const PUSH_MAP: [(&str, &[&str]); 4] = [
    ("/", &["/style.css", "/demo.html"]),
    ("/index.html", &["/style.css", "/demo.html"]),
    ("/dashboard.html", &["/style.css", "/data.json"]),
    ("/demo.html", &["/style.css"]),
];

/// Most recent priority information for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    pub dependency: u32,
    /// 1..=256.
    pub weight: u16,
    pub exclusive: bool,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self {
            dependency: 0,
            weight: 16,
            exclusive: false,
        }
    }
}

/// Per-stream request/response state.
#[derive(Debug)]
struct Http2Stream {
    id: u32,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    headers_complete: bool,
    request_complete: bool,
    status: u16,
    response_headers: Vec<(String, String)>,
    response_body: Vec<u8>,
    response_data_sent: usize,
    response_submitted: bool,
    /// Cleared on pushed streams so a push never cascades.
    push_allowed: bool,
    send_window: i32,
}

impl Http2Stream {
    fn new(id: u32, send_window: i32) -> Self {
        Self {
            id,
            method: String::new(),
            path: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            headers_complete: false,
            request_complete: false,
            status: 200,
            response_headers: Vec::new(),
            response_body: Vec::new(),
            response_data_sent: 0,
            response_submitted: false,
            push_allowed: true,
            send_window,
        }
    }

    fn pending_response_bytes(&self) -> usize {
        self.response_body.len() - self.response_data_sent
    }
}

/// Session-level options fixed at accept time.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Server-side master switch for PUSH_PROMISE.
    pub push_enabled: bool,
    /// `:scheme` used in push promises: `http` or `https`.
    pub scheme: &'static str,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            scheme: "http",
        }
    }
}

/// Server-side HTTP/2 session state machine.
pub struct Http2Session {
    files: Arc<FileReader>,
    config: SessionConfig,
    decoder: FrameDecoder,
    hpack: HpackDecoder,
    streams: BTreeMap<u32, Http2Stream>,
    priorities: HashMap<u32, StreamPriority>,
    output: Vec<u8>,
    preface_buffer: Vec<u8>,
    preface_processed: bool,
    goaway_received: bool,
    client_push_enabled: bool,
    client_initial_window: i32,
    client_max_frame_size: u32,
    conn_send_window: i32,
    next_push_stream_id: u32,
}

impl Http2Session {
    #[must_use]
    pub fn new(files: Arc<FileReader>, config: SessionConfig) -> Self {
        Self {
            files,
            config,
            decoder: FrameDecoder::new(),
            hpack: HpackDecoder::new(),
            streams: BTreeMap::new(),
            priorities: HashMap::new(),
            output: Vec::new(),
            preface_buffer: Vec::new(),
            preface_processed: false,
            goaway_received: false,
            client_push_enabled: true,
            client_initial_window: DEFAULT_WINDOW,
            client_max_frame_size: MIN_FRAME_SIZE,
            conn_send_window: DEFAULT_WINDOW,
            next_push_stream_id: 2,
        }
    }

    /// Queue the server's initial SETTINGS. Must run before any `feed`.
    pub fn start(&mut self) -> Result<(), Http2Error> {
        let payload = encode_settings(&SERVER_SETTINGS);
        self.queue_frame(FrameType::Settings, 0, 0, &payload)
    }

    /// Process incoming bytes: strip the preface exactly once, then decode
    /// and handle every complete frame, then refill the output buffer.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), Http2Error> {
        if !self.preface_processed {
            self.preface_buffer.extend_from_slice(data);
            if self.preface_buffer.len() < PREFACE.len() {
                return Ok(());
            }
            if &self.preface_buffer[..PREFACE.len()] != PREFACE {
                return Err(Http2Error::Protocol("bad connection preface"));
            }
            let rest = self.preface_buffer.split_off(PREFACE.len());
            self.preface_buffer = Vec::new();
            self.preface_processed = true;
            self.decoder.push(&rest);
        } else {
            self.decoder.push(data);
        }

        while let Some(frame) = self.decoder.next_frame(MIN_FRAME_SIZE)? {
            self.handle_frame(frame.header, &frame.payload)?;
        }

        self.pump()?;
        Ok(())
    }

    /// True while the session still reads from the peer.
    #[must_use]
    pub fn want_read(&self) -> bool {
        !self.goaway_received
    }

    /// True when buffered output or window-blocked response data remains.
    #[must_use]
    pub fn want_write(&self) -> bool {
        !self.output.is_empty()
            || self
                .streams
                .values()
                .any(|s| s.response_submitted && s.pending_response_bytes() > 0)
    }

    /// Drain the bytes the dispatcher must write to the transport.
    #[must_use]
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Latest priority recorded for a stream, if any.
    #[must_use]
    pub fn priority(&self, stream_id: u32) -> Option<StreamPriority> {
        self.priorities.get(&stream_id).copied()
    }

    fn handle_frame(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        match header.frame_type() {
            FrameType::Headers => self.on_headers(header, payload)?,
            FrameType::Data => self.on_data(header, payload)?,
            FrameType::Settings => self.on_settings(header, payload)?,
            FrameType::WindowUpdate => self.on_window_update(header, payload)?,
            FrameType::Priority => self.on_priority(header, payload)?,
            FrameType::Ping => self.on_ping(header, payload)?,
            FrameType::RstStream => {
                self.streams.remove(&header.stream_id);
            }
            FrameType::Goaway => {
                self.goaway_received = true;
            }
            // CONTINUATION, PUSH_PROMISE from clients, unknown types: ignored.
            _ => {}
        }
        Ok(())
    }

    fn on_headers(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream_id == 0 {
            return Err(Http2Error::Protocol("HEADERS on stream 0"));
        }

        let mut fragment = payload;

        // PADDED: one pad-length octet up front, padding at the tail.
        if header.has_flag(flags::PADDED) {
            let pad = usize::from(*fragment.first().ok_or(Http2Error::Protocol(
                "HEADERS too short for pad length",
            ))?);
            fragment = &fragment[1..];
            if pad > fragment.len() {
                return Err(Http2Error::Protocol("HEADERS padding exceeds payload"));
            }
            fragment = &fragment[..fragment.len() - pad];
        }

        // PRIORITY flag: exclusive bit + dependency + weight before the block.
        if header.has_flag(flags::PRIORITY) {
            if fragment.len() < 5 {
                return Err(Http2Error::Protocol("HEADERS too short for priority"));
            }
            let raw = u32::from_be_bytes([fragment[0], fragment[1], fragment[2], fragment[3]]);
            self.priorities.insert(
                header.stream_id,
                StreamPriority {
                    dependency: raw & 0x7FFF_FFFF,
                    weight: u16::from(fragment[4]) + 1,
                    exclusive: raw & 0x8000_0000 != 0,
                },
            );
            fragment = &fragment[5..];
        }

        let initial_window = self.client_initial_window;
        self.streams
            .entry(header.stream_id)
            .or_insert_with(|| Http2Stream::new(header.stream_id, initial_window));

        // Without END_HEADERS a CONTINUATION would follow; those are not
        // handled, so the stream simply never completes its headers.
        if header.has_flag(flags::END_HEADERS) {
            let decoded = self.hpack.decode(fragment)?;
            let stream = self
                .streams
                .get_mut(&header.stream_id)
                .ok_or(Http2Error::Protocol("stream vanished"))?;
            for (name, value) in decoded {
                let name = String::from_utf8_lossy(&name).into_owned();
                let value = String::from_utf8_lossy(&value).into_owned();
                match name.as_str() {
                    ":method" => stream.method = value,
                    ":path" => stream.path = value,
                    _ => {
                        stream.headers.insert(name, value);
                    }
                }
            }
            stream.headers_complete = true;
        }

        if header.has_flag(flags::END_STREAM) {
            if let Some(stream) = self.streams.get_mut(&header.stream_id) {
                stream.request_complete = true;
            }
        }

        let ready = self
            .streams
            .get(&header.stream_id)
            .map(|s| s.request_complete && s.headers_complete)
            .unwrap_or(false);
        if ready {
            self.dispatch(header.stream_id)?;
        }
        Ok(())
    }

    fn on_data(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream_id == 0 {
            return Err(Http2Error::Protocol("DATA on stream 0"));
        }

        let mut data = payload;
        if header.has_flag(flags::PADDED) {
            let pad = usize::from(
                *data
                    .first()
                    .ok_or(Http2Error::Protocol("DATA too short for pad length"))?,
            );
            data = &data[1..];
            if pad > data.len() {
                return Err(Http2Error::Protocol("DATA padding exceeds payload"));
            }
            data = &data[..data.len() - pad];
        }

        if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.body.extend_from_slice(data);
            if header.has_flag(flags::END_STREAM) {
                stream.request_complete = true;
            }
        }

        // Replenish both windows by the full frame length, padding included.
        if header.length > 0 {
            let increment = header.length.to_be_bytes();
            self.queue_frame(FrameType::WindowUpdate, 0, header.stream_id, &increment)?;
            self.queue_frame(FrameType::WindowUpdate, 0, 0, &increment)?;
        }

        let ready = self
            .streams
            .get(&header.stream_id)
            .map(|s| s.request_complete && s.headers_complete && !s.response_submitted)
            .unwrap_or(false);
        if ready {
            self.dispatch(header.stream_id)?;
        }
        Ok(())
    }

    fn on_settings(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.has_flag(flags::ACK) {
            // Our SETTINGS were acknowledged; nothing to update.
            return Ok(());
        }

        for (id, value) in parse_settings(payload)? {
            match id {
                frame::settings::ENABLE_PUSH => {
                    self.client_push_enabled = value == 1;
                }
                frame::settings::INITIAL_WINDOW_SIZE => {
                    let new = i32::try_from(value.min(0x7FFF_FFFF)).unwrap_or(i32::MAX);
                    let delta = new - self.client_initial_window;
                    self.client_initial_window = new;
                    for stream in self.streams.values_mut() {
                        stream.send_window = stream.send_window.saturating_add(delta);
                    }
                }
                frame::settings::MAX_FRAME_SIZE => {
                    self.client_max_frame_size = value.clamp(MIN_FRAME_SIZE, MAX_ALLOWED_FRAME_SIZE);
                }
                _ => {}
            }
        }

        self.queue_frame(FrameType::Settings, flags::ACK, 0, &[])
    }

    fn on_window_update(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if payload.len() != 4 {
            return Err(Http2Error::Protocol("WINDOW_UPDATE payload must be 4 bytes"));
        }
        let increment =
            (u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF)
                as i32;

        if header.stream_id == 0 {
            self.conn_send_window = self.conn_send_window.saturating_add(increment);
        } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.send_window = stream.send_window.saturating_add(increment);
        }
        Ok(())
    }

    fn on_priority(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if payload.len() != 5 {
            return Err(Http2Error::Protocol("PRIORITY payload must be 5 bytes"));
        }
        if header.stream_id == 0 {
            return Err(Http2Error::Protocol("PRIORITY on stream 0"));
        }

        let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        // May arrive before the stream itself exists; the table is independent.
        self.priorities.insert(
            header.stream_id,
            StreamPriority {
                dependency: raw & 0x7FFF_FFFF,
                weight: u16::from(payload[4]) + 1,
                exclusive: raw & 0x8000_0000 != 0,
            },
        );
        Ok(())
    }

    fn on_ping(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.has_flag(flags::ACK) {
            return Ok(());
        }
        if payload.len() != 8 {
            return Err(Http2Error::Protocol("PING payload must be 8 bytes"));
        }
        self.queue_frame(FrameType::Ping, flags::ACK, 0, payload)
    }

    /// Serve a request-complete stream and queue its response.
    fn dispatch(&mut self, stream_id: u32) -> Result<(), Http2Error> {
        let (method, path, body, push_allowed) = {
            let Some(stream) = self.streams.get(&stream_id) else {
                return Ok(());
            };
            (
                stream.method.clone(),
                stream.path.clone(),
                stream.body.clone(),
                stream.push_allowed,
            )
        };

        let (status, content_type, response_body) = self.produce_response(&method, &path, &body);

        let is_html = content_type == "text/html";
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.status = status;
            stream.response_headers = vec![("content-type".to_string(), content_type.to_string())];
            stream.response_body = response_body;
        }

        self.submit_response(stream_id)?;

        let pushable = status == 200
            && is_html
            && push_allowed
            && self.config.push_enabled
            && self.client_push_enabled;
        if pushable {
            for (trigger, resources) in PUSH_MAP {
                if trigger == path {
                    for resource in resources {
                        self.push_resource(stream_id, resource)?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn produce_response(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> (u16, &'static str, Vec<u8>) {
        match method {
            "GET" => {
                if self.files.file_exists(path) {
                    match self.files.read_file(path) {
                        Ok(content) => {
                            let mime_path = if path == "/" { "/index.html" } else { path };
                            (200, mime_type(mime_path), content)
                        }
                        Err(_) => (
                            500,
                            "text/html",
                            b"<!DOCTYPE html><html><body><h1>500 Internal Server Error</h1></body></html>"
                                .to_vec(),
                        ),
                    }
                } else {
                    (
                        404,
                        "text/html",
                        b"<!DOCTYPE html><html><body><h1>404 Not Found</h1></body></html>".to_vec(),
                    )
                }
            }
            "POST" => {
                let mut echo = b"POST request received. Body: ".to_vec();
                echo.extend_from_slice(body);
                (200, "text/plain", echo)
            }
            _ => (405, "text/plain", b"Method Not Allowed".to_vec()),
        }
    }

    /// Queue the HEADERS frame for a stream's response.
    fn submit_response(&mut self, stream_id: u32) -> Result<(), Http2Error> {
        let (block, body_empty) = {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };
            stream.response_submitted = true;

            let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(4);
            headers.push((b":status".to_vec(), stream.status.to_string().into_bytes()));
            headers.push((
                b"content-length".to_vec(),
                stream.response_body.len().to_string().into_bytes(),
            ));
            for (name, value) in &stream.response_headers {
                headers.push((name.clone().into_bytes(), value.clone().into_bytes()));
            }
            (encode_header_block(&headers), stream.response_body.is_empty())
        };

        let mut frame_flags = flags::END_HEADERS;
        if body_empty {
            frame_flags |= flags::END_STREAM;
        }
        self.queue_frame(FrameType::Headers, frame_flags, stream_id, &block)?;

        if body_empty {
            self.streams.remove(&stream_id);
        }
        Ok(())
    }

    /// Promise and serve one pushed resource.
    fn push_resource(&mut self, parent_id: u32, path: &str) -> Result<(), Http2Error> {
        let promised_id = self.next_push_stream_id;
        self.next_push_stream_id += 2;

        let pseudo: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":path".to_vec(), path.as_bytes().to_vec()),
            (b":scheme".to_vec(), self.config.scheme.as_bytes().to_vec()),
        ];
        let block = encode_header_block(&pseudo);

        let mut payload = Vec::with_capacity(4 + block.len());
        payload.extend_from_slice(&(promised_id & 0x7FFF_FFFF).to_be_bytes());
        payload.extend_from_slice(&block);
        self.queue_frame(FrameType::PushPromise, flags::END_HEADERS, parent_id, &payload)?;

        let mut stream = Http2Stream::new(promised_id, self.client_initial_window);
        stream.method = "GET".to_string();
        stream.path = path.to_string();
        stream.headers_complete = true;
        stream.request_complete = true;
        stream.push_allowed = false;
        self.streams.insert(promised_id, stream);

        self.dispatch(promised_id)
    }

    /// Move pending response bodies into DATA frames, bounded by the peer's
    /// frame size and both flow-control windows. Streams whose END_STREAM
    /// goes out are dropped from the table.
    fn pump(&mut self) -> Result<(), Http2Error> {
        let ids: Vec<u32> = self.streams.keys().copied().collect();

        for id in ids {
            loop {
                let (stream_id, chunk, finished) = {
                    let Some(stream) = self.streams.get(&id) else {
                        break;
                    };
                    if !stream.response_submitted {
                        break;
                    }
                    let remaining = stream.pending_response_bytes();
                    if remaining == 0 {
                        break;
                    }

                    let budget = (self.client_max_frame_size as usize)
                        .min(stream.send_window.max(0) as usize)
                        .min(self.conn_send_window.max(0) as usize);
                    if budget == 0 {
                        // Window-blocked; WINDOW_UPDATE will resume this.
                        break;
                    }

                    let size = remaining.min(budget);
                    let start = stream.response_data_sent;
                    (
                        stream.id,
                        stream.response_body[start..start + size].to_vec(),
                        size == remaining,
                    )
                };

                let size = chunk.len() as i32;
                let frame_flags = if finished { flags::END_STREAM } else { 0 };
                self.queue_frame(FrameType::Data, frame_flags, stream_id, &chunk)?;

                self.conn_send_window -= size;
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.send_window -= size;
                    stream.response_data_sent += size as usize;
                }

                if finished {
                    self.streams.remove(&id);
                    break;
                }
            }
        }
        Ok(())
    }

    fn queue_frame(
        &mut self,
        frame_type: FrameType,
        frame_flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<(), Http2Error> {
        let bytes = encode_frame(frame_type, frame_flags, stream_id, payload)?;
        self.output.extend_from_slice(&bytes);
        Ok(())
    }
}
