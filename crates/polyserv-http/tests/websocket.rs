//! End-to-end WebSocket tests: handshake, metrics commands, ping/pong.

use polyserv_core::{Logger, ServerConfig, ShutdownCoordinator};
use polyserv_http::Server;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    run_thread: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "polyserv-ws-test-{}-{tag}",
            std::process::id()
        ));
        std::fs::create_dir_all(&root).expect("create docroot");

        let server = Arc::new(
            Server::bind(
                ServerConfig::new()
                    .with_port(0)
                    .with_document_root(&root)
                    .with_worker_threads(2),
                ShutdownCoordinator::new(),
                Logger::disabled(),
            )
            .expect("bind server"),
        );
        let addr = server.local_addr().expect("local addr");
        let run_thread = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.run())
        };

        Self {
            server,
            addr,
            run_thread: Some(run_thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.coordinator().request_shutdown();
        if let Some(handle) = self.run_thread.take() {
            let _ = handle.join();
        }
        self.server.shutdown();
    }
}

/// Perform the upgrade on `path` and return the open socket plus the raw
/// 101 response head.
fn upgrade(server: &TestServer, path: &str) -> (TcpStream, String) {
    let mut stream = server.connect();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).expect("send upgrade");

    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).expect("read 101");
        assert!(n > 0, "connection closed during handshake");
        data.extend_from_slice(&chunk[..n]);
    }
    (stream, String::from_utf8_lossy(&data).into_owned())
}

fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let key = [0x37, 0xFA, 0x21, 0x3D];
    let mut frame = vec![0x80 | opcode];
    match payload.len() {
        len @ 0..=125 => frame.push(0x80 | len as u8),
        len @ 126..=0xFFFF => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

/// Read one (unmasked) server frame: (opcode, payload).
fn read_server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).expect("frame head");
    assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");

    let len = match head[1] & 0x7F {
        len @ 0..=125 => usize::from(len),
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).expect("extended length");
            usize::from(u16::from_be_bytes(ext))
        }
        _ => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).expect("extended length");
            u64::from_be_bytes(ext) as usize
        }
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("frame payload");
    (head[0] & 0x0F, payload)
}

#[test]
fn handshake_returns_rfc_accept_key() {
    let server = TestServer::start("handshake");
    let (_stream, head) = upgrade(&server, "/ws");

    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Upgrade: websocket\r\n"));
    assert!(head.contains("Connection: Upgrade\r\n"));
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n")));
}

#[test]
fn websocket_path_alias_also_upgrades() {
    let server = TestServer::start("alias");
    let (_stream, head) = upgrade(&server, "/websocket");
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
}

#[test]
fn request_metrics_command_returns_metrics_json() {
    let server = TestServer::start("metrics");
    let (mut stream, _head) = upgrade(&server, "/ws");

    stream
        .write_all(&masked_frame(0x1, b"request_metrics"))
        .expect("send command");

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x1, "text frame expected");
    let doc: serde_json::Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(doc["type"], "metrics");
    assert!(doc["data"]["total_requests"].as_u64().is_some());
}

#[test]
fn system_metrics_command_returns_series() {
    let server = TestServer::start("system");
    let (mut stream, _head) = upgrade(&server, "/ws");

    stream
        .write_all(&masked_frame(0x1, b"system_metrics"))
        .expect("send command");

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    let doc: serde_json::Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(doc["type"], "system_metrics");
    assert!(doc["data"].is_array());
}

#[test]
fn request_rate_command_returns_sixty_buckets() {
    let server = TestServer::start("rate");
    let (mut stream, _head) = upgrade(&server, "/ws");

    stream
        .write_all(&masked_frame(0x1, b"request_rate"))
        .expect("send command");

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    let doc: serde_json::Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(doc["type"], "request_rate");
    assert_eq!(doc["data"].as_array().map(Vec::len), Some(60));
}

#[test]
fn ping_gets_pong_with_payload() {
    let server = TestServer::start("ping");
    let (mut stream, _head) = upgrade(&server, "/ws");

    stream
        .write_all(&masked_frame(0x9, b"heartbeat"))
        .expect("send ping");

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, 0xA, "pong expected");
    assert_eq!(payload, b"heartbeat");
}

#[test]
fn close_frame_ends_the_session() {
    let server = TestServer::start("close");
    let (mut stream, _head) = upgrade(&server, "/ws");

    stream
        .write_all(&masked_frame(0x8, &[]))
        .expect("send close");

    // The server tears the connection down; reads drain to EOF.
    let mut chunk = [0u8; 64];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[test]
fn upgrade_headers_on_other_paths_are_served_normally() {
    let server = TestServer::start("wrongpath");
    let mut stream = server.connect();
    let request = format!(
        "GET /not-ws HTTP/1.1\r\n\
         Host: localhost\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).expect("send");

    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).expect("read response");
        assert!(n > 0);
        data.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&data);
    // No upgrade: the path is routed like any other request (404 here).
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn missing_upgrade_headers_on_ws_path_is_not_switched() {
    let server = TestServer::start("noheaders");
    let mut stream = server.connect();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .expect("send");

    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).expect("read response");
        assert!(n > 0);
        data.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
}
