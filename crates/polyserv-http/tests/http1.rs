//! End-to-end HTTP/1.1 tests against a running server on an ephemeral port.

use polyserv_core::{Logger, ServerConfig, ShutdownCoordinator};
use polyserv_http::Server;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    root: PathBuf,
    run_thread: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(tag: &str, configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let root = std::env::temp_dir().join(format!(
            "polyserv-http1-test-{}-{tag}",
            std::process::id()
        ));
        std::fs::create_dir_all(&root).expect("create docroot");

        let config = configure(
            ServerConfig::new()
                .with_port(0)
                .with_document_root(&root)
                .with_worker_threads(2),
        );
        let server = Arc::new(
            Server::bind(config, ShutdownCoordinator::new(), Logger::disabled())
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
            root,
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

/// Read one response: status line + headers + Content-Length bytes of body.
fn read_response(stream: &mut TcpStream) -> (u16, String, Vec<u8>) {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break end + 4;
        }
        let n = stream.read(&mut chunk).expect("read response head");
        assert!(n > 0, "connection closed before response head completed");
        data.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");

    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);

    let mut body = data[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).expect("read response body");
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    (status, head, body)
}

fn read_until_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    data
}

#[test]
fn get_root_serves_index_html() {
    let server = TestServer::start("index", |c| c);
    std::fs::write(server.root.join("index.html"), b"<html>welcome</html>").expect("write");

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .expect("send request");

    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert!(head.contains("Content-Type: text/html"));
    assert!(head.contains("Server: polyserv/"));
    assert_eq!(body, b"<html>welcome</html>");
}

#[test]
fn malformed_request_gets_400_and_close() {
    let server = TestServer::start("bad", |c| c);

    let mut stream = server.connect();
    stream.write_all(b"INVALID\r\n\r\n").expect("send");

    let (status, head, _body) = read_response(&mut stream);
    assert_eq!(status, 400);
    assert!(head.contains("Content-Type: text/html"));
    assert!(head.contains("Connection: close"));

    // Server closes after the error response.
    assert!(read_until_eof(&mut stream).is_empty());
}

#[test]
fn post_to_non_api_path_is_405() {
    let server = TestServer::start("post405", |c| c);

    let mut stream = server.connect();
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .expect("send");

    let (status, _head, _body) = read_response(&mut stream);
    assert_eq!(status, 405);
}

#[test]
fn missing_file_is_404() {
    let server = TestServer::start("404", |c| c);

    let mut stream = server.connect();
    stream
        .write_all(b"GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send");

    let (status, _head, body) = read_response(&mut stream);
    assert_eq!(status, 404);
    assert!(String::from_utf8_lossy(&body).contains("404 Not Found"));
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    let server = TestServer::start("keepalive", |c| c);
    std::fs::write(server.root.join("index.html"), b"first").expect("write");
    std::fs::write(server.root.join("about.html"), b"second").expect("write");

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .expect("send first");
    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert!(head.contains("Connection: keep-alive"));
    assert!(head.contains("Keep-Alive: timeout=5"));
    assert_eq!(body, b"first");

    stream
        .write_all(b"GET /about.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send second");
    let (status, _head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"second");
}

#[test]
fn connection_close_header_is_honored() {
    let server = TestServer::start("close", |c| c);
    std::fs::write(server.root.join("index.html"), b"bye").expect("write");

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .expect("send");

    let (status, head, _body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert!(head.contains("Connection: close"));
    assert!(read_until_eof(&mut stream).is_empty());
}

#[test]
fn keep_alive_disabled_globally_closes_connections() {
    let server = TestServer::start("nokeepalive", |c| {
        c.with_keep_alive(false, Duration::from_secs(5))
    });
    std::fs::write(server.root.join("index.html"), b"x").expect("write");

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send");

    let (_status, head, _body) = read_response(&mut stream);
    assert!(head.contains("Connection: close"));
}

#[test]
fn head_request_carries_headers_but_no_body() {
    let server = TestServer::start("head", |c| c);
    std::fs::write(server.root.join("index.html"), b"0123456789").expect("write");

    let mut stream = server.connect();
    stream
        .write_all(b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .expect("send");

    let data = read_until_eof(&mut stream);
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 10"));
    assert!(text.ends_with("\r\n\r\n"), "HEAD response must stop at the header terminator");
}

#[test]
fn options_preflight_carries_cors_headers() {
    let server = TestServer::start("options", |c| c);

    let mut stream = server.connect();
    stream
        .write_all(b"OPTIONS / HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send");

    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert!(body.is_empty());
    assert!(head.contains("Access-Control-Allow-Methods: GET, POST, PUT, DELETE, OPTIONS"));
    assert!(head.contains("Access-Control-Max-Age: 86400"));
}

#[test]
fn api_stats_returns_success_envelope() {
    let server = TestServer::start("stats", |c| c);

    let mut stream = server.connect();
    stream
        .write_all(b"GET /api/stats HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send");

    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert!(head.contains("Content-Type: application/json"));
    assert!(head.contains("Access-Control-Allow-Origin: *"));

    let doc: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(doc["success"], true);
    assert_eq!(doc["data"]["thread_count"], 2);
    assert!(doc["data"]["total_requests"].as_u64().is_some());
}

#[test]
fn api_users_crud_flow() {
    let server = TestServer::start("users", |c| c);

    // List the seeded users.
    let mut stream = server.connect();
    stream
        .write_all(b"GET /api/users HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send list");
    let (status, _head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    let doc: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(doc["data"].as_array().map(Vec::len), Some(3));

    // Create a user.
    let payload = br#"{"name":"Bob","email":"bob@example.com"}"#;
    let request = format!(
        "POST /api/users HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    let mut stream = server.connect();
    stream.write_all(request.as_bytes()).expect("send head");
    stream.write_all(payload).expect("send body");
    let (status, _head, body) = read_response(&mut stream);
    assert_eq!(status, 201);
    let doc: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(doc["data"]["id"], 4);

    // Fetch it back.
    let mut stream = server.connect();
    stream
        .write_all(b"GET /api/users/4 HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send get");
    let (status, _head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    let doc: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(doc["data"]["email"], "bob@example.com");
}

#[test]
fn query_parameters_do_not_confuse_routing() {
    let server = TestServer::start("query", |c| c);
    std::fs::write(server.root.join("page.html"), b"paged").expect("write");

    let mut stream = server.connect();
    stream
        .write_all(b"GET /page.html?a=1&b=hello+world HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("send");

    let (status, _head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"paged");
}

#[test]
fn shutdown_latency_is_under_two_seconds() {
    let server = Arc::new(
        Server::bind(
            ServerConfig::new()
                .with_port(0)
                .with_document_root(std::env::temp_dir())
                .with_worker_threads(1),
            ShutdownCoordinator::new(),
            Logger::disabled(),
        )
        .expect("bind"),
    );

    let run_thread = {
        let server = Arc::clone(&server);
        std::thread::spawn(move || server.run())
    };
    // Let the accept loop settle into its poll.
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    server.coordinator().request_shutdown();
    run_thread.join().expect("accept loop exits");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "accept loop took {:?} to observe shutdown",
        started.elapsed()
    );
    server.shutdown();
}
