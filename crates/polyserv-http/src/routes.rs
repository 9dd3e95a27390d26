//! Request routing for the HTTP/1.1 surface: static files, the REST demo
//! endpoints, the dashboard, and CORS preflight.
//!
//! API responses use a JSON envelope: `{"success":true,"message":..,
//! "data":..}` on success, `{"success":false,"error":..,"code":..}` on
//! failure. HTML error pages are reserved for the non-API surface.

use crate::request::Request;
use crate::response::{truncate_for_head, ResponseWriter};
use crate::websocket::WebSocketHandler;
use polyserv_core::static_files::mime_type;
use polyserv_core::{FileReader, KeepAliveTracker, UserStore, WorkerPool};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A fully serialized response plus the connection decision that goes with it.
pub struct Routed {
    pub bytes: Vec<u8>,
    pub keep_alive: bool,
    pub status: u16,
}

impl Routed {
    fn new(bytes: Vec<u8>, keep_alive: bool, status: u16) -> Self {
        Self {
            bytes,
            keep_alive,
            status,
        }
    }
}

/// Routes parsed HTTP/1.1 requests to their handlers.
pub struct Router {
    files: Arc<FileReader>,
    users: Arc<UserStore>,
    writer: ResponseWriter,
    pool: Arc<WorkerPool>,
    keepalive: KeepAliveTracker,
    websockets: WebSocketHandler,
    total_requests: Arc<AtomicU64>,
}

impl Router {
    #[must_use]
    pub fn new(
        files: Arc<FileReader>,
        users: Arc<UserStore>,
        writer: ResponseWriter,
        pool: Arc<WorkerPool>,
        keepalive: KeepAliveTracker,
        websockets: WebSocketHandler,
        total_requests: Arc<AtomicU64>,
    ) -> Self {
        Self {
            files,
            users,
            writer,
            pool,
            keepalive,
            websockets,
            total_requests,
        }
    }

    /// Serve one request. `keep_alive` carries the connection-level
    /// decision; error responses always close.
    #[must_use]
    pub fn handle(&self, request: &Request, keep_alive: bool) -> Routed {
        match request.method.as_str() {
            "GET" => self.handle_get(request, keep_alive),
            "POST" => self.handle_post(request),
            "OPTIONS" => Routed::new(self.writer.preflight(), false, 200),
            "HEAD" => {
                let full = self.handle_get(request, keep_alive);
                Routed::new(truncate_for_head(&full.bytes), full.keep_alive, full.status)
            }
            _ => Routed::new(self.writer.method_not_allowed(), false, 405),
        }
    }

    fn handle_get(&self, request: &Request, keep_alive: bool) -> Routed {
        if request.path == "/dashboard" || request.path == "/dashboard.html" {
            return self.dashboard();
        }
        if is_api_path(&request.path) {
            return self.handle_api(request);
        }
        self.static_file(&request.path, keep_alive)
    }

    fn handle_post(&self, request: &Request) -> Routed {
        if is_api_path(&request.path) {
            return self.handle_api(request);
        }
        Routed::new(self.writer.method_not_allowed(), false, 405)
    }

    fn static_file(&self, path: &str, keep_alive: bool) -> Routed {
        if !self.files.file_exists(path) {
            return Routed::new(self.writer.not_found(), false, 404);
        }
        match self.files.read_file(path) {
            Ok(content) => {
                let mime_path = if path == "/" { "/index.html" } else { path };
                let bytes =
                    self.writer
                        .build(200, mime_type(mime_path), &content, keep_alive, false);
                Routed::new(bytes, keep_alive, 200)
            }
            Err(_) => Routed::new(self.writer.internal_error(), false, 500),
        }
    }

    fn dashboard(&self) -> Routed {
        let body = if self.files.file_exists("/dashboard.html") {
            match self.files.read_file("/dashboard.html") {
                Ok(content) => content,
                Err(_) => return Routed::new(self.writer.internal_error(), false, 500),
            }
        } else {
            FALLBACK_DASHBOARD.as_bytes().to_vec()
        };
        let bytes = self.writer.build(200, "text/html", &body, false, true);
        Routed::new(bytes, false, 200)
    }

    fn handle_api(&self, request: &Request) -> Routed {
        let segments: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();

        // segments[0] is "api".
        match segments.get(1).copied() {
            Some("docs") => self.api_docs(),
            Some("stats") => self.api_stats(request),
            Some("users") => match segments.len() {
                2 => self.api_users(request),
                3 => self.api_user_by_id(request, segments[2]),
                _ => self.json_error(404, "API endpoint not found"),
            },
            _ => self.json_error(404, "API endpoint not found"),
        }
    }

    fn api_docs(&self) -> Routed {
        let bytes = self
            .writer
            .build(200, "text/html", API_DOCS_HTML.as_bytes(), true, true);
        Routed::new(bytes, true, 200)
    }

    fn api_stats(&self, request: &Request) -> Routed {
        if request.method != "GET" {
            return self.json_error(405, "Method not allowed");
        }

        let active_connections =
            self.keepalive.connection_count() + self.websockets.connection_count();
        let body = success_json(
            "Server statistics",
            json!({
                "total_requests": self.total_requests.load(Ordering::Relaxed),
                "active_connections": active_connections,
                "thread_count": self.pool.thread_count(),
                "queue_size": self.pool.queue_size(),
            }),
        );
        self.json_response(200, &body, true)
    }

    fn api_users(&self, request: &Request) -> Routed {
        match request.method.as_str() {
            "GET" => {
                let body = success_json("User list", json!(self.users.list()));
                self.json_response(200, &body, true)
            }
            "POST" => self.api_create_user(request),
            _ => self.json_error(405, "Method not allowed"),
        }
    }

    fn api_create_user(&self, request: &Request) -> Routed {
        if !request.has_json_content_type() {
            return self.json_error(400, "Content-Type must be application/json");
        }

        let Ok(document) = serde_json::from_slice::<serde_json::Value>(&request.body) else {
            return self.json_error(400, "Invalid JSON data");
        };
        if !document.is_object() {
            return self.json_error(400, "Invalid JSON data");
        }

        let name = document["name"].as_str().unwrap_or("").trim();
        let email = document["email"].as_str().unwrap_or("").trim();
        if name.is_empty() || email.is_empty() {
            return self.json_error(400, "Name and email are required");
        }

        let user = self.users.create(name, email);
        let body = success_json("User created successfully", json!(user));
        self.json_response(201, &body, false)
    }

    fn api_user_by_id(&self, request: &Request, raw_id: &str) -> Routed {
        if request.method != "GET" {
            return self.json_error(405, "Method not allowed");
        }

        let user = raw_id.parse::<u64>().ok().and_then(|id| self.users.find(id));
        match user {
            Some(user) => {
                let body = success_json("User found", json!(user));
                self.json_response(200, &body, true)
            }
            None => self.json_error(404, "User not found"),
        }
    }

    fn json_response(&self, status: u16, body: &str, keep_alive: bool) -> Routed {
        let bytes = self
            .writer
            .build(status, "application/json", body.as_bytes(), keep_alive, true);
        Routed::new(bytes, keep_alive, status)
    }

    fn json_error(&self, status: u16, message: &str) -> Routed {
        let body = error_json(message, status);
        let bytes = self
            .writer
            .build(status, "application/json", body.as_bytes(), false, true);
        Routed::new(bytes, false, status)
    }
}

fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

fn success_json(message: &str, data: serde_json::Value) -> String {
    json!({
        "success": true,
        "message": message,
        "data": data,
    })
    .to_string()
}

fn error_json(message: &str, code: u16) -> String {
    json!({
        "success": false,
        "error": message,
        "code": code,
    })
    .to_string()
}

const API_DOCS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>polyserv API Documentation</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; line-height: 1.6; }
        .endpoint { background: #f5f5f5; padding: 15px; margin: 10px 0; border-radius: 5px; }
        .method { font-weight: bold; color: #2196F3; }
        .method.post { color: #4CAF50; }
        .url { font-family: monospace; background: #e8e8e8; padding: 5px; }
    </style>
</head>
<body>
    <h1>polyserv API Documentation</h1>
    <p>REST endpoints served by this instance.</p>

    <h2>Server Statistics</h2>
    <div class="endpoint">
        <span class="method">GET</span> <span class="url">/api/stats</span>
        <p>Real-time server statistics: request totals, connections, worker pool.</p>
    </div>

    <h2>User Management</h2>
    <div class="endpoint">
        <span class="method">GET</span> <span class="url">/api/users</span>
        <p>List all users.</p>
    </div>
    <div class="endpoint">
        <span class="method post">POST</span> <span class="url">/api/users</span>
        <p>Create a user. JSON body with <code>name</code> and <code>email</code>.</p>
    </div>
    <div class="endpoint">
        <span class="method">GET</span> <span class="url">/api/users/{id}</span>
        <p>Fetch one user by id.</p>
    </div>

    <p><a href="/">Home</a> | <a href="/dashboard">Dashboard</a></p>
</body>
</html>
"#;

const FALLBACK_DASHBOARD: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Performance Dashboard</title>
    <style>body { font-family: Arial, sans-serif; margin: 40px; }</style>
</head>
<body>
    <h1>Performance Dashboard</h1>
    <p>Dashboard HTML file not found. Place dashboard.html in the document root.</p>
    <p><a href="/">Home</a> | <a href="/api/docs">API Docs</a></p>
</body>
</html>
"#;
