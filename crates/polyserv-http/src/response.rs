//! HTTP/1.1 response serialization.
//!
//! One [`ResponseWriter`] per server instance carries the keep-alive policy;
//! `build` produces complete response bytes with the standard header set
//! (`Server`, `Content-Type`, `Content-Length`, `Connection`, `Date`,
//! optionally CORS). Error responses use small HTML bodies for browsers.

const SERVER_TOKEN: &str = "polyserv/0.1";

/// Serializes responses under a fixed keep-alive policy.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    keep_alive_enabled: bool,
    keep_alive_timeout_secs: u64,
}

impl ResponseWriter {
    #[must_use]
    pub fn new(keep_alive_enabled: bool, keep_alive_timeout_secs: u64) -> Self {
        Self {
            keep_alive_enabled,
            keep_alive_timeout_secs,
        }
    }

    /// Build a complete response.
    ///
    /// `keep_alive` expresses the per-request decision; the `Connection`
    /// header also honors the writer's global policy.
    #[must_use]
    pub fn build(
        &self,
        status: u16,
        content_type: &str,
        body: &[u8],
        keep_alive: bool,
        cors: bool,
    ) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        head.push_str(&format!(
            "HTTP/1.1 {status} {}\r\n",
            reason_phrase(status)
        ));
        head.push_str(&format!("Server: {SERVER_TOKEN}\r\n"));
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));

        if keep_alive && self.keep_alive_enabled {
            head.push_str("Connection: keep-alive\r\n");
            head.push_str(&format!(
                "Keep-Alive: timeout={}\r\n",
                self.keep_alive_timeout_secs
            ));
        } else {
            head.push_str("Connection: close\r\n");
        }

        if cors {
            head.push_str("Access-Control-Allow-Origin: *\r\n");
            head.push_str("Access-Control-Allow-Credentials: true\r\n");
        }

        head.push_str(&format!("Date: {}\r\n", http_date()));
        head.push_str("\r\n");

        let mut response = head.into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// Empty 200 with the CORS preflight header set.
    #[must_use]
    pub fn preflight(&self) -> Vec<u8> {
        let mut head = String::with_capacity(320);
        head.push_str("HTTP/1.1 200 OK\r\n");
        head.push_str(&format!("Server: {SERVER_TOKEN}\r\n"));
        head.push_str("Content-Type: text/plain\r\n");
        head.push_str("Content-Length: 0\r\n");
        head.push_str("Connection: close\r\n");
        head.push_str("Access-Control-Allow-Methods: GET, POST, PUT, DELETE, OPTIONS\r\n");
        head.push_str(
            "Access-Control-Allow-Headers: Content-Type, Authorization, X-Requested-With\r\n",
        );
        head.push_str("Access-Control-Max-Age: 86400\r\n");
        head.push_str("Access-Control-Allow-Origin: *\r\n");
        head.push_str("Access-Control-Allow-Credentials: true\r\n");
        head.push_str(&format!("Date: {}\r\n", http_date()));
        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Styled HTML error body.
    #[must_use]
    pub fn html_error(&self, status: u16, message: &str) -> Vec<u8> {
        let reason = reason_phrase(status);
        let body = format!(
            "<!DOCTYPE html>\n\
             <html><head><title>{status} {reason}</title></head>\n\
             <body style='font-family: Arial, sans-serif; text-align: center; margin-top: 50px;'>\n\
             <h1>{status} {reason}</h1>\n\
             <p>{message}</p>\n\
             <hr><small>{SERVER_TOKEN}</small>\n\
             </body></html>"
        );
        self.build(status, "text/html", body.as_bytes(), false, false)
    }

    #[must_use]
    pub fn bad_request(&self) -> Vec<u8> {
        self.html_error(400, "The request could not be understood by the server.")
    }

    #[must_use]
    pub fn not_found(&self) -> Vec<u8> {
        self.html_error(404, "The requested file was not found on this server.")
    }

    #[must_use]
    pub fn method_not_allowed(&self) -> Vec<u8> {
        self.html_error(405, "The requested method is not allowed for this resource.")
    }

    #[must_use]
    pub fn internal_error(&self) -> Vec<u8> {
        self.html_error(500, "The server encountered an unexpected condition.")
    }
}

/// Reduce a full response to its HEAD form: headers plus the terminating
/// blank line, body dropped.
#[must_use]
pub fn truncate_for_head(response: &[u8]) -> Vec<u8> {
    match response.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) => response[..end + 4].to_vec(),
        None => response.to_vec(),
    }
}

/// Standard reason phrase for the statuses this server emits.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        101 => "Switching Protocols",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

/// RFC 1123 date, always GMT.
#[must_use]
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
