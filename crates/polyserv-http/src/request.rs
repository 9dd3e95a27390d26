//! HTTP/1.1 request parsing.
//!
//! The parser is strict where the wire format is strict: the request line
//! must carry method, target and version (path starting with `/`), and every
//! header line must contain a colon with a non-empty name. Header keys are
//! lowercased for case-insensitive lookup; the query string is split off the
//! path and URL-decoded into a map.

use std::collections::HashMap;
use std::fmt;

/// Why a request failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// No bytes at all.
    Empty,
    /// Request line is not `METHOD SP TARGET SP VERSION`.
    InvalidRequestLine,
    /// Request target does not start with `/`.
    InvalidPath,
    /// Header line without a colon, or with an empty name.
    MalformedHeader,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidPath => write!(f, "request path must start with '/'"),
            Self::MalformedHeader => write!(f, "malformed header line"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A parsed HTTP/1.1 request.
///
/// A value of this type only exists for well-formed requests; `parse`
/// returning `Ok` is the validity invariant.
#[derive(Debug, Clone)]
pub struct Request {
    /// Uppercased method.
    pub method: String,
    /// Path without the query string; always starts with `/`.
    pub path: String,
    /// Version token as sent, e.g. `HTTP/1.1`.
    pub version: String,
    /// Header map; keys lowercased.
    pub headers: HashMap<String, String>,
    /// URL-decoded query parameters.
    pub query: HashMap<String, String>,
    /// Raw body bytes (everything after the blank line).
    pub body: Vec<u8>,
}

impl Request {
    /// Parse a complete request (head plus any buffered body bytes).
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }

        // Head and body split at the first blank line.
        let (head, body) = match find_header_end(raw) {
            Some(end) => (&raw[..end], raw[end + 4..].to_vec()),
            None => (raw, Vec::new()),
        };
        let head = String::from_utf8_lossy(head);

        let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));

        let request_line = lines.next().ok_or(ParseError::Empty)?;
        let (method, target, version) = parse_request_line(request_line)?;

        let (path, query) = match target.split_once('?') {
            Some((path, query_string)) => (path.to_string(), parse_query_string(query_string)),
            None => (target.to_string(), HashMap::new()),
        };
        if !path.starts_with('/') {
            return Err(ParseError::InvalidPath);
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = parse_header_line(line)?;
            headers.insert(name, value);
        }

        Ok(Self {
            method,
            path,
            version,
            headers,
            query,
            body,
        })
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn has_json_content_type(&self) -> bool {
        self.header("content-type")
            .map(|v| v.to_ascii_lowercase().contains("application/json"))
            .unwrap_or(false)
    }

    /// Declared body length, when present and numeric.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    #[must_use]
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Byte offset of the `\r\n\r\n` separating head from body.
#[must_use]
pub fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(line: &str) -> Result<(String, String, String), ParseError> {
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;

    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError::InvalidRequestLine);
    }

    Ok((
        method.to_ascii_uppercase(),
        target.to_string(),
        version.to_string(),
    ))
}

fn parse_header_line(line: &str) -> Result<(String, String), ParseError> {
    let (name, value) = line.split_once(':').ok_or(ParseError::MalformedHeader)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ParseError::MalformedHeader);
    }
    Ok((name.to_ascii_lowercase(), value.trim().to_string()))
}

/// Decode `%XX` escapes and `+` (as space).
///
/// Malformed escapes are kept literally rather than rejected.
#[must_use]
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push((hi << 4) | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encode everything outside the unreserved set. Space becomes `%20`
/// so `url_decode(url_encode(s)) == s` for every `s`.
#[must_use]
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0').to_ascii_uppercase());
                out.push(char::from_digit(u32::from(byte & 0xF), 16).unwrap_or('0').to_ascii_uppercase());
            }
        }
    }
    out
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Split a raw query string into a URL-decoded key/value map.
#[must_use]
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                params.insert(url_decode(key), url_decode(value));
            }
            None => {
                params.insert(url_decode(pair), String::new());
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_minimal_get() {
        let request =
            Request::parse(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").expect("parse");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("localhost"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn method_is_uppercased() {
        let request = Request::parse(b"get /x HTTP/1.1\r\n\r\n").expect("parse");
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn header_keys_are_lowercased() {
        let request =
            Request::parse(b"GET / HTTP/1.1\r\nX-Custom-Header: Value\r\n\r\n").expect("parse");
        assert_eq!(request.headers.get("x-custom-header").map(String::as_str), Some("Value"));
        assert_eq!(request.header("X-CUSTOM-HEADER"), Some("Value"));
    }

    #[test]
    fn query_string_is_split_and_decoded() {
        let request =
            Request::parse(b"GET /search?q=hello+world&lang=en%2DUS HTTP/1.1\r\n\r\n")
                .expect("parse");
        assert_eq!(request.path, "/search");
        assert_eq!(request.query.get("q").map(String::as_str), Some("hello world"));
        assert_eq!(request.query.get("lang").map(String::as_str), Some("en-US"));
    }

    #[test]
    fn body_follows_blank_line() {
        let request =
            Request::parse(b"POST /api HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd").expect("parse");
        assert_eq!(request.body, b"abcd");
        assert_eq!(request.content_length(), Some(4));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(Request::parse(b""), Err(ParseError::Empty)));
    }

    #[test]
    fn rejects_garbage_request_line() {
        assert!(matches!(
            Request::parse(b"INVALID\r\n\r\n"),
            Err(ParseError::InvalidRequestLine)
        ));
    }

    #[test]
    fn rejects_relative_path() {
        assert!(matches!(
            Request::parse(b"GET nothing HTTP/1.1\r\n\r\n"),
            Err(ParseError::InvalidPath)
        ));
    }

    #[test]
    fn rejects_header_without_colon() {
        assert!(matches!(
            Request::parse(b"GET / HTTP/1.1\r\nBadHeader\r\n\r\n"),
            Err(ParseError::MalformedHeader)
        ));
    }

    #[test]
    fn rejects_header_with_empty_name() {
        assert!(matches!(
            Request::parse(b"GET / HTTP/1.1\r\n: value\r\n\r\n"),
            Err(ParseError::MalformedHeader)
        ));
        assert!(matches!(
            Request::parse(b"GET / HTTP/1.1\r\n  : value\r\n\r\n"),
            Err(ParseError::MalformedHeader)
        ));
    }

    #[test]
    fn json_content_type_detection() {
        let request = Request::parse(
            b"POST /api HTTP/1.1\r\nContent-Type: application/json; charset=utf-8\r\n\r\n{}",
        )
        .expect("parse");
        assert!(request.has_json_content_type());

        let request =
            Request::parse(b"POST /api HTTP/1.1\r\nContent-Type: text/plain\r\n\r\nx").expect("parse");
        assert!(!request.has_json_content_type());
    }

    #[test]
    fn decode_plus_and_percent() {
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("a%20b"), "a b");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
        assert_eq!(url_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn encode_decode_examples() {
        assert_eq!(url_encode("a b"), "a%20b");
        assert_eq!(url_encode("safe-chars_.~"), "safe-chars_.~");
        assert_eq!(url_decode(&url_encode("50% off & more")), "50% off & more");
    }

    #[test]
    fn query_without_value_maps_to_empty_string() {
        let params = parse_query_string("flag&x=1");
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
        assert_eq!(params.get("x").map(String::as_str), Some("1"));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(s in ".*") {
            prop_assert_eq!(url_decode(&url_encode(&s)), s);
        }

        #[test]
        fn decode_without_escapes_is_identity(s in "[a-zA-Z0-9/_.-]*") {
            prop_assert_eq!(url_decode(&s), s);
        }
    }
}
