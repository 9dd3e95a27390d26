//! HTTP/2 (RFC 7540) support.
//!
//! Split along the codec/engine seam:
//!
//! - [`frame`] — wire-level frame parsing and serialization
//! - [`hpack`] — header compression (RFC 7541), decoder with Huffman plus a
//!   minimal encoder
//! - [`session`] — the server session engine: stream table, flow control,
//!   server push, priority, and the output buffer the dispatcher flushes
//!
//! The session consumes the two codec modules and never touches the socket
//! itself; the dispatcher owns all I/O.

pub mod frame;
pub mod hpack;
pub mod session;

pub use frame::{Frame, FrameDecoder, FrameHeader, FrameType, PREFACE};
pub use hpack::{HpackDecoder, HpackError};
pub use session::{Http2Session, SessionConfig, StreamPriority};

use std::io;

/// Errors surfaced by the HTTP/2 codec and session.
#[derive(Debug)]
pub enum Http2Error {
    Io(io::Error),
    /// Peer violated the protocol; the session closes.
    Protocol(&'static str),
    Hpack(HpackError),
}

impl std::fmt::Display for Http2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "http2 I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "http2 protocol error: {msg}"),
            Self::Hpack(e) => write!(f, "hpack error: {e}"),
        }
    }
}

impl std::error::Error for Http2Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Hpack(e) => Some(e),
            Self::Protocol(_) => None,
        }
    }
}

impl From<io::Error> for Http2Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<HpackError> for Http2Error {
    fn from(e: HpackError) -> Self {
        Self::Hpack(e)
    }
}
