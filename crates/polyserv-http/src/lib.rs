//! polyserv-http — protocol engines and the connection dispatcher for the
//! polyserv web server.
//!
//! Layers, bottom up:
//!
//! - [`net`] — readiness waits and the plain/TLS transport wrapper
//! - [`request`] / [`response`] — the HTTP/1.1 codec
//! - [`http2`] — frames, HPACK, and the session engine
//! - [`websocket`] — RFC 6455 handshake, frame codec, registry, loops
//! - [`tls`] — rustls acceptor with ALPN
//! - [`routes`] — static files, REST endpoints, dashboard
//! - [`server`] — the dispatcher binding it all together

pub mod http2;
pub mod net;
pub mod request;
pub mod response;
pub mod routes;
pub mod server;
pub mod tls;
pub mod websocket;

pub use request::{url_decode, url_encode, Request};
pub use response::ResponseWriter;
pub use routes::Router;
pub use server::{Server, ServerError};
pub use tls::{NegotiatedProtocol, TlsAcceptor};
pub use websocket::WebSocketHandler;
