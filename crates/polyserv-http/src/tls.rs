//! TLS termination with ALPN protocol selection.
//!
//! Certificate and key are loaded once at startup; the rustls config
//! builder rejects a key that does not match the certificate. The ALPN list
//! prefers `h2` when HTTP/2 is enabled and always carries `http/1.1`.
//! Selection follows server preference: a client offering both gets `h2`;
//! a client offering neither fails the handshake; a client sending no ALPN
//! extension at all falls back to HTTP/1.1.
//!
//! After the handshake the session is wrapped into a [`Transport`] so the
//! HTTP/1.1 and HTTP/2 paths read and write through TLS transparently.

use crate::net::Transport;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

/// Application protocol negotiated via ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    H2,
    Http11,
}

#[derive(Debug)]
pub enum TlsError {
    Io(io::Error),
    /// Certificate or key file did not contain usable PEM material.
    InvalidPem(&'static str),
    Rustls(rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "TLS I/O error: {e}"),
            Self::InvalidPem(what) => write!(f, "invalid PEM material: {what}"),
            Self::Rustls(e) => write!(f, "TLS error: {e}"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Rustls(e) => Some(e),
            Self::InvalidPem(_) => None,
        }
    }
}

impl From<io::Error> for TlsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        Self::Rustls(e)
    }
}

/// Accepts TLS connections and reports the ALPN outcome.
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    /// Load certificate + key and build the server config.
    pub fn new(
        cert_path: &Path,
        key_path: &Path,
        http2_enabled: bool,
    ) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        // with_single_cert verifies the key is usable with the certificate.
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        config.alpn_protocols = if http2_enabled {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Run the handshake on an accepted socket.
    ///
    /// Blocks within the socket's configured read/write timeouts. A client
    /// that offers ALPN without any supported protocol fails here.
    pub fn accept(
        &self,
        mut stream: TcpStream,
    ) -> Result<(Transport, NegotiatedProtocol), TlsError> {
        let mut conn = ServerConnection::new(Arc::clone(&self.config))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }

        let protocol = match conn.alpn_protocol() {
            Some(b"h2") => NegotiatedProtocol::H2,
            // `http/1.1`, or no ALPN extension sent at all.
            _ => NegotiatedProtocol::Http11,
        };

        Ok((
            Transport::Tls(Box::new(StreamOwned::new(conn, stream))),
            protocol,
        ))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(TlsError::Io)?;
    if certs.is_empty() {
        return Err(TlsError::InvalidPem("no certificates found"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(TlsError::Io)?
        .ok_or(TlsError::InvalidPem("no private key found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "polyserv-tls-test-{}-{name}",
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("write temp file");
        path
    }

    #[test]
    fn missing_cert_file_is_io_error() {
        let result = TlsAcceptor::new(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            true,
        );
        assert!(matches!(result, Err(TlsError::Io(_))));
    }

    #[test]
    fn empty_cert_file_is_invalid_pem() {
        let cert = temp_file("empty-cert.pem", b"");
        let key = temp_file("empty-key.pem", b"");
        let result = TlsAcceptor::new(&cert, &key, true);
        assert!(matches!(result, Err(TlsError::InvalidPem(_))));
    }

    #[test]
    fn garbage_cert_file_is_rejected() {
        let cert = temp_file("garbage-cert.pem", b"not a pem at all");
        let key = temp_file("garbage-key.pem", b"junk");
        let result = TlsAcceptor::new(&cert, &key, true);
        assert!(result.is_err());
    }

    #[test]
    fn error_messages_are_descriptive() {
        assert!(TlsError::InvalidPem("no certificates found")
            .to_string()
            .contains("no certificates"));
    }
}
