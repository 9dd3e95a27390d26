//! Socket readiness and the plain/TLS transport wrapper.
//!
//! Every long-lived read loop in the server observes shutdown by waiting for
//! readability with a bounded timeout instead of blocking indefinitely in
//! `read`. For plain sockets that wait is `poll(2)` on the raw fd; for TLS
//! the session's buffered plaintext has to be drained first, since bytes can
//! be pending inside the session without the socket being readable.

use rustls::{ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Level-triggered readability wait with timeout.
///
/// Returns `Ok(true)` when the fd is readable (or has hung up, in which
/// case the subsequent read reports EOF), `Ok(false)` on timeout or signal
/// interruption so the caller can re-check the shutdown flag.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
    Ok(rc > 0 && (pollfd.revents & ready) != 0)
}

/// A connection's byte stream: plain TCP or TLS-wrapped TCP.
///
/// The TLS variant owns the rustls session; it is never shared between
/// threads.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Transport {
    /// The underlying TCP socket (for timeouts, peer address, shutdown).
    #[must_use]
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => &stream.sock,
        }
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Bounded readability wait that accounts for TLS-buffered plaintext.
    pub fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if let Self::Tls(stream) = self {
            // Plaintext already decrypted inside the session counts as
            // readable even when the socket itself is idle.
            match stream.conn.process_new_packets() {
                Ok(state) if state.plaintext_bytes_to_read() > 0 => return Ok(true),
                // Session errors surface on the next read.
                Err(_) => return Ok(true),
                Ok(_) => {}
            }
        }
        wait_readable(self.raw_fd(), timeout)
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// Write the whole buffer, treating a zero-length write as an error.
pub fn write_all(writer: &mut impl Write, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = writer.write(buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data"));
        }
        buf = &buf[n..];
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn idle_socket_times_out() {
        let (_client, server) = socket_pair();
        let ready = wait_readable(server.as_raw_fd(), Duration::from_millis(30)).expect("poll");
        assert!(!ready);
    }

    #[test]
    fn pending_bytes_report_readable() {
        let (mut client, server) = socket_pair();
        client.write_all(b"x").expect("write");

        let ready = wait_readable(server.as_raw_fd(), Duration::from_secs(5)).expect("poll");
        assert!(ready);
    }

    #[test]
    fn closed_peer_reports_readable() {
        let (client, server) = socket_pair();
        drop(client);

        let ready = wait_readable(server.as_raw_fd(), Duration::from_secs(5)).expect("poll");
        assert!(ready);

        let mut buf = [0u8; 8];
        assert_eq!((&server).read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn transport_plain_round_trip() {
        let (mut client, server) = socket_pair();
        let mut transport = Transport::Plain(server);

        client.write_all(b"ping").expect("write");
        assert!(transport
            .wait_readable(Duration::from_secs(5))
            .expect("wait"));

        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"ping");

        write_all(&mut transport, b"pong").expect("write");
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).expect("read reply");
        assert_eq!(&reply, b"pong");
    }
}
