//! The socket layer of a DCB: a plain TCP stream or one wrapped in TLS.
//! All I/O is non-blocking; TLS distinguishes which direction it is
//! waiting on so the DCB can re-arm the right readiness bit.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{FromRawFd, RawFd};

use openssl::ssl::{
    ErrorCode, SslAcceptor, SslContext, SslFiletype, SslMethod, SslStream,
};

use common::err::proxy_error::ProxyError;
use common::err::PResult;

/// Build the server-side TLS context of a listener from PEM files.
pub fn server_ssl_context(cert_path: &str, key_path: &str) -> PResult<SslContext> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|e| ProxyError::ConnectionError(format!("TLS setup failed: {}", e)))?;

    builder
        .set_private_key_file(key_path, SslFiletype::PEM)
        .map_err(|e| ProxyError::ConnectionError(format!("cannot load key {}: {}", key_path, e)))?;
    builder.set_certificate_chain_file(cert_path).map_err(|e| {
        ProxyError::ConnectionError(format!("cannot load certificate {}: {}", cert_path, e))
    })?;

    Ok(builder.build().into_context())
}

/// Outcome of one non-blocking read or write attempt.
#[derive(Debug)]
pub enum IoOutcome {
    /// Bytes transferred.
    Done(usize),
    /// The operation would block; the flags say which readiness it needs.
    WouldBlock { want_read: bool, want_write: bool },
    /// Orderly close by the peer.
    Closed,
    Error(ProxyError),
}

#[derive(Debug)]
pub enum DcbStream {
    Plain(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
}

impl DcbStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, DcbStream::Tls(_))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        match self {
            DcbStream::Plain(stream) => match stream.read(buf) {
                Ok(0) => IoOutcome::Closed,
                Ok(n) => IoOutcome::Done(n),
                Err(err) => map_io_error(err, true),
            },
            DcbStream::Tls(stream) => match stream.ssl_read(buf) {
                Ok(0) => IoOutcome::Closed,
                Ok(n) => IoOutcome::Done(n),
                Err(err) => map_ssl_error(err),
            },
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> IoOutcome {
        match self {
            DcbStream::Plain(stream) => match stream.write(buf) {
                Ok(n) => IoOutcome::Done(n),
                Err(err) => map_io_error(err, false),
            },
            DcbStream::Tls(stream) => match stream.ssl_write(buf) {
                Ok(n) => IoOutcome::Done(n),
                Err(err) => map_ssl_error(err),
            },
        }
    }
}

fn map_io_error(err: io::Error, reading: bool) -> IoOutcome {
    match err.kind() {
        io::ErrorKind::WouldBlock => IoOutcome::WouldBlock {
            want_read: reading,
            want_write: !reading,
        },
        io::ErrorKind::Interrupted => IoOutcome::WouldBlock {
            want_read: reading,
            want_write: !reading,
        },
        _ => IoOutcome::Error(ProxyError::IoError(err)),
    }
}

fn map_ssl_error(err: openssl::ssl::Error) -> IoOutcome {
    match err.code() {
        ErrorCode::WANT_READ => IoOutcome::WouldBlock {
            want_read: true,
            want_write: false,
        },
        ErrorCode::WANT_WRITE => IoOutcome::WouldBlock {
            want_read: false,
            want_write: true,
        },
        ErrorCode::ZERO_RETURN => IoOutcome::Closed,
        _ => IoOutcome::Error(ProxyError::ConnectionError(format!(
            "TLS I/O failed: {}",
            err
        ))),
    }
}

/// Start a non-blocking TCP connect. The socket is created non-blocking;
/// completion (or failure) surfaces as the first EPOLLOUT on the DCB.
pub fn nonblocking_connect(addr: SocketAddr) -> PResult<TcpStream> {
    let (domain, sockaddr, len) = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (
                libc::AF_INET,
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (
                libc::AF_INET6,
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    };

    let fd: RawFd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd == -1 {
        return Err(ProxyError::IoError(io::Error::last_os_error()));
    }

    let rc = unsafe {
        libc::connect(
            fd,
            &sockaddr as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };

    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe {
                libc::close(fd);
            }
            return Err(ProxyError::ConnectionError(format!(
                "connect to {} failed: {}",
                addr, err
            )));
        }
    }

    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn plain_stream_reports_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let _server = listener.accept().unwrap();

        let mut stream = DcbStream::Plain(client);
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            IoOutcome::WouldBlock { want_read, .. } => assert!(want_read),
            other => panic!("expected WouldBlock, got {:?}", other),
        }
    }

    #[test]
    fn nonblocking_connect_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = nonblocking_connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        // Once accepted, the socket is writable end-to-end.
        let mut dcb_stream = DcbStream::Plain(stream);
        loop {
            match dcb_stream.write(b"ping") {
                IoOutcome::Done(4) => break,
                IoOutcome::WouldBlock { .. } => std::thread::yield_now(),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
