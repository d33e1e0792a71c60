//! Thin wrapper around one epoll instance. Every worker owns exactly one;
//! all registrations are edge-triggered.

use std::io;
use std::os::fd::RawFd;

use tracing::error;

use common::err::proxy_error::ProxyError;
use common::err::PResult;

/// Readiness bits, re-exported so the rest of the engine does not touch
/// libc directly.
pub mod events {
    pub const IN: u32 = libc::EPOLLIN as u32;
    pub const OUT: u32 = libc::EPOLLOUT as u32;
    pub const ERR: u32 = libc::EPOLLERR as u32;
    pub const HUP: u32 = libc::EPOLLHUP as u32;
    pub const RDHUP: u32 = libc::EPOLLRDHUP as u32;
    pub const ET: u32 = libc::EPOLLET as u32;
}

/// One delivered readiness event. The token is the value registered with
/// [`Poller::add_fd`]; the worker decodes it back to a handler.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: u64,
    pub events: u32,
}

#[derive(Debug)]
pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> PResult<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(ProxyError::IoError(io::Error::last_os_error()));
        }
        Ok(Poller { epoll_fd })
    }

    /// Register a descriptor. Edge-triggering is implied. Returns
    /// Ok(false) for the benign already-registered case.
    pub fn add_fd(&self, fd: RawFd, events: u32, token: u64) -> PResult<bool> {
        let mut ev = libc::epoll_event {
            events: events | events::ET,
            u64: token,
        };

        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc == 0 {
            Ok(true)
        } else {
            self.resolve_poll_error(fd, io::Error::last_os_error(), "add")
        }
    }

    /// Deregister a descriptor. Returns Ok(false) for the benign
    /// not-registered case.
    pub fn remove_fd(&self, fd: RawFd) -> PResult<bool> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };

        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc == 0 {
            Ok(true)
        } else {
            self.resolve_poll_error(fd, io::Error::last_os_error(), "remove")
        }
    }

    /// Wait for up to `max_events` readiness events or `timeout_ms`
    /// milliseconds. An interrupted wait reports zero events.
    pub fn wait(
        &self,
        out: &mut Vec<PollEvent>,
        max_events: usize,
        timeout_ms: i32,
    ) -> PResult<usize> {
        out.clear();

        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)];

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                buf.as_mut_ptr(),
                buf.len() as i32,
                timeout_ms,
            )
        };

        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(ProxyError::IoError(err));
        }

        for ev in &buf[..n as usize] {
            out.push(PollEvent {
                token: ev.u64,
                events: ev.events,
            });
        }

        Ok(n as usize)
    }

    /// Errno policy of the poll registration calls:
    ///
    /// * benign (EEXIST on add, ENOENT on remove): log and continue;
    /// * retryable degradation (ENOSPC): log, report failure, the caller
    ///   typically refuses the new connection;
    /// * anything else, in particular EBADF/EINVAL/ENOMEM/EPERM, means the
    ///   single-owner discipline has already been broken and the
    ///   descriptor table cannot be trusted: abort.
    fn resolve_poll_error(&self, fd: RawFd, err: io::Error, op: &str) -> PResult<bool> {
        match err.raw_os_error() {
            Some(libc::EEXIST) if op == "add" => {
                error!("File descriptor {} already present in the epoll instance.", fd);
                Ok(false)
            }
            Some(libc::ENOENT) if op == "remove" => {
                error!("File descriptor {} was not found in the epoll instance.", fd);
                Ok(false)
            }
            Some(libc::ENOSPC) => {
                error!(
                    "The limit imposed by /proc/sys/fs/epoll/max_user_watches was reached \
                     when trying to add file descriptor {}.",
                    fd
                );
                Err(ProxyError::ResourceExhausted(format!(
                    "epoll watch limit reached for fd {}",
                    fd
                )))
            }
            _ => {
                error!("Fatal epoll_ctl({}) error on fd {}: {}", op, fd, err);
                std::process::abort();
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    use super::events;
    use super::Poller;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn add_wait_remove() {
        let poller = Poller::new().unwrap();
        let (mut writer, reader) = socket_pair();

        assert!(poller.add_fd(reader.as_raw_fd(), events::IN, 42).unwrap());

        // No data yet.
        let mut out = Vec::new();
        assert_eq!(poller.wait(&mut out, 16, 0).unwrap(), 0);

        writer.write_all(b"x").unwrap();
        assert_eq!(poller.wait(&mut out, 16, 1000).unwrap(), 1);
        assert_eq!(out[0].token, 42);
        assert!(out[0].events & events::IN != 0);

        assert!(poller.remove_fd(reader.as_raw_fd()).unwrap());
    }

    #[test]
    fn double_add_and_missing_remove_are_benign() {
        let poller = Poller::new().unwrap();
        let (_writer, reader) = socket_pair();

        assert!(poller.add_fd(reader.as_raw_fd(), events::IN, 1).unwrap());
        assert!(!poller.add_fd(reader.as_raw_fd(), events::IN, 1).unwrap());

        assert!(poller.remove_fd(reader.as_raw_fd()).unwrap());
        assert!(!poller.remove_fd(reader.as_raw_fd()).unwrap());
    }
}
