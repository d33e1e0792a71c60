//! Worker-private timerfd, armed to the next delayed call.

use std::io;
use std::os::fd::RawFd;

use common::err::proxy_error::ProxyError;
use common::err::PResult;

#[derive(Debug)]
pub struct WorkerTimer {
    fd: RawFd,
}

impl WorkerTimer {
    pub fn new() -> PResult<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(ProxyError::IoError(io::Error::last_os_error()));
        }
        Ok(WorkerTimer { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Arm a one-shot expiry `delay_ms` from now. A zero or negative
    /// delay fires as soon as possible.
    pub fn start(&self, delay_ms: i64) -> PResult<()> {
        let delay_ms = delay_ms.max(1);
        let time = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay_ms / 1000,
                tv_nsec: (delay_ms % 1000) * 1_000_000,
            },
        };

        self.settime(&time)
    }

    /// Disarm.
    pub fn cancel(&self) -> PResult<()> {
        let time = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };

        self.settime(&time)
    }

    /// Consume the expiry count after the fd turned readable.
    pub fn drain(&self) {
        let mut expirations: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn settime(&self, time: &libc::itimerspec) -> PResult<()> {
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, time, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(ProxyError::IoError(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for WorkerTimer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
