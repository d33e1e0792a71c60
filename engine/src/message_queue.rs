//! The worker inbox: a shared FIFO of messages paired with an eventfd
//! that wakes the owner's poll loop. The regular path locks the queue;
//! the shutdown path must be callable from a signal handler and therefore
//! uses only an atomic flag and the eventfd write.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::err::proxy_error::ProxyError;
use common::err::PResult;
use common::structure::queue::SharedQueue;
use common::structure::semaphore::Semaphore;

use crate::worker::Task;

pub enum Message {
    /// Run a task on the worker thread, posting the semaphore afterwards.
    Task {
        task: Task,
        sem: Option<Arc<Semaphore>>,
    },
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Task { sem, .. } => f
                .debug_struct("Task")
                .field("with_semaphore", &sem.is_some())
                .finish(),
        }
    }
}

/// Control bits deliverable without taking a lock.
const SIGNAL_SHUTDOWN: u32 = 1 << 0;

#[derive(Debug)]
struct MqShared {
    event_fd: RawFd,
    queue: SharedQueue<Message>,
    signals: AtomicU32,
}

impl Drop for MqShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.event_fd);
        }
    }
}

/// Cloneable handle to one worker's inbox. Messages posted by one sender
/// drain in post order; posts from different senders interleave.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    inner: Arc<MqShared>,
}

/// Everything the drain produced in one sweep.
#[derive(Debug, Default)]
pub struct Drained {
    pub shutdown: bool,
    pub messages: Vec<Message>,
}

impl MessageQueue {
    pub fn new() -> PResult<Self> {
        let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if event_fd == -1 {
            return Err(ProxyError::IoError(io::Error::last_os_error()));
        }

        Ok(MessageQueue {
            inner: Arc::new(MqShared {
                event_fd,
                queue: SharedQueue::new(),
                signals: AtomicU32::new(0),
            }),
        })
    }

    /// The descriptor the owning worker registers with its poller.
    pub fn fd(&self) -> RawFd {
        self.inner.event_fd
    }

    /// Post a message. Takes the queue lock; not signal-safe.
    pub fn post(&self, message: Message) -> bool {
        self.inner.queue.push(message);
        self.notify()
    }

    /// Post the shutdown request. No locks, no allocation: an atomic
    /// store plus one eventfd write, both async-signal-safe.
    pub fn post_shutdown(&self) -> bool {
        self.inner.signals.fetch_or(SIGNAL_SHUTDOWN, Ordering::Release);
        self.notify()
    }

    /// Collect pending control bits and messages. Called by the owning
    /// worker when the eventfd turns readable.
    pub fn drain(&self) -> Drained {
        // Clear the eventfd counter first so a post racing with the drain
        // leaves it readable again.
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.inner.event_fd,
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }

        let signals = self.inner.signals.swap(0, Ordering::Acquire);

        Drained {
            shutdown: signals & SIGNAL_SHUTDOWN != 0,
            messages: self.inner.queue.drain().into(),
        }
    }

    fn notify(&self) -> bool {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.inner.event_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        n == std::mem::size_of::<u64>() as isize
    }
}
