use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A shared FIFO. Clones refer to the same underlying queue.
///
/// Pushes from a single thread are popped in push order; pushes from
/// different threads interleave without further guarantees.
#[derive(Debug)]
pub struct SharedQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        SharedQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        SharedQueue::new()
    }
}

impl<T> SharedQueue<T> {
    pub fn new() -> Self {
        SharedQueue {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, val: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.push_back(val);
    }

    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.pop_front()
    }

    /// Take everything queued so far in one lock acquisition.
    pub fn drain(&self) -> VecDeque<T> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut *inner)
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.is_empty()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.len()
    }
}
