use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore used to wait for work posted to another thread.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore::default()
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Returns false if the timeout elapsed before a post.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let (guard, result) = self.cond.wait_timeout(count, timeout).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::Semaphore;

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn wait_timeout_expires() {
        let sem = Semaphore::new();
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn cross_thread_post_wakes_waiter() {
        let sem = Arc::new(Semaphore::new());
        let posted = Arc::clone(&sem);

        let handle = std::thread::spawn(move || {
            posted.post();
        });

        assert!(sem.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
