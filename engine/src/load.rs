//! Rolling worker load: the share of wall time spent processing events
//! within granularity-aligned windows. The published value is the one
//! piece of worker state the routing layer may read from other threads.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use common::LOAD_GRANULARITY_MS;

#[derive(Debug)]
pub struct WorkerLoad {
    window_start: i64,
    wait_start: i64,
    wait_time: i64,
    load_1s: Arc<AtomicU8>,
}

impl WorkerLoad {
    pub fn new() -> Self {
        WorkerLoad {
            window_start: 0,
            wait_start: 0,
            wait_time: 0,
            load_1s: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Handle other threads read the load through.
    pub fn reader(&self) -> LoadReader {
        LoadReader {
            load_1s: Arc::clone(&self.load_1s),
        }
    }

    pub fn reset(&mut self, now_ms: i64) {
        self.window_start = now_ms;
        self.wait_start = now_ms;
        self.wait_time = 0;
    }

    pub fn window_start(&self) -> i64 {
        self.window_start
    }

    /// The worker is about to block in the poll call.
    pub fn about_to_wait(&mut self, now_ms: i64) {
        self.wait_start = now_ms;
    }

    /// The worker returned from the poll call and is about to process.
    pub fn about_to_work(&mut self, now_ms: i64) {
        let duration = now_ms - self.window_start;
        self.wait_time += now_ms - self.wait_start;

        if duration >= LOAD_GRANULARITY_MS {
            let busy = (duration - self.wait_time).max(0);
            let load = (100 * busy) / duration.max(1);

            self.load_1s.store(load.min(100) as u8, Ordering::Release);
            self.window_start = now_ms;
            self.wait_time = 0;
        }
    }
}

/// Cross-thread view of one worker's 1-second load percentage.
#[derive(Debug, Clone)]
pub struct LoadReader {
    load_1s: Arc<AtomicU8>,
}

impl LoadReader {
    pub fn percentage(&self) -> u8 {
        self.load_1s.load(Ordering::Acquire)
    }
}
