//! The worker: one pinned OS thread driving one poller, one inbox, one
//! timer and the DCBs it owns. Dispatch is cooperative; a handler that
//! blocks stalls every connection on the worker, so handlers never block.
//!
//! A worker's state is single-writer by construction: only the worker
//! thread touches it, which is why the interior mutability below is
//! `Cell`/`RefCell`, not locks. The cross-thread surface is limited to
//! the inbox, the shutdown flag and the published load average.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use common::err::proxy_error::ProxyError;
use common::err::PResult;
use common::structure::semaphore::Semaphore;
use common::LOAD_GRANULARITY_MS;

use crate::dcb::{Dcb, DcbId, DcbRegistry};
use crate::load::{LoadReader, WorkerLoad};
use crate::message_queue::{Message, MessageQueue};
use crate::poller::{PollEvent, Poller};
use crate::timer::WorkerTimer;
use crate::{actions, MAX_EVENTS_DEFAULT};

const TOKEN_MESSAGE_QUEUE: u64 = 0;
const TOKEN_TIMER: u64 = 1;
const TOKEN_DCB_BASE: u64 = 2;

/// Histogram resolution of the queue/execution time statistics, in 100 ms
/// buckets.
pub const N_QUEUE_TIMES: usize = 30;
const MAX_NFDS: usize = 10;

thread_local! {
    /// The worker running on this thread, while it is inside `run()`.
    static CURRENT_WORKER: Cell<Option<(usize, *const Worker)>> = const { Cell::new(None) };
}

/// A task shipped to a worker. It runs on the worker thread with access
/// to the worker itself.
pub type Task = Box<dyn FnOnce(&Worker) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    /// Run inline when the caller already is the worker thread, enqueue
    /// otherwise.
    Auto,
    /// Always enqueue.
    Queued,
}

/// Control messages that must be postable from signal handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Idle,
    Polling,
    Processing,
}

/// Why a delayed call is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Execute,
    /// The worker is shutting down; release owned resources. The return
    /// value is ignored.
    Cancel,
}

struct DelayedCall {
    id: u32,
    at: i64,
    delay_ms: i64,
    callback: Box<dyn FnMut(&Worker, Call) -> bool + Send>,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub n_polls: u64,
    pub n_pollev: u64,
    pub n_accept: u64,
    pub n_read: u64,
    pub n_write: u64,
    pub n_hup: u64,
    pub n_error: u64,
    pub evq_avg: i64,
    pub evq_max: i64,
    pub maxqtime: i64,
    pub maxexectime: i64,
    /// Time from batch start to dispatch, 100 ms buckets, last is
    /// overflow.
    pub qtimes: [u64; N_QUEUE_TIMES + 1],
    /// Handler execution time, same buckets.
    pub exectimes: [u64; N_QUEUE_TIMES + 1],
    /// Distribution of events per poll return.
    pub n_fds: [u64; MAX_NFDS],
}

impl Default for Statistics {
    fn default() -> Self {
        Statistics {
            n_polls: 0,
            n_pollev: 0,
            n_accept: 0,
            n_read: 0,
            n_write: 0,
            n_hup: 0,
            n_error: 0,
            evq_avg: 0,
            evq_max: 0,
            maxqtime: 0,
            maxexectime: 0,
            qtimes: [0; N_QUEUE_TIMES + 1],
            exectimes: [0; N_QUEUE_TIMES + 1],
            n_fds: [0; MAX_NFDS],
        }
    }
}

/// The cross-thread surface of a worker.
#[derive(Debug)]
pub struct WorkerShared {
    worker_id: usize,
    inbox: MessageQueue,
    should_shutdown: AtomicBool,
    load: LoadReader,
}

impl WorkerShared {
    pub fn id(&self) -> usize {
        self.worker_id
    }

    /// The rolling 1-second load percentage; the only worker metric that
    /// may be read from other threads.
    pub fn load(&self) -> u8 {
        self.load.percentage()
    }

    pub fn should_shutdown(&self) -> bool {
        self.should_shutdown.load(Ordering::Acquire)
    }

    /// Run a task on the worker. Under `Auto`, a caller already on the
    /// worker thread runs it inline and the semaphore is posted before
    /// return; otherwise the task goes through the inbox. Tasks posted
    /// from a single thread run in posting order.
    pub fn execute(
        &self,
        mode: ExecuteMode,
        task: Task,
        sem: Option<Arc<Semaphore>>,
    ) -> bool {
        if mode == ExecuteMode::Auto {
            let inline = CURRENT_WORKER.with(|current| current.get());
            if let Some((id, worker)) = inline {
                if id == self.worker_id {
                    // The pointer is valid for as long as the worker
                    // thread is inside run(), which it is, because we are
                    // running on it.
                    let worker = unsafe { &*worker };
                    task(worker);
                    if let Some(sem) = sem {
                        sem.post();
                    }
                    return true;
                }
            }
        }

        self.inbox.post(Message::Task { task, sem })
    }

    /// Post a task and wait for it to finish.
    pub fn call(&self, task: Task) -> bool {
        let sem = Arc::new(Semaphore::new());
        if !self.execute(ExecuteMode::Auto, task, Some(Arc::clone(&sem))) {
            return false;
        }
        sem.wait();
        true
    }

    /// Signal-safe control path: one atomic store and one eventfd write.
    pub fn post_message(&self, message: ControlMessage) -> bool {
        match message {
            ControlMessage::Shutdown => self.inbox.post_shutdown(),
        }
    }
}

/// Owner-side handle of a started worker. Dropping it shuts the worker
/// down and joins the thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub fn id(&self) -> usize {
        self.shared.id()
    }

    pub fn load(&self) -> u8 {
        self.shared.load()
    }

    pub fn execute(&self, mode: ExecuteMode, task: Task, sem: Option<Arc<Semaphore>>) -> bool {
        self.shared.execute(mode, task, sem)
    }

    pub fn shutdown(&self) {
        self.shared.post_message(ControlMessage::Shutdown);
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Worker {} thread panicked.", self.shared.id());
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

pub struct Worker {
    id: usize,
    max_events: usize,
    epoch: Instant,

    poller: Poller,
    inbox: MessageQueue,
    timer: WorkerTimer,
    shared: Arc<WorkerShared>,

    state: Cell<WorkerState>,
    load: RefCell<WorkerLoad>,
    stats: RefCell<Statistics>,

    dcbs: RefCell<DcbRegistry>,
    /// Closed DCBs awaiting release at the end of the cycle.
    zombies: RefCell<Vec<Dcb>>,

    calls_by_time: RefCell<BTreeMap<(i64, u32), DelayedCall>>,
    call_times: RefCell<HashMap<u32, i64>>,
    next_call_id: Cell<u32>,
    /// The delayed call currently being dispatched, if any, and whether
    /// it was cancelled mid-dispatch.
    dispatching_call: Cell<Option<u32>>,
    dispatch_cancelled: Cell<bool>,
}

impl Worker {
    /// Spawn a worker thread. The worker itself is created on its own
    /// thread and never leaves it; the returned handle is the only way to
    /// reach it from outside.
    pub fn start(id: usize, max_events: usize) -> PResult<WorkerHandle> {
        let inbox = MessageQueue::new()?;
        let load = WorkerLoad::new();

        let shared = Arc::new(WorkerShared {
            worker_id: id,
            inbox: inbox.clone(),
            should_shutdown: AtomicBool::new(false),
            load: load.reader(),
        });

        let thread_shared = Arc::clone(&shared);
        let (init_tx, init_rx) = mpsc::channel::<PResult<()>>();

        let join = std::thread::Builder::new()
            .name(format!("worker-{:02}", id))
            .spawn(move || {
                match Worker::new(id, max_events, inbox, load, thread_shared) {
                    Ok(worker) => {
                        let _ = init_tx.send(Ok(()));
                        worker.run();
                    }
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                    }
                }
            })
            .map_err(|e| ProxyError::Error(format!("could not start worker thread: {}", e)))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(WorkerHandle {
                shared,
                join: Some(join),
            }),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(ProxyError::Error(
                    "worker thread died during initialization".to_string(),
                ))
            }
        }
    }

    fn new(
        id: usize,
        max_events: usize,
        inbox: MessageQueue,
        load: WorkerLoad,
        shared: Arc<WorkerShared>,
    ) -> PResult<Worker> {
        let poller = Poller::new()?;
        let timer = WorkerTimer::new()?;

        poller.add_fd(inbox.fd(), crate::poller::events::IN, TOKEN_MESSAGE_QUEUE)?;
        poller.add_fd(timer.fd(), crate::poller::events::IN, TOKEN_TIMER)?;

        Ok(Worker {
            id,
            max_events: max_events.max(1).min(MAX_EVENTS_DEFAULT),
            epoch: Instant::now(),
            poller,
            inbox,
            timer,
            shared,
            state: Cell::new(WorkerState::Stopped),
            load: RefCell::new(load),
            stats: RefCell::new(Statistics::default()),
            dcbs: RefCell::new(DcbRegistry::new()),
            zombies: RefCell::new(Vec::new()),
            calls_by_time: RefCell::new(BTreeMap::new()),
            call_times: RefCell::new(HashMap::new()),
            next_call_id: Cell::new(1),
            dispatching_call: Cell::new(None),
            dispatch_cancelled: Cell::new(false),
        })
    }

    //
    // Accessors
    //

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.borrow().clone()
    }

    pub fn dcb_count(&self) -> usize {
        self.dcbs.borrow().len()
    }

    /// Milliseconds of monotonic time since the worker started.
    pub fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn now_100ms_ticks(&self) -> i64 {
        self.now_ms() / 100
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(crate) fn dcb_token(&self, id: DcbId) -> u64 {
        TOKEN_DCB_BASE + id
    }

    //
    // DCB ownership
    //

    /// Take ownership of a DCB and start polling it.
    pub fn add_dcb(&self, dcb: Dcb) -> PResult<DcbId> {
        let mut registry = self.dcbs.borrow_mut();
        let id = registry.add(dcb, self.id);

        let enabled = registry
            .get_mut(id)
            .map(|dcb| dcb.enable_events(self))
            .unwrap_or(false);

        if !enabled {
            registry.remove(id);
            return Err(ProxyError::ResourceExhausted(format!(
                "could not start polling DCB on worker {}",
                self.id
            )));
        }

        Ok(id)
    }

    /// First phase of closing a DCB from outside a handler. The slot is
    /// released at the end of the current cycle.
    pub fn close_dcb(&self, id: DcbId) -> bool {
        let taken = self.dcbs.borrow_mut().take(id);
        match taken {
            Some(mut dcb) => {
                dcb.close(self);
                self.zombies.borrow_mut().push(dcb);
                true
            }
            None => false,
        }
    }

    /// Run a closure against a DCB the worker owns.
    pub fn with_dcb<R>(&self, id: DcbId, f: impl FnOnce(&mut Dcb) -> R) -> Option<R> {
        let mut registry = self.dcbs.borrow_mut();
        registry.get_mut(id).map(f)
    }

    //
    // Delayed calls
    //

    /// Schedule a callback `delay_ms` from now. The callback re-arms
    /// itself by returning true.
    pub fn delayed_call<F>(&self, delay_ms: i64, callback: F) -> u32
    where
        F: FnMut(&Worker, Call) -> bool + Send + 'static,
    {
        let id = self.next_call_id.get();
        self.next_call_id.set(id.wrapping_add(1).max(1));

        let delay_ms = delay_ms.max(0);
        let call = DelayedCall {
            id,
            at: self.now_ms() + delay_ms,
            delay_ms,
            callback: Box::new(callback),
        };

        self.insert_delayed(call);
        self.adjust_timer();
        id
    }

    /// Cooperative cancellation: removes the call if it has not fired. A
    /// call already dispatched in this tick still runs to completion, and
    /// cancelling it reports success.
    pub fn cancel_delayed_call(&self, id: u32) -> bool {
        let Some(at) = self.call_times.borrow_mut().remove(&id) else {
            if self.dispatching_call.get() == Some(id) {
                self.dispatch_cancelled.set(true);
                return true;
            }
            warn!("Attempt to remove a delayed call with non-existing id {}.", id);
            return false;
        };

        self.calls_by_time.borrow_mut().remove(&(at, id));
        self.adjust_timer();
        true
    }

    fn insert_delayed(&self, call: DelayedCall) {
        self.call_times.borrow_mut().insert(call.id, call.at);
        self.calls_by_time.borrow_mut().insert((call.at, call.id), call);
    }

    fn adjust_timer(&self) {
        let next_at = self
            .calls_by_time
            .borrow()
            .keys()
            .next()
            .map(|(at, _)| *at);

        match next_at {
            Some(at) => {
                let delay = (at - self.now_ms()).max(1);
                if let Err(err) = self.timer.start(delay) {
                    error!("Could not arm worker timer: {}", err);
                }
            }
            None => {
                let _ = self.timer.cancel();
            }
        }
    }

    /// Dispatch every delayed call whose time has come.
    fn tick(&self) {
        let now = self.now_ms();
        let mut due = Vec::new();

        {
            let mut by_time = self.calls_by_time.borrow_mut();
            let mut times = self.call_times.borrow_mut();

            while let Some(&(at, id)) = by_time.keys().next() {
                if at > now {
                    break;
                }
                if let Some(call) = by_time.remove(&(at, id)) {
                    times.remove(&id);
                    due.push(call);
                }
            }
        }

        for mut call in due {
            self.dispatching_call.set(Some(call.id));
            self.dispatch_cancelled.set(false);
            let rearm = (call.callback)(self, Call::Execute);
            self.dispatching_call.set(None);

            if rearm && !self.dispatch_cancelled.get() {
                call.at = now + call.delay_ms;
                self.insert_delayed(call);
            }
        }

        self.adjust_timer();
    }

    /// Invoked once for every remaining call when the worker goes down,
    /// so the callbacks can release what they own.
    fn cancel_all_delayed_calls(&self) {
        let calls: Vec<DelayedCall> = {
            let mut by_time = self.calls_by_time.borrow_mut();
            self.call_times.borrow_mut().clear();
            let drained: Vec<DelayedCall> =
                std::mem::take(&mut *by_time).into_values().collect();
            drained
        };

        for mut call in calls {
            (call.callback)(self, Call::Cancel);
        }
    }

    //
    // The loop
    //

    fn run(&self) {
        CURRENT_WORKER.with(|current| current.set(Some((self.id, self as *const Worker))));

        if self.pre_run() {
            self.poll_waitevents();
            self.post_run();
            info!("Worker {} has shut down.", self.id);
        }

        CURRENT_WORKER.with(|current| current.set(None));
    }

    fn pre_run(&self) -> bool {
        debug!("Worker {} starting.", self.id);
        true
    }

    fn post_run(&self) {
        self.cancel_all_delayed_calls();

        // Drop every remaining DCB; sockets close with them.
        let ids = self.dcbs.borrow().ids();
        for id in ids {
            self.close_dcb(id);
        }
        self.epoll_tick();
    }

    fn poll_waitevents(&self) {
        let mut events_buf: Vec<PollEvent> = Vec::new();

        self.state.set(WorkerState::Idle);
        self.load.borrow_mut().reset(self.now_ms());

        let mut n_fds_total: i64 = 0;
        let mut n_polls_effective: i64 = 0;

        while !self.shared.should_shutdown() {
            self.state.set(WorkerState::Polling);
            self.stats.borrow_mut().n_polls += 1;

            let now = self.now_ms();
            let timeout =
                (LOAD_GRANULARITY_MS - (now - self.load.borrow().window_start())).max(0);

            self.load.borrow_mut().about_to_wait(now);
            let nfds = match self
                .poller
                .wait(&mut events_buf, self.max_events, timeout as i32)
            {
                Ok(n) => n,
                Err(err) => {
                    error!("epoll_wait failed on worker {}: {}", self.id, err);
                    0
                }
            };
            self.load.borrow_mut().about_to_work(self.now_ms());

            if nfds > 0 {
                n_polls_effective += 1;
                n_fds_total += nfds as i64;
                if n_fds_total <= 0 {
                    // Wrapped; reset the running average.
                    n_fds_total = nfds as i64;
                    n_polls_effective = 1;
                }

                {
                    let mut stats = self.stats.borrow_mut();
                    stats.evq_avg = n_fds_total / n_polls_effective;
                    stats.evq_max = stats.evq_max.max(nfds as i64);
                    stats.n_pollev += 1;
                    stats.n_fds[(nfds - 1).min(MAX_NFDS - 1)] += 1;
                }

                self.state.set(WorkerState::Processing);
            }

            let cycle_start = self.now_100ms_ticks();

            for i in 0..nfds {
                let event = events_buf[i];

                let started = self.now_100ms_ticks();
                let qtime = started - cycle_start;
                {
                    let mut stats = self.stats.borrow_mut();
                    stats.qtimes[(qtime as usize).min(N_QUEUE_TIMES)] += 1;
                    stats.maxqtime = stats.maxqtime.max(qtime);
                }

                let action_bits = self.deliver_event(event.token, event.events);

                {
                    let mut stats = self.stats.borrow_mut();
                    if action_bits & actions::ACCEPT != 0 {
                        stats.n_accept += 1;
                    }
                    if action_bits & actions::READ != 0 {
                        stats.n_read += 1;
                    }
                    if action_bits & actions::WRITE != 0 {
                        stats.n_write += 1;
                    }
                    if action_bits & actions::HUP != 0 {
                        stats.n_hup += 1;
                    }
                    if action_bits & actions::ERROR != 0 {
                        stats.n_error += 1;
                    }

                    let exectime = self.now_100ms_ticks() - started;
                    stats.exectimes[(exectime as usize).min(N_QUEUE_TIMES)] += 1;
                    stats.maxexectime = stats.maxexectime.max(exectime);
                }
            }

            self.epoll_tick();
            self.state.set(WorkerState::Idle);
        }

        self.state.set(WorkerState::Stopped);
    }

    fn deliver_event(&self, token: u64, event_bits: u32) -> u32 {
        match token {
            TOKEN_MESSAGE_QUEUE => {
                self.handle_messages();
                actions::READ
            }
            TOKEN_TIMER => {
                self.timer.drain();
                self.tick();
                actions::READ
            }
            token => {
                let id = token - TOKEN_DCB_BASE;

                // Take the DCB out of the registry for the duration of
                // the dispatch so the handler can reach the worker.
                let taken = self.dcbs.borrow_mut().take(id);
                let Some(mut dcb) = taken else {
                    return 0;
                };

                // A panicking handler must not take the worker down with
                // it; the offending connection is hung up instead.
                let dispatched =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let mut bits = dcb.process_events(self, event_bits);

                        // Synthetic events injected by the handler,
                        // delivered before control returns to the poll
                        // wait.
                        while let Some(fake_events) = dcb.take_triggered_event() {
                            bits |= dcb.process_events(self, fake_events);
                        }
                        bits
                    }));

                let action_bits = match dispatched {
                    Ok(bits) => bits,
                    Err(_) => {
                        error!(
                            "Handler of DCB {} panicked; closing the connection.",
                            dcb.id()
                        );
                        dcb.close(self);
                        actions::ERROR
                    }
                };

                if dcb.is_open() {
                    self.dcbs.borrow_mut().put_back(id, dcb);
                } else {
                    // Second phase of the close happens in epoll_tick.
                    self.zombies.borrow_mut().push(dcb);
                }

                action_bits
            }
        }
    }

    fn handle_messages(&self) {
        let drained = self.inbox.drain();

        if drained.shutdown {
            info!("Worker {} received shutdown message.", self.id);
            self.shared.should_shutdown.store(true, Ordering::Release);
        }

        for message in drained.messages {
            match message {
                Message::Task { task, sem } => {
                    task(self);
                    if let Some(sem) = sem {
                        sem.post();
                    }
                }
            }
        }
    }

    /// End-of-cycle hook: releases the DCB slots closed during this
    /// cycle.
    fn epoll_tick(&self) {
        let zombies: Vec<Dcb> = std::mem::take(&mut *self.zombies.borrow_mut());
        drop(zombies);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn start_worker() -> WorkerHandle {
        Worker::start(0, MAX_EVENTS_DEFAULT).unwrap()
    }

    #[test]
    fn starts_and_shuts_down() {
        let mut handle = start_worker();
        handle.shutdown();
        handle.join();
    }

    #[test]
    fn executes_tasks_in_post_order() {
        let handle = start_worker();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            handle.execute(
                ExecuteMode::Queued,
                Box::new(move |_worker| log.lock().unwrap().push(i)),
                None,
            );
        }

        let sem = Arc::new(Semaphore::new());
        handle.execute(ExecuteMode::Queued, Box::new(|_| {}), Some(Arc::clone(&sem)));
        assert!(sem.wait_timeout(Duration::from_secs(5)));

        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn auto_mode_runs_inline_on_the_worker_thread() {
        let handle = start_worker();
        let log = Arc::new(Mutex::new(Vec::new()));

        let outer_log = Arc::clone(&log);
        let shared = Arc::clone(handle.shared());
        let sem = Arc::new(Semaphore::new());

        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |_worker| {
                outer_log.lock().unwrap().push("a");

                // Same thread: Auto runs this immediately, not queued.
                let inner_log = Arc::clone(&outer_log);
                shared.execute(
                    ExecuteMode::Auto,
                    Box::new(move |_| inner_log.lock().unwrap().push("b")),
                    None,
                );

                outer_log.lock().unwrap().push("c");
            }),
            Some(Arc::clone(&sem)),
        );

        assert!(sem.wait_timeout(Duration::from_secs(5)));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn call_waits_for_completion() {
        let handle = start_worker();
        let flag = Arc::new(AtomicUsize::new(0));

        let task_flag = Arc::clone(&flag);
        assert!(handle.shared().call(Box::new(move |_| {
            task_flag.store(7, Ordering::SeqCst);
        })));

        assert_eq!(flag.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn delayed_call_fires_and_repeats() {
        let handle = start_worker();
        let count = Arc::new(AtomicUsize::new(0));

        let task_count = Arc::clone(&count);
        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |worker| {
                let count = Arc::clone(&task_count);
                worker.delayed_call(10, move |_worker, call| {
                    if call == Call::Cancel {
                        return false;
                    }
                    // Re-arm until three invocations happened.
                    count.fetch_add(1, Ordering::SeqCst) + 1 < 3
                });
            }),
            None,
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // It stopped re-arming; no further invocations.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_delayed_call_does_not_fire() {
        let handle = start_worker();
        let count = Arc::new(AtomicUsize::new(0));

        let task_count = Arc::clone(&count);
        let sem = Arc::new(Semaphore::new());
        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |worker| {
                let count = Arc::clone(&task_count);
                let id = worker.delayed_call(5_000, move |_worker, _call| {
                    count.fetch_add(1, Ordering::SeqCst);
                    false
                });
                assert!(worker.cancel_delayed_call(id));
                assert!(!worker.cancel_delayed_call(id));
            }),
            Some(Arc::clone(&sem)),
        );

        assert!(sem.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remaining_delayed_calls_are_cancelled_at_shutdown() {
        let mut handle = start_worker();
        let cancelled = Arc::new(AtomicUsize::new(0));

        let task_cancelled = Arc::clone(&cancelled);
        let sem = Arc::new(Semaphore::new());
        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |worker| {
                let cancelled = Arc::clone(&task_cancelled);
                worker.delayed_call(60_000, move |_worker, call| {
                    if call == Call::Cancel {
                        cancelled.fetch_add(1, Ordering::SeqCst);
                    }
                    false
                });
            }),
            Some(Arc::clone(&sem)),
        );
        assert!(sem.wait_timeout(Duration::from_secs(5)));

        handle.shutdown();
        handle.join();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_is_published_cross_thread() {
        let handle = start_worker();
        // An idle worker settles at zero load once a window has passed.
        std::thread::sleep(Duration::from_millis(1100));
        assert!(handle.load() <= 5);
    }
}
