//! The Descriptor Control Block: the buffered, event-driven half-duplex
//! I/O unit every client and backend connection runs through.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use openssl::ssl::Ssl;
use tracing::{error, warn};

use common::err::proxy_error::ProxyError;
use common::err::PResult;
use common::{DEFAULT_WRITEQ_HIGH_WATER, DEFAULT_WRITEQ_LOW_WATER};

use crate::dcb::stream::{DcbStream, IoOutcome};
use crate::dcb::{Callback, DcbCallback, DcbHandler, DcbId, Reason, Role, SslState, State, Stats};
use crate::poller::events;
use crate::worker::Worker;
use crate::{actions, READ_BUFFER_SIZE};

/// Whether `writeq_append` should try to flush immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    Yes,
    No,
}

/// Result of a [`Dcb::read`] call.
#[derive(Debug)]
pub enum ReadResult {
    ReadOk(Bytes),
    InsufficientData,
    Error,
}

impl ReadResult {
    pub fn ok(&self) -> bool {
        matches!(self, ReadResult::ReadOk(_))
    }

    pub fn error(&self) -> bool {
        matches!(self, ReadResult::Error)
    }
}

#[derive(Debug)]
struct Encryption {
    state: SslState,
    read_want_read: bool,
    read_want_write: bool,
    write_want_read: bool,
    write_want_write: bool,
}

impl Default for Encryption {
    fn default() -> Self {
        Encryption {
            state: SslState::HandshakeUnknown,
            read_want_read: false,
            read_want_write: false,
            write_want_read: false,
            write_want_write: false,
        }
    }
}

pub struct Dcb {
    id: DcbId,
    fd: RawFd,
    remote: String,
    role: Role,
    state: State,
    owner: Option<usize>,
    session_id: u64,

    stream: Option<DcbStream>,
    encryption: Encryption,
    handler: Option<Box<dyn DcbHandler>>,

    readq: BytesMut,
    writeq: VecDeque<Bytes>,
    writeq_len: u64,
    high_water: u64,
    low_water: u64,
    high_water_reached: bool,

    callbacks: Vec<Callback>,
    triggered_event: u32,
    is_fake_event: bool,
    hanged_up: bool,
    open: bool,

    stats: Stats,
    last_read: Instant,
    last_write: Instant,

    /// Last I/O failure, surfaced when the session is torn down.
    error_message: Option<String>,
}

impl std::fmt::Debug for Dcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dcb")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("writeq_len", &self.writeq_len)
            .finish()
    }
}

impl Dcb {
    pub fn new(
        stream: TcpStream,
        remote: String,
        role: Role,
        handler: Box<dyn DcbHandler>,
    ) -> PResult<Self> {
        Dcb::with_watermarks(
            stream,
            remote,
            role,
            handler,
            DEFAULT_WRITEQ_HIGH_WATER,
            DEFAULT_WRITEQ_LOW_WATER,
        )
    }

    pub fn with_watermarks(
        stream: TcpStream,
        remote: String,
        role: Role,
        handler: Box<dyn DcbHandler>,
        high_water: u64,
        low_water: u64,
    ) -> PResult<Self> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let fd = stream.as_raw_fd();
        let now = Instant::now();

        Ok(Dcb {
            id: 0,
            fd,
            remote,
            role,
            state: State::Created,
            owner: None,
            session_id: 0,
            stream: Some(DcbStream::Plain(stream)),
            encryption: Encryption::default(),
            handler: Some(handler),
            readq: BytesMut::new(),
            writeq: VecDeque::new(),
            writeq_len: 0,
            high_water,
            low_water,
            high_water_reached: false,
            callbacks: Vec::new(),
            triggered_event: 0,
            is_fake_event: false,
            hanged_up: false,
            open: true,
            stats: Stats::default(),
            last_read: now,
            last_write: now,
            error_message: None,
        })
    }

    //
    // Accessors
    //

    pub fn id(&self) -> DcbId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: u64) {
        self.session_id = session_id;
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    /// Change the owning worker. Permitted only while the DCB is not
    /// registered with any poller.
    pub fn set_owner(&mut self, worker_id: usize) -> bool {
        if self.state == State::Polling {
            error!("Attempt to change the owner of a polling DCB {}.", self.id);
            return false;
        }
        self.owner = Some(worker_id);
        true
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_polling(&self) -> bool {
        self.state == State::Polling
    }

    pub fn hanged_up(&self) -> bool {
        self.hanged_up
    }

    pub fn is_fake_event(&self) -> bool {
        self.is_fake_event
    }

    pub fn writeq_len(&self) -> u64 {
        self.writeq_len
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn last_write(&self) -> Instant {
        self.last_write
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn ssl_state(&self) -> SslState {
        self.encryption.state
    }

    pub fn ssl_enabled(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_tls()).unwrap_or(false)
    }

    //
    // Reading
    //

    /// Read from the internal read queue first, then the socket, until at
    /// least `min_bytes` are available or the socket would block. A zero
    /// `min_bytes` returns whatever is available, possibly nothing; a
    /// zero `max_bytes` applies no cap.
    pub fn read(&mut self, min_bytes: usize, max_bytes: usize) -> ReadResult {
        if !self.open {
            return ReadResult::Error;
        }

        if self.basic_read().is_err() {
            return ReadResult::Error;
        }

        if min_bytes == 0 || self.readq.len() >= min_bytes {
            let take = if max_bytes == 0 {
                self.readq.len()
            } else {
                self.readq.len().min(max_bytes)
            };
            ReadResult::ReadOk(self.readq.split_to(take).freeze())
        } else {
            ReadResult::InsufficientData
        }
    }

    /// Pull everything the socket currently has into the read queue.
    /// Edge-triggered polling requires reading to exhaustion.
    fn basic_read(&mut self) -> PResult<()> {
        self.encryption.read_want_read = false;
        self.encryption.read_want_write = false;

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let outcome = match self.stream.as_mut() {
                Some(stream) => stream.read(&mut buf),
                None => {
                    return Err(ProxyError::ConnectionError(
                        "DCB has no stream".to_string(),
                    ));
                }
            };

            match outcome {
                IoOutcome::Done(n) => {
                    self.readq.extend_from_slice(&buf[..n]);
                    self.stats.n_reads += 1;
                    self.last_read = Instant::now();
                }
                IoOutcome::WouldBlock {
                    want_read,
                    want_write,
                } => {
                    self.encryption.read_want_read = want_read;
                    self.encryption.read_want_write = want_write;
                    return Ok(());
                }
                IoOutcome::Closed => {
                    self.trigger_hangup_event();
                    return Ok(());
                }
                IoOutcome::Error(err) => {
                    self.record_error(format!("read failed: {}", err));
                    self.trigger_hangup_event();
                    return Err(err);
                }
            }
        }
    }

    //
    // Read queue management
    //

    pub fn readq_append(&mut self, data: &[u8]) {
        self.readq.extend_from_slice(data);
    }

    pub fn readq_prepend(&mut self, data: &[u8]) {
        let mut readq = BytesMut::with_capacity(data.len() + self.readq.len());
        readq.extend_from_slice(data);
        readq.extend_from_slice(&self.readq);
        self.readq = readq;
    }

    /// Take ownership of the read queue.
    pub fn readq_release(&mut self) -> BytesMut {
        std::mem::take(&mut self.readq)
    }

    /// Replace the read queue. Refused when data is already queued:
    /// silently dropping buffered bytes would corrupt the stream.
    pub fn readq_set(&mut self, data: BytesMut) -> bool {
        if !self.readq.is_empty() {
            error!("Read queue set while there already is a read queue.");
            return false;
        }
        self.readq = data;
        true
    }

    pub fn readq_len(&self) -> usize {
        self.readq.len()
    }

    //
    // Writing
    //

    /// Append to the write queue, optionally flushing. Returns false only
    /// when the DCB can no longer accept data; socket errors surface
    /// through the error and hangup paths, not here.
    pub fn writeq_append(&mut self, data: Bytes, drain: Drain) -> bool {
        if !self.open {
            return false;
        }

        self.writeq_len += data.len() as u64;
        self.writeq.push_back(data);
        self.stats.n_buffered += 1;

        if drain == Drain::Yes {
            self.writeq_drain();
        }

        if !self.high_water_reached && self.high_water > 0 && self.writeq_len >= self.high_water {
            self.high_water_reached = true;
            self.stats.n_high_water += 1;
            self.call_callback(Reason::HighWater);
        }

        true
    }

    /// Write until the socket would block. Every successful batch updates
    /// the queue length exactly; draining below the low watermark
    /// releases the backpressure latch.
    pub fn writeq_drain(&mut self) -> u64 {
        let mut written: u64 = 0;

        if self.open {
            self.encryption.write_want_read = false;
            self.encryption.write_want_write = false;

            while let Some(mut chunk) = self.writeq.pop_front() {
                let Some(stream) = self.stream.as_mut() else {
                    self.writeq.push_front(chunk);
                    break;
                };

                match stream.write(&chunk) {
                    IoOutcome::Done(n) => {
                        written += n as u64;
                        self.writeq_len -= n as u64;
                        self.stats.n_writes += 1;
                        self.last_write = Instant::now();

                        if n < chunk.len() {
                            // Kernel buffer filled mid-chunk.
                            chunk.advance(n);
                            self.writeq.push_front(chunk);
                            break;
                        }
                    }
                    IoOutcome::WouldBlock {
                        want_read,
                        want_write,
                    } => {
                        self.encryption.write_want_read = want_read;
                        self.encryption.write_want_write = want_write;
                        self.writeq.push_front(chunk);
                        break;
                    }
                    IoOutcome::Closed => {
                        self.writeq.push_front(chunk);
                        self.trigger_hangup_event();
                        break;
                    }
                    IoOutcome::Error(err) => {
                        self.record_error(format!("write failed: {}", err));
                        self.writeq.push_front(chunk);
                        self.trigger_hangup_event();
                        break;
                    }
                }
            }
        }

        if self.high_water_reached && self.writeq_len < self.low_water {
            self.high_water_reached = false;
            self.stats.n_low_water += 1;
            self.call_callback(Reason::LowWater);
        }

        written
    }

    //
    // TLS
    //

    /// Switch the plain stream into TLS mode; the handshake itself is
    /// driven by [`Dcb::ssl_handshake`] from readiness events.
    pub fn enable_ssl(&mut self, ssl: Ssl) -> PResult<()> {
        match self.stream.take() {
            Some(DcbStream::Plain(tcp)) => {
                let stream = openssl::ssl::SslStream::new(ssl, tcp).map_err(|e| {
                    ProxyError::ConnectionError(format!("cannot create TLS stream: {}", e))
                })?;
                self.stream = Some(DcbStream::Tls(Box::new(stream)));
                self.encryption.state = SslState::HandshakeRequired;
                Ok(())
            }
            other => {
                self.stream = other;
                Err(ProxyError::ConnectionError(
                    "TLS can only be enabled on a plain stream".to_string(),
                ))
            }
        }
    }

    /// Drive the TLS handshake without blocking.
    ///
    /// Returns -1 on error, 0 when more I/O is needed and the call must
    /// be repeated on the next readiness event, 1 once established.
    pub fn ssl_handshake(&mut self) -> i32 {
        match self.encryption.state {
            SslState::Established => return 1,
            SslState::HandshakeFailed => return -1,
            _ => {}
        }

        let Some(DcbStream::Tls(stream)) = self.stream.as_mut() else {
            return -1;
        };

        let result = match self.role {
            Role::Client => stream.accept(),
            Role::Backend => stream.connect(),
        };

        match result {
            Ok(()) => {
                self.encryption.state = SslState::Established;
                1
            }
            Err(err) => match err.code() {
                openssl::ssl::ErrorCode::WANT_READ => {
                    self.encryption.read_want_read = true;
                    0
                }
                openssl::ssl::ErrorCode::WANT_WRITE => {
                    self.encryption.read_want_write = true;
                    0
                }
                _ => {
                    self.record_error(format!("TLS handshake failed: {}", err));
                    self.encryption.state = SslState::HandshakeFailed;
                    -1
                }
            },
        }
    }

    //
    // Callbacks
    //

    /// Register a watermark callback. An identical (reason, function,
    /// userdata) triple can be registered only once.
    pub fn add_callback(&mut self, reason: Reason, cb: DcbCallback, userdata: u64) -> bool {
        let duplicate = self.callbacks.iter().any(|c| {
            c.reason == reason && c.cb as usize == cb as usize && c.userdata == userdata
        });
        if duplicate {
            return false;
        }

        self.callbacks.push(Callback {
            reason,
            cb,
            userdata,
        });
        true
    }

    pub fn remove_callback(&mut self, reason: Reason, cb: DcbCallback, userdata: u64) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|c| {
            !(c.reason == reason && c.cb as usize == cb as usize && c.userdata == userdata)
        });
        self.callbacks.len() != before
    }

    pub fn remove_callbacks(&mut self) {
        self.callbacks.clear();
    }

    fn call_callback(&mut self, reason: Reason) {
        let matching: Vec<Callback> = self
            .callbacks
            .iter()
            .filter(|c| c.reason == reason)
            .copied()
            .collect();

        for callback in matching {
            (callback.cb)(self, reason, callback.userdata);
        }
    }

    //
    // Synthetic events
    //

    /// Deliver a hangup to the handler after the current invocation
    /// finishes. Within one invocation only the last trigger call wins.
    pub fn trigger_hangup_event(&mut self) {
        self.triggered_event = events::HUP;
    }

    pub fn trigger_read_event(&mut self) {
        self.triggered_event = events::IN;
    }

    pub fn trigger_write_event(&mut self) {
        self.triggered_event = events::OUT;
    }

    pub(crate) fn take_triggered_event(&mut self) -> Option<u32> {
        if self.triggered_event == 0 {
            return None;
        }
        let event = std::mem::take(&mut self.triggered_event);
        self.is_fake_event = true;
        Some(event)
    }

    //
    // Poll registration
    //

    /// Register with the owning worker's poller. The caller must be the
    /// owning worker.
    pub fn enable_events(&mut self, worker: &Worker) -> bool {
        if self.owner != Some(worker.id()) {
            error!("DCB {} enabled by a non-owning worker.", self.id);
            return false;
        }
        if !matches!(self.state, State::Created | State::NoPolling) {
            return false;
        }

        let interest = events::IN | events::OUT | events::HUP | events::RDHUP;
        match worker.poller().add_fd(self.fd, interest, worker.dcb_token(self.id)) {
            Ok(_) => {
                self.state = State::Polling;
                true
            }
            Err(err) => {
                warn!("Could not register DCB {}: {}", self.id, err);
                false
            }
        }
    }

    /// Remove from the owning worker's poller.
    pub fn disable_events(&mut self, worker: &Worker) -> bool {
        if self.owner != Some(worker.id()) {
            error!("DCB {} disabled by a non-owning worker.", self.id);
            return false;
        }

        if self.state == State::Polling {
            let _ = worker.poller().remove_fd(self.fd);
            self.state = State::NoPolling;
        }
        true
    }

    /// First phase of the close: detach from the poller and mark the DCB
    /// closed. The owning worker releases the slot on a later tick, after
    /// any in-flight handler has returned.
    pub fn close(&mut self, worker: &Worker) {
        if !self.open {
            return;
        }

        self.disable_events(worker);
        self.open = false;
        self.state = State::Disconnected;
    }

    //
    // Event dispatch, called by the owning worker
    //

    pub(crate) fn assign(&mut self, id: DcbId, owner: usize) {
        self.id = id;
        self.owner = Some(owner);
    }

    pub(crate) fn process_events(&mut self, worker: &Worker, events_bits: u32) -> u32 {
        let mut rc = 0;

        let Some(mut handler) = self.handler.take() else {
            return rc;
        };

        if events_bits & events::ERR != 0 && self.open {
            rc |= actions::ERROR;
            handler.error(self, worker);
        }

        if events_bits & events::OUT != 0 && self.open {
            rc |= actions::WRITE;

            if self.encryption.state == SslState::HandshakeRequired {
                match self.ssl_handshake() {
                    1 => handler.write_ready(self, worker),
                    0 => {}
                    _ => self.trigger_hangup_event(),
                }
            } else if self.encryption.read_want_write {
                // A TLS read stalled on writability; retry it now.
                handler.ready_for_reading(self, worker);
            } else {
                self.writeq_drain();
                handler.write_ready(self, worker);
            }
        }

        if events_bits & events::IN != 0 && self.open {
            rc |= actions::READ;

            if self.encryption.state == SslState::HandshakeRequired {
                match self.ssl_handshake() {
                    1 => handler.ready_for_reading(self, worker),
                    0 => {}
                    _ => self.trigger_hangup_event(),
                }
            } else if self.encryption.write_want_read {
                // A TLS write stalled on readability; retry it now.
                self.writeq_drain();
            } else {
                handler.ready_for_reading(self, worker);
            }
        }

        if events_bits & (events::HUP | events::RDHUP) != 0 && self.open && !self.hanged_up {
            rc |= actions::HUP;
            self.hanged_up = true;
            handler.hangup(self, worker);
        }

        self.is_fake_event = false;
        self.handler = Some(handler);
        rc
    }

    fn record_error(&mut self, message: String) {
        if self.error_message.is_none() {
            self.error_message = Some(message);
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    use super::*;
    use crate::dcb::DcbHandler;

    struct NullHandler;

    impl DcbHandler for NullHandler {
        fn ready_for_reading(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
        fn write_ready(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
        fn error(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
        fn hangup(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
    }

    fn dcb_pair() -> (Dcb, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();

        let dcb = Dcb::new(
            server,
            peer.to_string(),
            Role::Client,
            Box::new(NullHandler),
        )
        .unwrap();
        (dcb, client)
    }

    fn watermark_dcb(high: u64, low: u64) -> (Dcb, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();

        let dcb = Dcb::with_watermarks(
            server,
            peer.to_string(),
            Role::Client,
            Box::new(NullHandler),
            high,
            low,
        )
        .unwrap();
        (dcb, client)
    }

    #[test]
    fn read_returns_queued_then_socket_data() {
        let (mut dcb, mut client) = dcb_pair();

        client.write_all(b"hello").unwrap();
        // Give the loopback a moment.
        std::thread::sleep(std::time::Duration::from_millis(20));

        match dcb.read(5, 0) {
            ReadResult::ReadOk(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected {:?}", other),
        }

        // Nothing left; a demand for more is unsatisfied but not an error.
        assert!(matches!(dcb.read(1, 0), ReadResult::InsufficientData));

        // Zero min returns an empty buffer rather than blocking.
        assert!(matches!(dcb.read(0, 0), ReadResult::ReadOk(_)));
    }

    #[test]
    fn read_respects_max_bytes() {
        let (mut dcb, mut client) = dcb_pair();

        client.write_all(b"abcdef").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        match dcb.read(2, 4) {
            ReadResult::ReadOk(data) => assert_eq!(&data[..], b"abcd"),
            other => panic!("unexpected {:?}", other),
        }
        match dcb.read(2, 4) {
            ReadResult::ReadOk(data) => assert_eq!(&data[..], b"ef"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn writeq_append_drains_to_peer() {
        let (mut dcb, mut client) = dcb_pair();

        assert!(dcb.writeq_append(Bytes::from_static(b"ping"), Drain::Yes));
        assert_eq!(dcb.writeq_len(), 0);

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn writeq_len_tracks_buffered_bytes() {
        let (mut dcb, _client) = dcb_pair();

        assert!(dcb.writeq_append(Bytes::from_static(b"abc"), Drain::No));
        assert!(dcb.writeq_append(Bytes::from_static(b"de"), Drain::No));
        assert_eq!(dcb.writeq_len(), 5);

        dcb.writeq_drain();
        assert_eq!(dcb.writeq_len(), 0);
    }

    fn counting_callback(dcb: &mut Dcb, _reason: Reason, _userdata: u64) -> i32 {
        dcb.set_session_id(dcb.session_id() + 1);
        0
    }

    #[test]
    fn high_water_fires_once_per_crossing() {
        let (mut dcb, _client) = watermark_dcb(10, 4);
        // Abuse the session id as a callback counter.
        assert!(dcb.add_callback(Reason::HighWater, counting_callback, 1));

        // Below the mark: no callback.
        assert!(dcb.writeq_append(Bytes::from_static(b"12345"), Drain::No));
        assert_eq!(dcb.session_id(), 0);

        // Crossing fires exactly once.
        assert!(dcb.writeq_append(Bytes::from_static(b"678901"), Drain::No));
        assert_eq!(dcb.session_id(), 1);

        // Still above: latched, no second fire.
        assert!(dcb.writeq_append(Bytes::from_static(b"x"), Drain::No));
        assert_eq!(dcb.session_id(), 1);

        // Drain below the low mark releases the latch...
        dcb.writeq_drain();
        assert_eq!(dcb.writeq_len(), 0);

        // ...and the next crossing fires again.
        assert!(dcb.writeq_append(Bytes::from_static(b"0123456789A"), Drain::No));
        assert_eq!(dcb.session_id(), 2);
    }

    #[test]
    fn low_water_fires_on_downward_crossing() {
        let (mut dcb, mut client) = watermark_dcb(10, 4);
        assert!(dcb.add_callback(Reason::LowWater, counting_callback, 1));

        assert!(dcb.writeq_append(Bytes::from_static(b"0123456789AB"), Drain::No));
        dcb.writeq_drain();

        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(dcb.session_id(), 1);
    }

    #[test]
    fn duplicate_callbacks_are_rejected() {
        let (mut dcb, _client) = dcb_pair();

        assert!(dcb.add_callback(Reason::HighWater, counting_callback, 7));
        assert!(!dcb.add_callback(Reason::HighWater, counting_callback, 7));
        // A different userdata is a different registration.
        assert!(dcb.add_callback(Reason::HighWater, counting_callback, 8));

        assert!(dcb.remove_callback(Reason::HighWater, counting_callback, 7));
        assert!(!dcb.remove_callback(Reason::HighWater, counting_callback, 7));
    }

    #[test]
    fn triggered_events_collapse_to_the_last() {
        let (mut dcb, _client) = dcb_pair();

        dcb.trigger_read_event();
        dcb.trigger_write_event();
        dcb.trigger_hangup_event();

        assert_eq!(dcb.take_triggered_event(), Some(events::HUP));
        assert!(dcb.is_fake_event());
        assert_eq!(dcb.take_triggered_event(), None);
    }

    #[test]
    fn readq_set_refuses_overwrite() {
        let (mut dcb, _client) = dcb_pair();

        assert!(dcb.readq_set(BytesMut::from(&b"abc"[..])));
        assert!(!dcb.readq_set(BytesMut::from(&b"xyz"[..])));

        let queued = dcb.readq_release();
        assert_eq!(&queued[..], b"abc");
        assert!(dcb.readq_set(BytesMut::from(&b"xyz"[..])));
    }

    #[test]
    fn readq_prepend_preserves_order() {
        let (mut dcb, mut client) = dcb_pair();

        client.write_all(b"world").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        // Pull everything, put back a partially consumed frame.
        match dcb.read(5, 0) {
            ReadResult::ReadOk(data) => assert_eq!(&data[..], b"world"),
            other => panic!("unexpected {:?}", other),
        }
        dcb.readq_prepend(b"hello ");

        match dcb.read(0, 0) {
            ReadResult::ReadOk(data) => assert_eq!(&data[..], b"hello "),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn peer_close_triggers_hangup_event() {
        let (mut dcb, client) = dcb_pair();
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));

        match dcb.read(0, 0) {
            ReadResult::ReadOk(data) => assert!(data.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dcb.take_triggered_event(), Some(events::HUP));
    }
}
