//! Worker and DCB working together: a live epoll loop serving sockets.

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use engine::dcb::{Dcb, DcbHandler, Drain, ReadResult, Role};
    use engine::worker::{ExecuteMode, Worker, WorkerHandle};
    use engine::MAX_EVENTS_DEFAULT;

    /// Echoes whatever arrives back to the peer.
    struct EchoHandler;

    impl DcbHandler for EchoHandler {
        fn ready_for_reading(&mut self, dcb: &mut Dcb, _worker: &Worker) {
            if let ReadResult::ReadOk(data) = dcb.read(0, 0) {
                if !data.is_empty() {
                    dcb.writeq_append(data, Drain::Yes);
                }
            }
        }

        fn write_ready(&mut self, dcb: &mut Dcb, _worker: &Worker) {
            dcb.writeq_drain();
        }

        fn error(&mut self, dcb: &mut Dcb, worker: &Worker) {
            dcb.close(worker);
        }

        fn hangup(&mut self, dcb: &mut Dcb, worker: &Worker) {
            dcb.close(worker);
        }
    }

    fn start_worker() -> WorkerHandle {
        Worker::start(0, MAX_EVENTS_DEFAULT).unwrap()
    }

    /// Hand a freshly accepted socket to the worker as a DCB.
    fn adopt(handle: &WorkerHandle, stream: TcpStream, peer: String) {
        let (tx, rx) = mpsc::channel();
        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |worker| {
                let dcb =
                    Dcb::new(stream, peer, Role::Client, Box::new(EchoHandler)).unwrap();
                tx.send(worker.add_dcb(dcb).is_ok()).unwrap();
            }),
            None,
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    fn dcb_count(handle: &WorkerHandle) -> usize {
        let (tx, rx) = mpsc::channel();
        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |worker| {
                tx.send(worker.dcb_count()).unwrap();
            }),
            None,
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn worker_echoes_client_bytes() {
        let handle = start_worker();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();

        adopt(&handle, server, peer.to_string());

        client.write_all(b"hello proxy").unwrap();

        let mut buf = [0u8; 11];
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello proxy");

        // Several messages in a row keep their order.
        for i in 0..5u8 {
            let message = [b'm', b'0' + i];
            client.write_all(&message).unwrap();
            let mut echo = [0u8; 2];
            client.read_exact(&mut echo).unwrap();
            assert_eq!(echo, message);
        }
    }

    #[test]
    fn peer_disconnect_releases_the_dcb() {
        let handle = start_worker();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();

        adopt(&handle, server, peer.to_string());
        assert_eq!(dcb_count(&handle), 1);

        drop(client);

        // Two-phase close: the slot is gone after the worker has seen the
        // hangup and finished the cycle.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if dcb_count(&handle) == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "DCB never released");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn many_connections_share_one_worker() {
        let handle = start_worker();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..8 {
            let client = TcpStream::connect(addr).unwrap();
            let (server, peer) = listener.accept().unwrap();
            adopt(&handle, server, peer.to_string());
            clients.push(client);
        }
        assert_eq!(dcb_count(&handle), 8);

        let echoed = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for mut client in clients {
            let echoed = Arc::clone(&echoed);
            joins.push(std::thread::spawn(move || {
                client
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                client.write_all(b"ping").unwrap();
                let mut buf = [0u8; 4];
                client.read_exact(&mut buf).unwrap();
                assert_eq!(&buf, b"ping");
                echoed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(echoed.load(Ordering::SeqCst), 8);
    }
}
