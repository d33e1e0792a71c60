//! The full request path of the core: client bytes arrive at a DCB, the
//! handler frames them into packets, the classifier produces a routing
//! decision per statement, and a reply flows back through the DCB.

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};

    use classifier::classifier::QueryClassifier;
    use classifier::types::RouteTarget;
    use engine::dcb::{Dcb, DcbHandler, Drain, ReadResult, Role};
    use engine::worker::{ExecuteMode, Worker, WorkerHandle};
    use engine::MAX_EVENTS_DEFAULT;
    use protocol::packet::{split_packet, RequestPacket};

    /// A serialized OK packet: empty result, autocommit status set.
    const OK_PACKET: &[u8] = &[
        0x07, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
    ];

    /// Client-side protocol handler: frames packets, classifies them and
    /// acknowledges each statement so the test client can pace itself.
    struct ClassifyingHandler {
        classifier: QueryClassifier,
        buffer: BytesMut,
        decisions: Arc<Mutex<Vec<RouteTarget>>>,
    }

    impl DcbHandler for ClassifyingHandler {
        fn ready_for_reading(&mut self, dcb: &mut Dcb, _worker: &Worker) {
            if let ReadResult::ReadOk(data) = dcb.read(0, 0) {
                self.buffer.extend_from_slice(&data);
            }

            while let Some(packet) = split_packet(&mut self.buffer) {
                let info = self.classifier.update_and_commit_route_info(&packet);
                self.decisions.lock().unwrap().push(info.target());

                dcb.writeq_append(Bytes::from_static(OK_PACKET), Drain::Yes);
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

    fn run_statements(statements: &[&str]) -> Vec<RouteTarget> {
        let handle: WorkerHandle = Worker::start(0, MAX_EVENTS_DEFAULT).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server, peer) = listener.accept().unwrap();

        let decisions = Arc::new(Mutex::new(Vec::new()));
        let handler = ClassifyingHandler {
            classifier: QueryClassifier::new(),
            buffer: BytesMut::new(),
            decisions: Arc::clone(&decisions),
        };

        let (tx, rx) = mpsc::channel();
        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |worker| {
                let dcb =
                    Dcb::new(server, peer.to_string(), Role::Client, Box::new(handler)).unwrap();
                tx.send(worker.add_dcb(dcb).is_ok()).unwrap();
            }),
            None,
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        for statement in statements {
            let packet = RequestPacket::com_query(statement);
            client.write_all(packet.as_bytes()).unwrap();

            let mut ack = [0u8; OK_PACKET.len()];
            client.read_exact(&mut ack).unwrap();
            assert_eq!(ack[4], 0x00, "expected an OK acknowledgement");
        }

        let collected = decisions.lock().unwrap().clone();
        collected
    }

    #[test]
    fn transaction_flow_over_a_live_socket() {
        let targets = run_statements(&[
            "BEGIN",
            "SELECT 1",
            "INSERT INTO t VALUES(1)",
            "SELECT 2",
            "COMMIT",
            "SELECT 3",
        ]);

        assert_eq!(
            targets,
            vec![
                RouteTarget::MASTER, // BEGIN anchors the transaction
                RouteTarget::SLAVE,  // nothing written yet
                RouteTarget::MASTER, // the write pins the transaction
                RouteTarget::MASTER, // pinned for the remainder
                RouteTarget::MASTER, // COMMIT
                RouteTarget::SLAVE,  // free again outside the transaction
            ]
        );
    }

    #[test]
    fn hints_steer_routing_over_a_live_socket() {
        let targets = run_statements(&[
            "SELECT 1",
            "/* maxscale route to master */ SELECT 2",
            "-- maxscale start route to server srv1\nSELECT 3",
            "SELECT 4",
            "-- maxscale end\nSELECT 5",
        ]);

        assert_eq!(
            targets,
            vec![
                RouteTarget::SLAVE,
                RouteTarget::MASTER,
                RouteTarget::NAMED_SERVER,
                RouteTarget::NAMED_SERVER, // inherited from the hint stack
                RouteTarget::SLAVE,        // popped
            ]
        );
    }

    #[test]
    fn split_statements_arrive_as_one_packet_stream() {
        // The two halves of one packet sent separately still classify as
        // a single statement.
        let handle = Worker::start(0, MAX_EVENTS_DEFAULT).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server, peer) = listener.accept().unwrap();

        let decisions = Arc::new(Mutex::new(Vec::new()));
        let handler = ClassifyingHandler {
            classifier: QueryClassifier::new(),
            buffer: BytesMut::new(),
            decisions: Arc::clone(&decisions),
        };

        let (tx, rx) = mpsc::channel();
        handle.execute(
            ExecuteMode::Queued,
            Box::new(move |worker| {
                let dcb =
                    Dcb::new(server, peer.to_string(), Role::Client, Box::new(handler)).unwrap();
                tx.send(worker.add_dcb(dcb).is_ok()).unwrap();
            }),
            None,
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        let packet = RequestPacket::com_query("SELECT a FROM t");
        let raw = packet.as_bytes();
        client.write_all(&raw[..7]).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        client.write_all(&raw[7..]).unwrap();

        let mut ack = [0u8; OK_PACKET.len()];
        client.read_exact(&mut ack).unwrap();

        let collected = decisions.lock().unwrap().clone();
        assert_eq!(collected, vec![RouteTarget::SLAVE]);
    }
}
