//! End-to-end routing scenarios: classification, transaction tracking and
//! hints working together the way a session uses them.

#[cfg(test)]
mod test {
    use classifier::classifier::QueryClassifier;
    use classifier::hint::Hint;
    use classifier::tracker::TrxState;
    use classifier::types::{RouteTarget, TypeMask};
    use common::log::tracing_factory::TracingFactory;
    use protocol::packet::RequestPacket;
    use protocol::reply::Reply;
    use protocol::status_flags::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};

    fn classify(qc: &mut QueryClassifier, sql: &str) -> (RouteTarget, TrxState) {
        let info = qc.update_and_commit_route_info(&RequestPacket::com_query(sql));
        (info.target(), info.trx().state())
    }

    #[test]
    fn explicit_transaction_with_commit() {
        TracingFactory::init_log(true);
        let mut qc = QueryClassifier::new();

        let (target, state) = classify(&mut qc, "BEGIN");
        assert_eq!(target, RouteTarget::MASTER);
        assert_eq!(state, TrxState::ACTIVE | TrxState::STARTING);

        // The transaction has not proven itself read-write yet; reads may
        // still use a slave.
        let (target, state) = classify(&mut qc, "SELECT 1");
        assert_eq!(target, RouteTarget::SLAVE);
        assert_eq!(state, TrxState::ACTIVE);

        let (target, state) = classify(&mut qc, "INSERT INTO t VALUES(1)");
        assert_eq!(target, RouteTarget::MASTER);
        assert_eq!(state, TrxState::ACTIVE);
        assert!(!qc.current_route_info().is_trx_still_read_only());

        let (target, state) = classify(&mut qc, "COMMIT");
        assert_eq!(target, RouteTarget::MASTER);
        assert_eq!(state, TrxState::ACTIVE | TrxState::ENDING);

        let (_, state) = classify(&mut qc, "SELECT 1");
        assert_eq!(state, TrxState::INACTIVE);
    }

    #[test]
    fn read_only_transaction_is_slave_eligible() {
        let mut qc = QueryClassifier::new();

        let (target, state) = classify(&mut qc, "START TRANSACTION READ ONLY");
        assert_eq!(target, RouteTarget::MASTER);
        assert!(state.contains(TrxState::ACTIVE | TrxState::READ_ONLY));

        let (target, _) = classify(&mut qc, "SELECT a FROM t");
        assert_eq!(target, RouteTarget::SLAVE);

        let (target, _) = classify(&mut qc, "COMMIT");
        assert_eq!(target, RouteTarget::MASTER);

        let (_, state) = classify(&mut qc, "SELECT 1");
        assert_eq!(state, TrxState::INACTIVE);
        assert!(qc.current_route_info().trx().is_autocommit());
    }

    #[test]
    fn disabled_autocommit_opens_implicit_transactions() {
        let mut qc = QueryClassifier::new();

        let info = qc.update_and_commit_route_info(&RequestPacket::com_query("SET AUTOCOMMIT=0"));
        assert_eq!(
            info.type_mask(),
            TypeMask::BEGIN_TRX | TypeMask::DISABLE_AUTOCOMMIT
        );
        assert_eq!(info.target(), RouteTarget::MASTER);
        assert_eq!(info.trx().state(), TrxState::INACTIVE);
        assert!(!info.trx().is_autocommit());

        let (target, state) = classify(&mut qc, "SELECT 1");
        assert_eq!(target, RouteTarget::SLAVE);
        assert_eq!(state, TrxState::ACTIVE | TrxState::STARTING);

        let (target, state) = classify(&mut qc, "SELECT 2");
        assert_eq!(target, RouteTarget::SLAVE);
        assert_eq!(state, TrxState::ACTIVE);
    }

    #[test]
    fn hint_overrides_default_read_routing() {
        let mut qc = QueryClassifier::new();

        let info = qc.update_and_commit_route_info(&RequestPacket::com_query(
            "/* maxscale route to master */ SELECT 1",
        ));
        assert_eq!(info.target(), RouteTarget::MASTER);
        assert_eq!(info.hints(), &[Hint::RouteToMaster]);

        // Without the hint the same statement is slave-eligible.
        let (target, _) = classify(&mut qc, "SELECT 1");
        assert_eq!(target, RouteTarget::SLAVE);
    }

    #[test]
    fn stacked_named_hint_covers_following_statements() {
        let mut qc = QueryClassifier::new();

        // Registers `myh` without routing anything.
        let info = qc.update_and_commit_route_info(&RequestPacket::com_query(
            "-- maxscale myh prepare route to server srv1",
        ));
        assert!(info.hints().is_empty());

        // Pushes `myh` on the stack and applies it.
        let info = qc
            .update_and_commit_route_info(&RequestPacket::com_query("-- maxscale myh start"));
        assert_eq!(info.hints(), &[Hint::named_server("srv1")]);

        // A plain statement inherits the top of the stack.
        let info = qc.update_and_commit_route_info(&RequestPacket::com_query("SELECT 1"));
        assert_eq!(info.hints(), &[Hint::named_server("srv1")]);
        assert_eq!(info.target(), RouteTarget::NAMED_SERVER);

        // Pops the stack.
        let info =
            qc.update_and_commit_route_info(&RequestPacket::com_query("-- maxscale end"));
        assert!(info.hints().is_empty());

        // Nothing applies anymore.
        let info = qc.update_and_commit_route_info(&RequestPacket::com_query("SELECT 2"));
        assert!(info.hints().is_empty());
        assert_eq!(info.target(), RouteTarget::SLAVE);
    }

    #[test]
    fn update_and_revert_leave_state_untouched() {
        let mut qc = QueryClassifier::new();
        classify(&mut qc, "BEGIN");
        classify(&mut qc, "SELECT 1");

        let info_before = qc.current_route_info().clone();

        qc.update_route_info(&RequestPacket::com_query("COMMIT"));
        qc.revert_update();

        let info_after = qc.current_route_info();
        assert_eq!(info_after, &info_before);
        assert_eq!(info_after.trx().state(), info_before.trx().state());
        assert_eq!(info_after.target(), info_before.target());
        assert_eq!(info_after.type_mask(), info_before.type_mask());
    }

    #[test]
    fn reply_status_corrects_hidden_transaction() {
        let mut qc = QueryClassifier::new();

        // A stored procedure opened a transaction the parser could not
        // see; the reply status bits bring the tracker back in sync.
        classify(&mut qc, "CALL make_trx()");
        assert!(!qc.current_route_info().trx().is_trx_active());

        qc.update_from_reply(&Reply::with_status(SERVER_STATUS_IN_TRANS));
        assert!(qc.current_route_info().trx().is_trx_active());

        // And the close on the other side.
        classify(&mut qc, "CALL end_trx()");
        qc.update_from_reply(&Reply::with_status(SERVER_STATUS_AUTOCOMMIT));
        assert!(qc.current_route_info().trx().is_trx_ending());
    }

    #[test]
    fn rejected_statements_have_empty_masks() {
        use classifier::trx_boundary::TrxBoundaryParser;

        for sql in [
            "SELECT 1",
            "BEGIN WORK please",
            "START TRANSACTION READ",
            "SET AUTOCOMMIT=2",
            "XA RECOVER",
            "commit extra garbage",
        ] {
            assert_eq!(
                TrxBoundaryParser::type_mask_of(sql.as_bytes()),
                TypeMask::empty(),
                "{}",
                sql
            );
        }
    }

    #[test]
    fn inverse_statement_pairs_round_trip() {
        for (stmt, inverse) in [
            ("BEGIN", "COMMIT"),
            ("SET AUTOCOMMIT=0", "SET AUTOCOMMIT=1"),
            ("START TRANSACTION READ ONLY", "ROLLBACK"),
        ] {
            let mut qc = QueryClassifier::new();
            let initial = qc.current_route_info().trx().clone();

            classify(&mut qc, stmt);
            classify(&mut qc, inverse);
            // One more statement to drain the transient ENDING state.
            classify(&mut qc, "SELECT 1");

            assert_eq!(
                qc.current_route_info().trx(),
                &initial,
                "{} / {}",
                stmt,
                inverse
            );
        }
    }
}
