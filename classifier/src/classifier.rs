//! Session-level query classification. Combines the transaction tracker,
//! the temporary-table set, the prepared-statement table and the routing
//! hints into a [`RouteInfo`] for every request packet.
//!
//! Updates are optimistic: [`QueryClassifier::update_route_info`] stages
//! changes to prepared-statement and temporary-table state, and the caller
//! either confirms with [`QueryClassifier::commit_route_info_update`] once
//! the request was dispatched or rolls back with
//! [`QueryClassifier::revert_update`]. An aborted routing attempt
//! therefore never poisons session state.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use protocol::command::Command;
use protocol::packet::RequestPacket;
use protocol::reply::Reply;
use protocol::STMT_ID_PREVIOUS;

use crate::hint::{Hint, HintParser};
use crate::route_info::RouteInfo;
use crate::statement::classify_statement;
use crate::trx_boundary::TrxBoundaryParser;
use crate::types::{RouteTarget, TypeMask};

#[derive(Debug, Clone)]
struct PsEntry {
    type_mask: TypeMask,
    param_count: u16,
    tables: Vec<String>,
    hints: Vec<Hint>,
}

/// Session-state change staged by an update and applied on commit.
#[derive(Debug, Clone)]
enum SessionOp {
    AddTmpTable(String),
    DropTables(Vec<String>),
    PsStoreBinary { id: u32, entry: PsEntry },
    PsStoreText { name: String, entry: PsEntry },
    PsEraseBinary(u32),
    PsEraseText(String),
}

#[derive(Debug, Default)]
pub struct QueryClassifier {
    route_info: RouteInfo,
    /// State before the latest update, for revert and for continuation
    /// statements that reuse the previous decision.
    prev_route_info: Option<RouteInfo>,

    hint_parser: HintParser,

    /// Temporary tables created by this session, as `db.table` strings.
    tmp_tables: HashSet<String>,

    ps_binary: HashMap<u32, PsEntry>,
    ps_text: HashMap<String, PsEntry>,

    pending: Vec<SessionOp>,

    next_ps_id: u32,
    /// Latest prepared id, for COM_STMT_EXECUTE with the id -1.
    prev_ps_id: u32,

    default_db: Option<String>,

    verbose: bool,
}

impl QueryClassifier {
    pub fn new() -> Self {
        QueryClassifier {
            next_ps_id: 1,
            ..QueryClassifier::default()
        }
    }

    /// Return the current route info. A call to `update_route_info()` will
    /// change the values.
    pub fn current_route_info(&self) -> &RouteInfo {
        &self.route_info
    }

    pub fn set_default_db(&mut self, db: Option<String>) {
        self.default_db = db;
    }

    /// If true, classification decisions are logged on the debug level.
    pub fn set_verbose(&mut self, value: bool) {
        self.verbose = value;
    }

    /// The master was replaced; its temporary tables are gone with it.
    pub fn master_replaced(&mut self) {
        self.tmp_tables.clear();
    }

    pub fn have_tmp_tables(&self) -> bool {
        !self.tmp_tables.is_empty()
    }

    pub fn is_tmp_table(&self, table: &str) -> bool {
        self.tmp_tables.contains(&self.qualify(table))
    }

    /// Number of parameters of a stored binary prepared statement.
    pub fn get_param_count(&self, id: u32) -> u16 {
        self.ps_binary.get(&id).map(|e| e.param_count).unwrap_or(0)
    }

    /// Update the current route info from a request packet. The returned
    /// decision is provisional until committed.
    pub fn update_route_info(&mut self, packet: &RequestPacket) -> &RouteInfo {
        self.prev_route_info = Some(self.route_info.clone());
        self.pending.clear();

        // While a LOAD DATA LOCAL is in progress the client streams raw
        // file data; the packets have no command byte and follow the
        // statement that started the load.
        if self.route_info.load_data_active() {
            return &self.route_info;
        }

        self.route_info.set_multi_part_packet(packet.is_large());
        if self.route_info.multi_part_packet() {
            // Continuation of an oversized query: raw payload, routed
            // where the first packet went.
            return &self.route_info;
        }

        let command = packet.command();
        self.route_info.set_command(command);
        self.route_info.set_ps_continuation(false);
        self.route_info.set_stmt_id(0);
        self.route_info.set_hints(Vec::new());

        match command {
            Some(Command::Query) => self.update_from_query(packet),
            Some(Command::StmtPrepare) => self.update_from_binary_prepare(packet),
            Some(command) if command.is_ps_command() => {
                self.update_from_ps_command(command, packet)
            }
            _ => {
                // Session commands, PINGs and anything unparseable anchor
                // on the master.
                self.route_info.set_type_mask(TypeMask::empty());
                self.route_info.set_target(RouteTarget::MASTER);
            }
        }

        if self.verbose {
            self.log_decision();
        }

        &self.route_info
    }

    /// Finalize the latest update. Once the query is guaranteed to have
    /// been routed, the staged temporary-table and prepared-statement
    /// changes take effect.
    pub fn commit_route_info_update(&mut self, _packet: &RequestPacket) {
        for op in std::mem::take(&mut self.pending) {
            match op {
                SessionOp::AddTmpTable(table) => {
                    self.tmp_tables.insert(table);
                }
                SessionOp::DropTables(tables) => {
                    for table in tables {
                        self.tmp_tables.remove(&table);
                    }
                }
                SessionOp::PsStoreBinary { id, entry } => {
                    self.ps_binary.insert(id, entry);
                    self.prev_ps_id = id;
                }
                SessionOp::PsStoreText { name, entry } => {
                    self.ps_text.insert(name, entry);
                }
                SessionOp::PsEraseBinary(id) => {
                    self.ps_binary.remove(&id);
                }
                SessionOp::PsEraseText(name) => {
                    self.ps_text.remove(&name);
                }
            }
        }
    }

    /// Helper that updates and commits the route info in one go.
    pub fn update_and_commit_route_info(&mut self, packet: &RequestPacket) -> &RouteInfo {
        self.update_route_info(packet);
        self.commit_route_info_update(packet);
        &self.route_info
    }

    /// Revert the effects of the latest `update_route_info` call. Must be
    /// called at most once per update, before a commit.
    pub fn revert_update(&mut self) {
        self.pending.clear();
        if let Some(prev) = self.prev_route_info.take() {
            self.route_info = prev;
        }
    }

    /// Fold the downstream reply into the session state: LOAD DATA
    /// progress and the authoritative transaction status bits.
    pub fn update_from_reply(&mut self, reply: &Reply) {
        self.route_info.set_load_data_active(reply.is_loading_data());
        self.route_info.trx_mut().fix_trx_state(reply);
    }

    //
    // Internals
    //

    fn update_from_query(&mut self, packet: &RequestPacket) {
        let sql = packet.sql().unwrap_or(&[]);

        let trx_mask = TrxBoundaryParser::type_mask_of(sql);
        let stmt = classify_statement(sql);
        let type_mask = trx_mask | stmt.type_mask;

        self.route_info.trx_mut().track_transaction_state(trx_mask);

        // A transaction is read-only until it executes a write.
        if trx_mask.contains(TypeMask::BEGIN_TRX)
            || !self.route_info.trx().is_trx_active()
        {
            self.route_info.set_trx_still_read_only(true);
        }
        if self.route_info.trx().is_trx_active() && stmt.type_mask.contains(TypeMask::WRITE) {
            self.route_info.set_trx_still_read_only(false);
        }

        // Stage session-state effects; they apply only if the statement is
        // actually dispatched.
        if let Some(table) = &stmt.created_tmp_table {
            self.pending
                .push(SessionOp::AddTmpTable(self.qualify(table)));
        }
        if !stmt.dropped_tables.is_empty() {
            let tables = stmt.dropped_tables.iter().map(|t| self.qualify(t)).collect();
            self.pending.push(SessionOp::DropTables(tables));
        }
        if let Some((name, text)) = &stmt.text_prepare {
            let entry = self.classify_prepared_text(text.as_bytes());
            self.pending.push(SessionOp::PsStoreText {
                name: name.clone(),
                entry,
            });
        }
        if let Some(name) = &stmt.text_deallocate {
            self.pending.push(SessionOp::PsEraseText(name.clone()));
        }

        let hints = self.hint_parser.parse(sql);

        // EXECUTE of a text prepared statement routes by the stored
        // classification.
        let (route_mask, tables) = match &stmt.text_execute {
            Some(name) => match self.ps_text.get(name) {
                Some(entry) => (entry.type_mask, entry.tables.clone()),
                None => (TypeMask::empty(), Vec::new()),
            },
            None => (type_mask, stmt.tables.clone()),
        };

        let mut target = self.get_route_target(route_mask, &tables);
        process_routing_hints(&hints, &mut target);

        self.route_info.set_type_mask(route_mask);
        self.route_info.set_hints(hints);
        self.route_info.set_target(target);
        self.route_info.set_load_data_active(stmt.is_load_data_local);
    }

    fn update_from_binary_prepare(&mut self, packet: &RequestPacket) {
        let sql = packet.sql().unwrap_or(&[]);

        let entry = self.classify_prepared_text(sql);
        let hints = entry.hints.clone();
        let type_mask = entry.type_mask;

        let id = self.next_ps_id;
        self.next_ps_id = self.next_ps_id.wrapping_add(1).max(1);
        self.pending.push(SessionOp::PsStoreBinary { id, entry });

        self.route_info.set_stmt_id(id);
        self.route_info.set_type_mask(type_mask);
        self.route_info.set_hints(hints);
        // Preparation happens on the master; the router replays it on
        // slaves as they are picked.
        self.route_info.set_target(RouteTarget::MASTER);
    }

    fn update_from_ps_command(&mut self, command: Command, packet: &RequestPacket) {
        let id = match packet.stmt_id() {
            Some(STMT_ID_PREVIOUS) => self.prev_ps_id,
            Some(id) => id,
            None => 0,
        };
        self.route_info.set_stmt_id(id);

        let entry = self.ps_binary.get(&id).cloned();

        let previous_target = self
            .prev_route_info
            .as_ref()
            .map(|info| info.target())
            .unwrap_or(RouteTarget::MASTER);

        match command {
            Command::StmtClose => {
                self.pending.push(SessionOp::PsEraseBinary(id));
                // Fire-and-forget; every backend holding the statement
                // must see it.
                self.route_info.set_type_mask(TypeMask::empty());
                self.route_info.set_target(RouteTarget::ALL);
            }
            Command::StmtFetch => {
                // Always a continuation of the COM_STMT_EXECUTE that
                // opened the cursor.
                self.route_info.set_ps_continuation(true);
                self.route_info
                    .set_type_mask(entry.as_ref().map(|e| e.type_mask).unwrap_or_default());
                self.route_info.set_target(previous_target);
            }
            Command::StmtExecute => {
                let (type_mask, param_count, tables, hints) = match &entry {
                    Some(entry) => (
                        entry.type_mask,
                        entry.param_count,
                        entry.tables.clone(),
                        entry.hints.clone(),
                    ),
                    None => (TypeMask::empty(), 0, Vec::new(), Vec::new()),
                };

                // An execution that does not provide parameter metadata
                // continues the previous execution and must go to the
                // same backend.
                let continuation =
                    packet.stmt_execute_params_bound(param_count) == Some(false);
                self.route_info.set_ps_continuation(continuation);
                self.route_info.set_type_mask(type_mask);

                if continuation {
                    self.route_info.set_target(previous_target);
                } else {
                    let mut target = self.get_route_target(type_mask, &tables);
                    process_routing_hints(&hints, &mut target);
                    self.route_info.set_hints(hints);
                    self.route_info.set_target(target);
                }
            }
            _ => {
                // COM_STMT_RESET and COM_STMT_SEND_LONG_DATA belong to the
                // statement's backend.
                self.route_info
                    .set_type_mask(entry.as_ref().map(|e| e.type_mask).unwrap_or_default());
                self.route_info.set_target(previous_target);
            }
        }
    }

    /// Classification stored for a prepared statement, reused every time
    /// the statement is executed.
    fn classify_prepared_text(&mut self, sql: &[u8]) -> PsEntry {
        let trx_mask = TrxBoundaryParser::type_mask_of(sql);
        let stmt = classify_statement(sql);

        PsEntry {
            type_mask: trx_mask | stmt.type_mask,
            param_count: count_parameters(sql),
            tables: stmt.tables,
            hints: self.hint_parser.parse(sql),
        }
    }

    fn get_route_target(&self, type_mask: TypeMask, tables: &[String]) -> RouteTarget {
        let trx = self.route_info.trx();

        // Statements that open or close a transaction anchor on the
        // master.
        if type_mask.affects_transaction() {
            return RouteTarget::MASTER;
        }

        let is_read = type_mask.is_read_only();

        let target = if trx.is_trx_active() {
            // A transaction that has not written anything may keep reading
            // from a slave; the first write pins it to the master.
            if is_read && (trx.is_trx_read_only() || self.route_info.is_trx_still_read_only()) {
                RouteTarget::SLAVE
            } else {
                RouteTarget::MASTER
            }
        } else if is_read {
            RouteTarget::SLAVE
        } else {
            RouteTarget::MASTER
        };

        // The replica does not have this session's temporary tables.
        if target == RouteTarget::SLAVE && self.reads_tmp_table(tables) {
            return RouteTarget::MASTER;
        }

        target
    }

    fn reads_tmp_table(&self, tables: &[String]) -> bool {
        !self.tmp_tables.is_empty()
            && tables
                .iter()
                .any(|table| self.tmp_tables.contains(&self.qualify(table)))
    }

    fn qualify(&self, table: &str) -> String {
        if table.contains('.') {
            table.to_string()
        } else {
            match &self.default_db {
                Some(db) => format!("{}.{}", db, table),
                None => table.to_string(),
            }
        }
    }

    fn log_decision(&self) {
        debug!(
            "stmt: command={:?} type_mask={:?} target={:?} trx_active={} autocommit={}",
            self.route_info.command(),
            self.route_info.type_mask(),
            self.route_info.target(),
            self.route_info.trx().is_trx_active(),
            self.route_info.trx().is_autocommit(),
        );
    }
}

/// Explicit routing hints override the computed target.
fn process_routing_hints(hints: &[Hint], target: &mut RouteTarget) {
    let mut hinted = RouteTarget::UNDEFINED;

    for hint in hints {
        match hint {
            Hint::RouteToMaster => {
                // Master routing is a hard override.
                hinted = RouteTarget::MASTER;
                break;
            }
            Hint::RouteToSlave => hinted |= RouteTarget::SLAVE,
            Hint::RouteToLastUsed => hinted |= RouteTarget::LAST_USED,
            Hint::RouteToNamedServer(_) => hinted |= RouteTarget::NAMED_SERVER,
            Hint::Parameter { key, .. } => {
                if key == "max_slave_replication_lag" {
                    hinted |= RouteTarget::RLAG_MAX;
                }
            }
        }
    }

    if !hinted.is_empty() {
        *target = hinted;
    }
}

/// Parameter placeholders of a statement text, skipping quoted literals.
fn count_parameters(sql: &[u8]) -> u16 {
    let mut count: u16 = 0;
    let mut i = 0;

    while i < sql.len() {
        match sql[i] {
            b'\\' => i += 1,
            b'\'' | b'"' | b'`' => {
                let quote = sql[i];
                i += 1;
                while i < sql.len() && sql[i] != quote {
                    if sql[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'?' => count = count.saturating_add(1),
            _ => {}
        }
        i += 1;
    }

    count
}
