use bitflags::bitflags;

use protocol::command::Command;

use crate::hint::Hint;
use crate::tracker::TrxTracker;
use crate::types::{RouteTarget, TypeMask};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u8 {
        const LOAD_DATA_ACTIVE = 1 << 0;
        const TRX_IS_READ_ONLY = 1 << 1;
        const PS_CONTINUATION = 1 << 2;
        const MULTI_PART_PACKET = 1 << 3;
        const NEXT_MULTI_PART_PACKET = 1 << 4;
    }
}

/// The per-statement routing decision record. Updated optimistically by
/// the classifier for each request and confirmed or reverted by the
/// caller once the request has actually been dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteInfo {
    trx_tracker: TrxTracker,
    type_mask: TypeMask,
    stmt_id: u32,
    target: RouteTarget,
    command: Option<Command>,
    flags: Flags,
    hints: Vec<Hint>,
}

impl Default for RouteInfo {
    fn default() -> Self {
        RouteInfo {
            trx_tracker: TrxTracker::new(),
            type_mask: TypeMask::empty(),
            stmt_id: 0,
            target: RouteTarget::UNDEFINED,
            command: None,
            // A transaction that has not executed anything is still
            // read-only.
            flags: Flags::TRX_IS_READ_ONLY,
            hints: Vec::new(),
        }
    }
}

impl RouteInfo {
    pub fn new() -> Self {
        RouteInfo::default()
    }

    /// Get the current routing target.
    pub fn target(&self) -> RouteTarget {
        self.target
    }

    /// Get the MariaDB command of the current packet.
    pub fn command(&self) -> Option<Command> {
        self.command
    }

    /// Get the query type mask.
    pub fn type_mask(&self) -> TypeMask {
        self.type_mask
    }

    /// Get the prepared statement ID in the query.
    pub fn stmt_id(&self) -> u32 {
        self.stmt_id
    }

    /// The transaction state the decision was made against.
    pub fn trx(&self) -> &TrxTracker {
        &self.trx_tracker
    }

    pub fn hints(&self) -> &[Hint] {
        &self.hints
    }

    /// Check if this is a continuation of a previous multi-packet query.
    pub fn multi_part_packet(&self) -> bool {
        self.flags.contains(Flags::MULTI_PART_PACKET)
    }

    /// Check if the packet after this will be a continuation.
    pub fn expecting_multi_part_packet(&self) -> bool {
        self.flags.contains(Flags::NEXT_MULTI_PART_PACKET)
    }

    /// Whether a LOAD DATA LOCAL INFILE is in progress.
    pub fn load_data_active(&self) -> bool {
        self.flags.contains(Flags::LOAD_DATA_ACTIVE)
    }

    /// Check if the current transaction is still a read-only transaction,
    /// i.e. no statements that modify data have been executed in it.
    pub fn is_trx_still_read_only(&self) -> bool {
        self.flags.contains(Flags::TRX_IS_READ_ONLY)
    }

    /// Whether the current binary-protocol statement is a continuation of
    /// a previously executed statement. All COM_STMT_FETCH are; a
    /// COM_STMT_EXECUTE is when it has parameters but no metadata for
    /// them.
    pub fn is_ps_continuation(&self) -> bool {
        self.flags.contains(Flags::PS_CONTINUATION)
    }

    //
    // Setters, used by the classifier while updating the route info.
    //

    pub(crate) fn trx_mut(&mut self) -> &mut TrxTracker {
        &mut self.trx_tracker
    }

    pub(crate) fn set_command(&mut self, command: Option<Command>) {
        self.command = command;
    }

    pub(crate) fn set_target(&mut self, target: RouteTarget) {
        self.target = target;
    }

    pub(crate) fn or_target(&mut self, target: RouteTarget) {
        self.target |= target;
    }

    pub(crate) fn set_type_mask(&mut self, type_mask: TypeMask) {
        self.type_mask = type_mask;
    }

    pub(crate) fn set_stmt_id(&mut self, stmt_id: u32) {
        self.stmt_id = stmt_id;
    }

    pub(crate) fn set_hints(&mut self, hints: Vec<Hint>) {
        self.hints = hints;
    }

    /// The value returned from `multi_part_packet()` must lag one
    /// classification behind: the first packet of an oversized query
    /// reports false and the continuations report true.
    pub(crate) fn set_multi_part_packet(&mut self, multi_part_packet: bool) {
        let next = self.flags.contains(Flags::NEXT_MULTI_PART_PACKET);
        self.flags.set(Flags::MULTI_PART_PACKET, next);
        self.flags.set(Flags::NEXT_MULTI_PART_PACKET, multi_part_packet);
    }

    pub(crate) fn set_load_data_active(&mut self, active: bool) {
        self.flags.set(Flags::LOAD_DATA_ACTIVE, active);
    }

    pub(crate) fn set_trx_still_read_only(&mut self, value: bool) {
        self.flags.set(Flags::TRX_IS_READ_ONLY, value);
    }

    pub(crate) fn set_ps_continuation(&mut self, value: bool) {
        self.flags.set(Flags::PS_CONTINUATION, value);
    }
}
