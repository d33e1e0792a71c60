use bitflags::bitflags;

use protocol::reply::Reply;

use crate::types::TypeMask;

bitflags! {
    /// State of the explicitly started transaction of a session.
    ///
    /// STARTING and ENDING are transient decorations of ACTIVE: STARTING
    /// covers the statement that opened the transaction, ENDING the one
    /// that closes it. They are never both set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrxState: u8 {
        const ACTIVE = 1 << 0;
        const READ_ONLY = 1 << 1;
        const ENDING = 1 << 2;
        const STARTING = 1 << 3;
    }
}

impl TrxState {
    pub const INACTIVE: TrxState = TrxState::empty();
}

/// Per-session transaction state machine fed with the type mask of every
/// statement and corrected from server replies.
///
/// The state tells only the state of explicitly started transactions: with
/// autocommit off there is always an implicit transaction, which this
/// reports as a synthetic ACTIVE|STARTING state entered on the statement
/// after the one that disabled autocommit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrxTracker {
    trx_state: TrxState,

    /// The last value "set autocommit=..." assigned, not whether an open
    /// transaction has implicitly suspended autocommit. On by default.
    autocommit: bool,

    /// Sticky access mode from SET SESSION TRANSACTION; either READ_ONLY
    /// or empty. Folded into every transaction this session starts.
    default_trx_mode: TrxState,
}

impl Default for TrxTracker {
    fn default() -> Self {
        TrxTracker {
            trx_state: TrxState::INACTIVE,
            autocommit: true,
            default_trx_mode: TrxState::INACTIVE,
        }
    }
}

impl TrxTracker {
    pub fn new() -> Self {
        TrxTracker::default()
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn is_trx_active(&self) -> bool {
        self.trx_state.contains(TrxState::ACTIVE)
    }

    pub fn is_trx_read_only(&self) -> bool {
        self.trx_state.contains(TrxState::READ_ONLY)
    }

    pub fn is_trx_ending(&self) -> bool {
        self.trx_state.contains(TrxState::ENDING)
    }

    pub fn is_trx_starting(&self) -> bool {
        self.trx_state.contains(TrxState::STARTING)
    }

    pub fn state(&self) -> TrxState {
        self.trx_state
    }

    pub fn set_autocommit(&mut self, value: bool) {
        self.autocommit = value;
    }

    pub fn set_state(&mut self, state: TrxState) {
        self.trx_state = state;
    }

    /// Advance the state machine with the type mask of the statement that
    /// is about to be executed.
    pub fn track_transaction_state(&mut self, type_mask: TypeMask) {
        let trx_starting_active = TrxState::ACTIVE | TrxState::STARTING;

        debug_assert!(
            !self
                .trx_state
                .contains(TrxState::STARTING | TrxState::ENDING),
            "STARTING and ENDING are mutually exclusive"
        );

        if self.trx_state.contains(TrxState::ENDING) {
            if self.autocommit {
                // Transaction ended, go into inactive state.
                self.trx_state = TrxState::INACTIVE;
            } else {
                // Without autocommit the end of a transaction starts a new
                // one.
                self.trx_state = trx_starting_active | self.default_trx_mode;
            }
        } else if self.trx_state.contains(TrxState::STARTING) {
            self.trx_state.remove(TrxState::STARTING);
        } else if !self.autocommit && self.trx_state == TrxState::INACTIVE {
            // This state is entered when autocommit was disabled.
            self.trx_state = trx_starting_active | self.default_trx_mode;
        }

        if type_mask.contains(TypeMask::BEGIN_TRX) {
            if type_mask.contains(TypeMask::DISABLE_AUTOCOMMIT) {
                // This disables autocommit and the next statement starts a
                // new transaction.
                self.autocommit = false;
                self.trx_state = TrxState::INACTIVE;
            } else {
                let mut new_state = trx_starting_active | self.default_trx_mode;

                if type_mask.contains(TypeMask::READ) {
                    new_state |= TrxState::READ_ONLY;
                } else if type_mask.contains(TypeMask::WRITE) {
                    new_state.remove(TrxState::READ_ONLY);
                }
                self.trx_state = new_state;
            }
        } else if type_mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            // A commit never starts a new transaction. That would happen
            // with: SET AUTOCOMMIT=0; COMMIT;
            let mut new_state = self.trx_state | TrxState::ENDING;
            new_state.remove(TrxState::STARTING);
            self.trx_state = new_state;

            if type_mask.contains(TypeMask::ENABLE_AUTOCOMMIT) {
                self.autocommit = true;
            }
        } else if type_mask.intersects(TypeMask::READWRITE | TypeMask::READONLY) {
            if !type_mask.contains(TypeMask::NEXT_TRX) {
                // All future transactions will use this access mode.
                self.default_trx_mode = if type_mask.contains(TypeMask::READONLY) {
                    TrxState::READ_ONLY
                } else {
                    TrxState::INACTIVE
                };
            }
        }
    }

    /// Use a reply to fix the transaction state.
    ///
    /// If the state reported by the server does not match the expected
    /// one, the internal state is adjusted to match it. This happens when
    /// something hidden from the parser, e.g. a stored procedure call,
    /// opens or closes a transaction.
    pub fn fix_trx_state(&mut self, reply: &Reply) {
        if reply.server_status().is_none() {
            // A handful of response types, e.g. the one to
            // COM_STMT_PREPARE, carry no status bits.
            return;
        }

        self.autocommit = reply.autocommit();

        let in_trx = reply.in_trx();

        if !self.is_trx_active() && in_trx {
            self.trx_state = TrxState::ACTIVE | TrxState::STARTING;

            if reply.in_read_only_trx() {
                self.trx_state |= TrxState::READ_ONLY;
            }
        } else if self.is_trx_active()
            && !self.is_trx_ending()
            && !self.is_trx_starting()
            && !in_trx
        {
            self.trx_state |= TrxState::ENDING;
        }
    }
}
