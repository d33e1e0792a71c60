use bitflags::bitflags;

bitflags! {
    /// Statement-semantic flags produced by the parsers. An empty mask is
    /// a statement that affects neither transaction state nor autocommit
    /// mode and whose nature could not be established.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        /// A read, e.g. a SELECT, or the READ ONLY access mode.
        const READ = 1 << 0;
        /// A write, e.g. an INSERT, or the READ WRITE access mode.
        const WRITE = 1 << 1;
        const BEGIN_TRX = 1 << 3;
        const COMMIT = 1 << 4;
        const ROLLBACK = 1 << 5;
        const ENABLE_AUTOCOMMIT = 1 << 6;
        const DISABLE_AUTOCOMMIT = 1 << 7;
        /// SET TRANSACTION READ ONLY; scopes transactions, not statements.
        const READONLY = 1 << 8;
        /// SET TRANSACTION READ WRITE.
        const READWRITE = 1 << 9;
        /// The SET TRANSACTION statement lacked an explicit SESSION scope
        /// and therefore applies to the next transaction only.
        const NEXT_TRX = 1 << 10;
        const CREATE_TMP_TABLE = 1 << 11;
    }
}

bitflags! {
    /// Where a statement may be routed. A router picks one backend out of
    /// the allowed set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RouteTarget: u8 {
        const MASTER = 0x01;
        const SLAVE = 0x02;
        const NAMED_SERVER = 0x04;
        const ALL = 0x08;
        /// Restrict slave candidates by replication lag.
        const RLAG_MAX = 0x10;
        const LAST_USED = 0x20;
    }
}

impl RouteTarget {
    pub const UNDEFINED: RouteTarget = RouteTarget::empty();

    pub fn is_master(self) -> bool {
        self.contains(RouteTarget::MASTER)
    }

    pub fn is_slave(self) -> bool {
        self.contains(RouteTarget::SLAVE)
    }

    pub fn is_named_server(self) -> bool {
        self.contains(RouteTarget::NAMED_SERVER)
    }

    pub fn is_all_target(self) -> bool {
        self.contains(RouteTarget::ALL)
    }

    pub fn is_last_used(self) -> bool {
        self.contains(RouteTarget::LAST_USED)
    }
}

impl TypeMask {
    /// True when the mask describes a statement that only reads data.
    pub fn is_read_only(self) -> bool {
        self.contains(TypeMask::READ) && !self.contains(TypeMask::WRITE)
    }

    /// Statements that open, close or re-scope a transaction.
    pub fn affects_transaction(self) -> bool {
        self.intersects(
            TypeMask::BEGIN_TRX
                | TypeMask::COMMIT
                | TypeMask::ROLLBACK
                | TypeMask::ENABLE_AUTOCOMMIT
                | TypeMask::DISABLE_AUTOCOMMIT,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_only_excludes_writes() {
        assert!(TypeMask::READ.is_read_only());
        assert!(!(TypeMask::READ | TypeMask::WRITE).is_read_only());
        assert!(!TypeMask::empty().is_read_only());
    }

    #[test]
    fn transaction_boundaries() {
        assert!((TypeMask::BEGIN_TRX | TypeMask::READ).affects_transaction());
        assert!((TypeMask::COMMIT | TypeMask::ENABLE_AUTOCOMMIT).affects_transaction());
        assert!(!TypeMask::READ.affects_transaction());
    }

    #[test]
    fn target_helpers() {
        let target = RouteTarget::SLAVE | RouteTarget::RLAG_MAX;
        assert!(target.is_slave());
        assert!(!target.is_master());
        assert!(target.contains(RouteTarget::RLAG_MAX));

        assert!(RouteTarget::ALL.is_all_target());
        assert!(RouteTarget::LAST_USED.is_last_used());
        assert!(RouteTarget::NAMED_SERVER.is_named_server());
        assert!(RouteTarget::UNDEFINED.is_empty());
    }
}
