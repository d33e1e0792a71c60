use num_enum::{IntoPrimitive, TryFromPrimitive};

/// MYSQL 命令
///
/// The first payload byte of every client packet outside the handshake.
///
/// type def ref: https://dev.mysql.com/doc/internals/en/com-query.html
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Sleep = 0,
    Quit = 1,
    InitDb = 2,
    Query = 3,
    FieldList = 4,
    CreateDb = 5,
    DropDb = 6,
    Refresh = 7,
    Shutdown = 8,
    Statistics = 9,
    ProcessInfo = 10,
    Connect = 11,
    ProcessKill = 12,
    Debug = 13,
    Ping = 14,
    Time = 15,
    DelayedInsert = 16,
    ChangeUser = 17,
    BinlogDump = 18,
    TableDump = 19,
    ConnectOut = 20,
    RegisterSlave = 21,
    StmtPrepare = 22,
    StmtExecute = 23,
    StmtSendLongData = 24,
    StmtClose = 25,
    StmtReset = 26,
    SetOption = 27,
    StmtFetch = 28,
    Daemon = 29,
}

impl Command {
    /// Binary-protocol commands that carry a statement id in their payload.
    pub fn is_ps_command(self) -> bool {
        matches!(
            self,
            Command::StmtExecute
                | Command::StmtSendLongData
                | Command::StmtClose
                | Command::StmtReset
                | Command::StmtFetch
        )
    }

    /// Commands whose reply continues a previously executed statement.
    pub fn is_ps_continuation(self) -> bool {
        matches!(self, Command::StmtFetch)
    }
}

#[cfg(test)]
mod test {
    use super::Command;

    #[test]
    fn byte_round_trip() {
        assert_eq!(u8::from(Command::Query), 3);
        assert_eq!(Command::try_from(22u8).unwrap(), Command::StmtPrepare);
        assert!(Command::try_from(0x80u8).is_err());
    }

    #[test]
    fn ps_command_set() {
        assert!(Command::StmtExecute.is_ps_command());
        assert!(Command::StmtFetch.is_ps_command());
        assert!(!Command::StmtPrepare.is_ps_command());
        assert!(!Command::Query.is_ps_command());
    }
}
