//! Recognizer for statements that alter transaction state or autocommit
//! mode. The grammar is deliberately closed: anything outside it, including
//! an otherwise valid statement with trailing garbage, yields an empty
//! mask and is classified by other means.
//!
//! The parser is cheap enough to construct on the stack per statement.

use tracing::trace;

use crate::scanner::{ascii_upper, is_ascii_alpha, Scanner};
use crate::types::TypeMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Autocommit,
    Begin,
    Comma,
    Commit,
    Committed,
    Consistent,
    Dot,
    End,
    Eq,
    False,
    Global,
    GlobalVar,
    Isolation,
    Level,
    One,
    Only,
    Read,
    Repeatable,
    Rollback,
    Session,
    SessionVar,
    Set,
    Serializable,
    Snapshot,
    Start,
    Transaction,
    True,
    Uncommitted,
    With,
    Work,
    Write,
    Xa,
    Zero,

    Unknown,
    Exhausted,
}

pub struct TrxBoundaryParser<'a> {
    scanner: Scanner<'a>,
}

impl<'a> TrxBoundaryParser<'a> {
    /// Return the type mask of a statement, provided the statement affects
    /// transaction state or autocommit mode, and an empty mask otherwise.
    pub fn type_mask_of(sql: &'a [u8]) -> TypeMask {
        if sql.is_empty() {
            return TypeMask::empty();
        }

        let mut parser = TrxBoundaryParser {
            scanner: Scanner::new(sql),
        };
        parser.parse()
    }

    fn parse(&mut self) -> TypeMask {
        match self.next_token() {
            Token::Begin => self.parse_begin(TypeMask::empty()),
            Token::Commit => self.parse_commit(TypeMask::empty()),
            Token::Rollback => self.parse_rollback(TypeMask::empty()),
            Token::Start => self.parse_start(TypeMask::empty()),
            Token::Set => self.parse_set(TypeMask::empty()),
            Token::Xa => self.parse_xa(TypeMask::empty()),
            _ => TypeMask::empty(),
        }
    }

    fn parse_begin(&mut self, mut type_mask: TypeMask) -> TypeMask {
        type_mask |= TypeMask::BEGIN_TRX;

        match self.next_token() {
            Token::Work => self.parse_work(type_mask),
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_commit(&mut self, mut type_mask: TypeMask) -> TypeMask {
        type_mask |= TypeMask::COMMIT;

        match self.next_token() {
            Token::Work => self.parse_work(type_mask),
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_rollback(&mut self, mut type_mask: TypeMask) -> TypeMask {
        type_mask |= TypeMask::ROLLBACK;

        match self.next_token() {
            Token::Work => self.parse_work(type_mask),
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_start(&mut self, type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Transaction => self.parse_transaction(type_mask),
            _ => self.unexpected(),
        }
    }

    fn parse_transaction(&mut self, mut type_mask: TypeMask) -> TypeMask {
        type_mask |= TypeMask::BEGIN_TRX;

        match self.next_token() {
            Token::Read => self.parse_read(type_mask),
            Token::With => self.parse_with_consistent_snapshot(type_mask),
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_read(&mut self, type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Only => self.parse_only(type_mask),
            Token::Write => self.parse_write(type_mask),
            _ => self.unexpected(),
        }
    }

    fn parse_only(&mut self, mut type_mask: TypeMask) -> TypeMask {
        type_mask |= TypeMask::READ;

        match self.next_token() {
            Token::Comma => self.parse_transaction(type_mask),
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_write(&mut self, mut type_mask: TypeMask) -> TypeMask {
        type_mask |= TypeMask::WRITE;

        match self.next_token() {
            Token::Comma => self.parse_transaction(type_mask),
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_with_consistent_snapshot(&mut self, type_mask: TypeMask) -> TypeMask {
        if self.next_token() != Token::Consistent {
            return TypeMask::empty();
        }
        if self.next_token() != Token::Snapshot {
            return TypeMask::empty();
        }

        match self.next_token() {
            Token::Comma => self.parse_transaction(type_mask),
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_work(&mut self, type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_set(&mut self, type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Autocommit => self.parse_set_autocommit(type_mask),
            Token::Session => match self.next_token() {
                Token::Autocommit => self.parse_set_autocommit(type_mask),
                Token::Transaction => self.parse_set_transaction(type_mask),
                _ => self.unexpected(),
            },
            Token::SessionVar => match self.next_token() {
                Token::Dot => match self.next_token() {
                    Token::Autocommit => self.parse_set_autocommit(type_mask),
                    _ => self.unexpected(),
                },
                _ => self.unexpected(),
            },
            // Modifications to global variables do not affect the current
            // session.
            Token::GlobalVar | Token::Global => TypeMask::empty(),
            Token::Transaction => {
                self.parse_set_transaction(type_mask | TypeMask::NEXT_TRX)
            }
            _ => self.unexpected(),
        }
    }

    fn parse_set_autocommit(&mut self, _type_mask: TypeMask) -> TypeMask {
        if self.next_token() != Token::Eq {
            return self.unexpected();
        }

        match self.next_token() {
            Token::One | Token::True => TypeMask::COMMIT | TypeMask::ENABLE_AUTOCOMMIT,
            Token::Zero | Token::False => TypeMask::BEGIN_TRX | TypeMask::DISABLE_AUTOCOMMIT,
            Token::Exhausted => TypeMask::empty(),
            _ => self.unexpected(),
        }
    }

    fn parse_set_transaction(&mut self, mut type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Read => {
                type_mask = self.parse_access_mode(type_mask);

                if self.next_token() == Token::Comma {
                    if self.next_token() == Token::Isolation && self.next_token() == Token::Level {
                        type_mask = self.parse_isolation_level(type_mask);
                    } else {
                        type_mask = TypeMask::empty();
                    }
                }
                type_mask
            }
            Token::Isolation => {
                if self.next_token() != Token::Level {
                    return TypeMask::empty();
                }

                type_mask = self.parse_isolation_level(type_mask);

                if self.next_token() == Token::Comma {
                    if self.next_token() == Token::Read {
                        type_mask = self.parse_access_mode(type_mask);
                    } else {
                        type_mask = TypeMask::empty();
                    }
                }
                type_mask
            }
            _ => self.unexpected(),
        }
    }

    fn parse_access_mode(&mut self, mut type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Write => {
                type_mask |= TypeMask::READWRITE;
                type_mask
            }
            Token::Only => {
                type_mask |= TypeMask::READONLY;
                type_mask
            }
            _ => self.unexpected(),
        }
    }

    fn parse_isolation_level(&mut self, type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Repeatable => {
                if self.next_token() == Token::Read {
                    type_mask
                } else {
                    self.unexpected()
                }
            }
            Token::Read => match self.next_token() {
                Token::Committed | Token::Uncommitted => type_mask,
                _ => self.unexpected(),
            },
            Token::Serializable => type_mask,
            _ => self.unexpected(),
        }
    }

    fn parse_xa(&mut self, mut type_mask: TypeMask) -> TypeMask {
        match self.next_token() {
            Token::Start | Token::Begin => {
                type_mask |= TypeMask::BEGIN_TRX;
                type_mask
            }
            Token::End => {
                type_mask |= TypeMask::COMMIT;
                type_mask
            }
            Token::Exhausted => type_mask,
            _ => self.unexpected(),
        }
    }

    fn unexpected(&self) -> TypeMask {
        trace!(
            "transaction tracking: unexpected token at '{}'",
            String::from_utf8_lossy(self.scanner.remaining())
        );
        TypeMask::empty()
    }

    fn next_token(&mut self) -> Token {
        let scanner = &mut self.scanner;
        scanner.bypass_whitespace();

        let Some(c) = scanner.peek() else {
            return Token::Exhausted;
        };

        if c == b';' {
            if !scanner.consume_statement_end() {
                trace!(
                    "non-space data found after semi-colon: '{}'",
                    String::from_utf8_lossy(scanner.remaining())
                );
            }
            return Token::Exhausted;
        }

        match ascii_upper(c) {
            b'@' => {
                if scanner.is_next_alpha(b'A', 2) {
                    self.expect_token(b"@@AUTOCOMMIT", Token::Autocommit)
                } else if scanner.is_next_alpha(b'S', 2) {
                    self.expect_token(b"@@SESSION", Token::SessionVar)
                } else if scanner.is_next_alpha(b'G', 2) {
                    self.expect_token(b"@@GLOBAL", Token::GlobalVar)
                } else {
                    Token::Unknown
                }
            }
            b'A' => self.expect_token(b"AUTOCOMMIT", Token::Autocommit),
            b'B' => self.expect_token(b"BEGIN", Token::Begin),
            b',' => {
                scanner.advance(1);
                Token::Comma
            }
            b'C' => {
                if scanner.is_next_alpha(b'O', 1) {
                    if scanner.is_next_alpha(b'M', 2) {
                        let token = self.expect_token(b"COMMITTED", Token::Committed);
                        if token == Token::Unknown {
                            self.expect_token(b"COMMIT", Token::Commit)
                        } else {
                            token
                        }
                    } else if scanner.is_next_alpha(b'N', 2) {
                        self.expect_token(b"CONSISTENT", Token::Consistent)
                    } else {
                        Token::Unknown
                    }
                } else {
                    Token::Unknown
                }
            }
            b'.' => {
                scanner.advance(1);
                Token::Dot
            }
            b'=' => {
                scanner.advance(1);
                Token::Eq
            }
            b'E' => self.expect_token(b"END", Token::End),
            b'F' => self.expect_token(b"FALSE", Token::False),
            b'G' => self.expect_token(b"GLOBAL", Token::Global),
            b'1' => match scanner.peek_at(1) {
                Some(next) if next.is_ascii_digit() => Token::Unknown,
                _ => {
                    scanner.advance(1);
                    Token::One
                }
            },
            b'I' => self.expect_token(b"ISOLATION", Token::Isolation),
            b'L' => self.expect_token(b"LEVEL", Token::Level),
            b'O' => {
                if scanner.is_next_alpha(b'F', 1) {
                    self.expect_token(b"OFF", Token::Zero)
                } else if scanner.is_next_alpha(b'N', 1) {
                    if scanner.is_next_alpha(b'L', 2) {
                        self.expect_token(b"ONLY", Token::Only)
                    } else {
                        self.expect_token(b"ON", Token::One)
                    }
                } else {
                    Token::Unknown
                }
            }
            b'R' => {
                if scanner.is_next_alpha(b'E', 1) {
                    if scanner.is_next_alpha(b'P', 2) {
                        self.expect_token(b"REPEATABLE", Token::Repeatable)
                    } else {
                        self.expect_token(b"READ", Token::Read)
                    }
                } else if scanner.is_next_alpha(b'O', 1) {
                    self.expect_token(b"ROLLBACK", Token::Rollback)
                } else {
                    Token::Unknown
                }
            }
            b'S' => {
                if scanner.is_next_alpha(b'E', 1) {
                    if scanner.is_next_alpha(b'S', 2) {
                        self.expect_token(b"SESSION", Token::Session)
                    } else if scanner.is_next_alpha(b'R', 2) {
                        self.expect_token(b"SERIALIZABLE", Token::Serializable)
                    } else {
                        self.expect_token(b"SET", Token::Set)
                    }
                } else if scanner.is_next_alpha(b'N', 1) {
                    self.expect_token(b"SNAPSHOT", Token::Snapshot)
                } else if scanner.is_next_alpha(b'T', 1) {
                    self.expect_token(b"START", Token::Start)
                } else {
                    Token::Unknown
                }
            }
            b'T' => {
                if scanner.is_next_alpha(b'R', 1) {
                    if scanner.is_next_alpha(b'A', 2) {
                        self.expect_token(b"TRANSACTION", Token::Transaction)
                    } else if scanner.is_next_alpha(b'U', 2) {
                        self.expect_token(b"TRUE", Token::True)
                    } else {
                        Token::Unknown
                    }
                } else {
                    Token::Unknown
                }
            }
            b'U' => self.expect_token(b"UNCOMMITTED", Token::Uncommitted),
            b'W' => {
                if scanner.is_next_alpha(b'I', 1) {
                    self.expect_token(b"WITH", Token::With)
                } else if scanner.is_next_alpha(b'O', 1) {
                    self.expect_token(b"WORK", Token::Work)
                } else if scanner.is_next_alpha(b'R', 1) {
                    self.expect_token(b"WRITE", Token::Write)
                } else {
                    Token::Unknown
                }
            }
            b'X' => self.expect_token(b"XA", Token::Xa),
            b'0' => match scanner.peek_at(1) {
                Some(next) if next.is_ascii_digit() => Token::Unknown,
                _ => {
                    scanner.advance(1);
                    Token::Zero
                }
            },
            _ => Token::Unknown,
        }
    }

    fn expect_token(&mut self, word: &[u8], token: Token) -> Token {
        // `@@`-prefixed names start with two non-letters that the keyword
        // matcher handles like any other byte.
        debug_assert!(word
            .iter()
            .all(|c| !is_ascii_alpha(*c) || ascii_upper(*c) == *c));

        if self.scanner.expect_keyword(word) {
            token
        } else {
            Token::Unknown
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mask(sql: &str) -> TypeMask {
        TrxBoundaryParser::type_mask_of(sql.as_bytes())
    }

    #[test]
    fn begin_commit_rollback() {
        assert_eq!(mask("BEGIN"), TypeMask::BEGIN_TRX);
        assert_eq!(mask("begin work"), TypeMask::BEGIN_TRX);
        assert_eq!(mask("BEGIN;"), TypeMask::BEGIN_TRX);
        assert_eq!(mask("COMMIT"), TypeMask::COMMIT);
        assert_eq!(mask("commit work ; "), TypeMask::COMMIT);
        assert_eq!(mask("ROLLBACK"), TypeMask::ROLLBACK);
        assert_eq!(mask("ROLLBACK WORK"), TypeMask::ROLLBACK);

        // Trailing garbage voids the match.
        assert_eq!(mask("BEGIN WORK NOW"), TypeMask::empty());
        assert_eq!(mask("COMMIT 1"), TypeMask::empty());
    }

    #[test]
    fn start_transaction() {
        assert_eq!(mask("START TRANSACTION"), TypeMask::BEGIN_TRX);
        assert_eq!(
            mask("START TRANSACTION READ ONLY"),
            TypeMask::BEGIN_TRX | TypeMask::READ
        );
        assert_eq!(
            mask("START TRANSACTION READ WRITE"),
            TypeMask::BEGIN_TRX | TypeMask::WRITE
        );
        assert_eq!(
            mask("START TRANSACTION WITH CONSISTENT SNAPSHOT"),
            TypeMask::BEGIN_TRX
        );
        assert_eq!(
            mask("START TRANSACTION WITH CONSISTENT SNAPSHOT, READ ONLY"),
            TypeMask::BEGIN_TRX | TypeMask::READ
        );
        assert_eq!(
            mask("START TRANSACTION READ ONLY, WITH CONSISTENT SNAPSHOT"),
            TypeMask::BEGIN_TRX | TypeMask::READ
        );

        assert_eq!(mask("START"), TypeMask::empty());
        assert_eq!(mask("START SLAVE"), TypeMask::empty());
        assert_eq!(mask("START TRANSACTION READ"), TypeMask::empty());
    }

    #[test]
    fn set_autocommit() {
        let enable = TypeMask::COMMIT | TypeMask::ENABLE_AUTOCOMMIT;
        let disable = TypeMask::BEGIN_TRX | TypeMask::DISABLE_AUTOCOMMIT;

        assert_eq!(mask("SET AUTOCOMMIT=1"), enable);
        assert_eq!(mask("SET autocommit = true"), enable);
        assert_eq!(mask("SET AUTOCOMMIT = ON"), enable);
        assert_eq!(mask("SET AUTOCOMMIT=0"), disable);
        assert_eq!(mask("SET autocommit=off"), disable);
        assert_eq!(mask("SET AUTOCOMMIT = FALSE"), disable);
        assert_eq!(mask("SET SESSION AUTOCOMMIT=0"), disable);
        assert_eq!(mask("SET @@autocommit = 1"), enable);
        assert_eq!(mask("SET @@SESSION.AUTOCOMMIT=0"), disable);

        // Multi-digit literals are not the 0/1 tokens.
        assert_eq!(mask("SET AUTOCOMMIT=11"), TypeMask::empty());
        assert_eq!(mask("SET AUTOCOMMIT=01"), TypeMask::empty());
        assert_eq!(mask("SET AUTOCOMMIT"), TypeMask::empty());
        assert_eq!(mask("SET AUTOCOMMIT = maybe"), TypeMask::empty());
    }

    #[test]
    fn set_transaction() {
        assert_eq!(
            mask("SET TRANSACTION READ ONLY"),
            TypeMask::READONLY | TypeMask::NEXT_TRX
        );
        assert_eq!(
            mask("SET TRANSACTION READ WRITE"),
            TypeMask::READWRITE | TypeMask::NEXT_TRX
        );
        assert_eq!(mask("SET SESSION TRANSACTION READ ONLY"), TypeMask::READONLY);
        // Isolation level alone changes nothing the proxy tracks.
        assert_eq!(
            mask("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            TypeMask::empty()
        );
        assert_eq!(
            mask("SET SESSION TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY"),
            TypeMask::READONLY
        );
        assert_eq!(
            mask("SET SESSION TRANSACTION READ WRITE, ISOLATION LEVEL READ COMMITTED"),
            TypeMask::READWRITE
        );
        assert_eq!(
            mask("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"),
            TypeMask::NEXT_TRX
        );

        assert_eq!(
            mask("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE WRITE"),
            TypeMask::empty()
        );
        assert_eq!(mask("SET TRANSACTION SNAPSHOT"), TypeMask::empty());
    }

    #[test]
    fn set_global_is_ignored() {
        assert_eq!(mask("SET GLOBAL AUTOCOMMIT=1"), TypeMask::empty());
        assert_eq!(mask("SET @@GLOBAL.AUTOCOMMIT=1"), TypeMask::empty());
        assert_eq!(
            mask("SET GLOBAL TRANSACTION READ ONLY"),
            TypeMask::empty()
        );
    }

    #[test]
    fn xa_transactions() {
        assert_eq!(mask("XA START 'x'"), TypeMask::BEGIN_TRX);
        assert_eq!(mask("XA BEGIN 'x'"), TypeMask::BEGIN_TRX);
        assert_eq!(mask("XA END 'x'"), TypeMask::COMMIT);
        assert_eq!(mask("XA RECOVER"), TypeMask::empty());
    }

    #[test]
    fn non_transactional_statements_yield_zero() {
        assert_eq!(mask("SELECT 1"), TypeMask::empty());
        assert_eq!(mask("INSERT INTO t VALUES (1)"), TypeMask::empty());
        assert_eq!(mask("SET @user_var = 1"), TypeMask::empty());
        assert_eq!(mask("BEGINNING"), TypeMask::empty());
        assert_eq!(mask("committed"), TypeMask::empty());
        assert_eq!(mask(""), TypeMask::empty());
        assert_eq!(mask("   "), TypeMask::empty());
    }
}
