//! First-keyword statement sniffer. The routing core does not execute SQL
//! and does not need a full parser: it needs the read/write nature of a
//! statement, temporary-table effects, and the tables a read touches so
//! temporary-table reads can be pinned to the master. Statements the
//! sniffer does not recognize are treated as writes, which routes them to
//! the master.

use crate::scanner::Scanner;
use crate::types::TypeMask;

/// What the sniffer learned about one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementInfo {
    pub type_mask: TypeMask,

    /// Tables referenced by FROM/JOIN/INTO/UPDATE clauses, as written
    /// (optionally `db.table` qualified).
    pub tables: Vec<String>,

    /// Table created by CREATE TEMPORARY TABLE.
    pub created_tmp_table: Option<String>,

    /// Tables dropped by DROP [TEMPORARY] TABLE.
    pub dropped_tables: Vec<String>,

    /// LOAD DATA LOCAL INFILE: the following packets are raw file data.
    pub is_load_data_local: bool,

    /// PREPARE name FROM '...': named statement and its text.
    pub text_prepare: Option<(String, String)>,

    /// EXECUTE name / DEALLOCATE PREPARE name.
    pub text_execute: Option<String>,
    pub text_deallocate: Option<String>,
}

pub fn classify_statement(sql: &[u8]) -> StatementInfo {
    let mut info = StatementInfo::default();
    let mut scanner = Scanner::new(sql);
    skip_leading_comments(&mut scanner);

    if scanner.expect_keyword(b"SELECT") {
        info.type_mask |= TypeMask::READ;
        collect_tables(&mut scanner, &mut info.tables);
        if statement_contains(sql, &[b"FOR", b"UPDATE"]) {
            info.type_mask |= TypeMask::WRITE;
        }
    } else if scanner.expect_keyword(b"SHOW")
        || scanner.expect_keyword(b"EXPLAIN")
        || scanner.expect_keyword(b"DESCRIBE")
        || scanner.expect_keyword(b"DESC")
        || scanner.expect_keyword(b"HELP")
    {
        info.type_mask |= TypeMask::READ;
    } else if scanner.expect_keyword(b"INSERT") || scanner.expect_keyword(b"REPLACE") {
        info.type_mask |= TypeMask::WRITE;
        collect_tables(&mut scanner, &mut info.tables);
    } else if scanner.expect_keyword(b"UPDATE") {
        info.type_mask |= TypeMask::WRITE;
        // The updated table comes right after the verb; joined tables are
        // picked up by the clause scan.
        scanner.bypass_whitespace();
        let _ = scanner.expect_keyword(b"LOW_PRIORITY");
        scanner.bypass_whitespace();
        let _ = scanner.expect_keyword(b"IGNORE");
        if let Some(name) = scanner.read_identifier() {
            info.tables.push(String::from_utf8_lossy(name).into_owned());
        }
        collect_tables(&mut scanner, &mut info.tables);
    } else if scanner.expect_keyword(b"DELETE") {
        info.type_mask |= TypeMask::WRITE;
        collect_tables(&mut scanner, &mut info.tables);
    } else if scanner.expect_keyword(b"CREATE") {
        info.type_mask |= TypeMask::WRITE;
        parse_create(&mut scanner, &mut info);
    } else if scanner.expect_keyword(b"DROP") {
        info.type_mask |= TypeMask::WRITE;
        parse_drop(&mut scanner, &mut info);
    } else if scanner.expect_keyword(b"LOAD") {
        info.type_mask |= TypeMask::WRITE;
        let mut rest = scanner.clone();
        rest.bypass_whitespace();
        if rest.expect_keyword(b"DATA") {
            rest.bypass_whitespace();
            info.is_load_data_local = rest.expect_keyword(b"LOCAL");
        }
    } else if scanner.expect_keyword(b"PREPARE") {
        // PREPARE name FROM 'statement text'
        if let Some((name, text)) = parse_text_prepare(&mut scanner) {
            info.text_prepare = Some((name, text));
        }
        info.type_mask |= TypeMask::WRITE;
    } else if scanner.expect_keyword(b"EXECUTE") {
        if let Some(name) = scanner.read_identifier() {
            info.text_execute = Some(String::from_utf8_lossy(name).into_owned());
        }
    } else if scanner.expect_keyword(b"DEALLOCATE") {
        scanner.bypass_whitespace();
        let _ = scanner.expect_keyword(b"PREPARE");
        if let Some(name) = scanner.read_identifier() {
            info.text_deallocate = Some(String::from_utf8_lossy(name).into_owned());
        }
    } else if scanner.expect_keyword(b"CALL") {
        // A procedure may do anything; route like a write but keep the
        // read bit so a read-only transaction is not silently poisoned.
        info.type_mask |= TypeMask::READ | TypeMask::WRITE;
    } else if scanner.expect_keyword(b"SET")
        || scanner.expect_keyword(b"BEGIN")
        || scanner.expect_keyword(b"COMMIT")
        || scanner.expect_keyword(b"ROLLBACK")
        || scanner.expect_keyword(b"START")
        || scanner.expect_keyword(b"XA")
        || scanner.expect_keyword(b"USE")
    {
        // Transaction control and session scoping carry no read/write
        // nature of their own.
    } else {
        // ALTER, TRUNCATE, GRANT, RENAME, OPTIMIZE, unknown verbs:
        // anything unrecognized is assumed to modify data.
        info.type_mask |= TypeMask::WRITE;
    }

    info
}

/// Hint comments regularly precede the statement verb; the verb decides
/// the classification, so the comments are stepped over first.
fn skip_leading_comments(scanner: &mut Scanner<'_>) {
    loop {
        scanner.bypass_whitespace();
        let rest = scanner.remaining();

        if rest.starts_with(b"/*") {
            match rest[2..].windows(2).position(|w| w == b"*/") {
                Some(pos) => scanner.advance(2 + pos + 2),
                None => {
                    scanner.advance(rest.len());
                    return;
                }
            }
        } else if rest.starts_with(b"-- ") || rest.starts_with(b"#") {
            match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => scanner.advance(pos + 1),
                None => {
                    scanner.advance(rest.len());
                    return;
                }
            }
        } else {
            return;
        }
    }
}

/// Collect table references following FROM, JOIN, INTO and UPDATE
/// keywords. Subqueries and aliases add noise, never false negatives for
/// the names that do appear.
fn collect_tables(scanner: &mut Scanner<'_>, tables: &mut Vec<String>) {
    loop {
        scanner.bypass_whitespace();
        if scanner.exhausted() {
            break;
        }

        let at_ref = scanner.expect_keyword(b"FROM")
            || scanner.expect_keyword(b"JOIN")
            || scanner.expect_keyword(b"INTO");

        if at_ref {
            // One or more comma-separated references.
            loop {
                scanner.bypass_whitespace();
                match scanner.read_identifier() {
                    Some(name) => {
                        let name = String::from_utf8_lossy(name).into_owned();
                        if !tables.contains(&name) {
                            tables.push(name);
                        }
                    }
                    None => break,
                }

                scanner.bypass_whitespace();
                if scanner.peek() == Some(b',') {
                    scanner.advance(1);
                } else {
                    break;
                }
            }
        } else if scanner.read_identifier().is_none() {
            // Punctuation, literals, operators: skip a byte and rescan.
            scanner.advance(1);
        }
    }
}

fn parse_create(scanner: &mut Scanner<'_>, info: &mut StatementInfo) {
    scanner.bypass_whitespace();
    let temporary = scanner.expect_keyword(b"TEMPORARY");

    scanner.bypass_whitespace();
    if !scanner.expect_keyword(b"TABLE") {
        return;
    }

    scanner.bypass_whitespace();
    if scanner.expect_keyword(b"IF") {
        scanner.bypass_whitespace();
        let _ = scanner.expect_keyword(b"NOT");
        scanner.bypass_whitespace();
        let _ = scanner.expect_keyword(b"EXISTS");
    }

    if let Some(name) = scanner.read_identifier() {
        if temporary {
            info.type_mask |= TypeMask::CREATE_TMP_TABLE;
            info.created_tmp_table = Some(String::from_utf8_lossy(name).into_owned());
        }
    }
}

fn parse_drop(scanner: &mut Scanner<'_>, info: &mut StatementInfo) {
    scanner.bypass_whitespace();
    let _ = scanner.expect_keyword(b"TEMPORARY");

    scanner.bypass_whitespace();
    if !scanner.expect_keyword(b"TABLE") {
        return;
    }

    scanner.bypass_whitespace();
    if scanner.expect_keyword(b"IF") {
        scanner.bypass_whitespace();
        let _ = scanner.expect_keyword(b"EXISTS");
    }

    loop {
        match scanner.read_identifier() {
            Some(name) => {
                info.dropped_tables
                    .push(String::from_utf8_lossy(name).into_owned());
            }
            None => break,
        }

        scanner.bypass_whitespace();
        if scanner.peek() == Some(b',') {
            scanner.advance(1);
        } else {
            break;
        }
    }
}

fn parse_text_prepare(scanner: &mut Scanner<'_>) -> Option<(String, String)> {
    let name = scanner.read_identifier()?;
    let name = String::from_utf8_lossy(name).into_owned();

    scanner.bypass_whitespace();
    if !scanner.expect_keyword(b"FROM") {
        return None;
    }

    scanner.bypass_whitespace();
    let quote = scanner.peek()?;
    if quote != b'\'' && quote != b'"' {
        return None;
    }
    scanner.advance(1);

    let rest = scanner.remaining();
    let end = rest.iter().position(|b| *b == quote)?;
    let text = String::from_utf8_lossy(&rest[..end]).into_owned();
    Some((name, text))
}

/// Whether the keywords appear in sequence somewhere in the statement,
/// outside of any containment checks; used for SELECT ... FOR UPDATE.
fn statement_contains(sql: &[u8], words: &[&[u8]]) -> bool {
    let mut scanner = Scanner::new(sql);

    'outer: while !scanner.exhausted() {
        scanner.bypass_whitespace();

        let mut attempt = scanner.clone();
        for word in words {
            attempt.bypass_whitespace();
            if !attempt.expect_keyword(word) {
                if scanner.read_identifier().is_none() {
                    scanner.advance(1);
                }
                continue 'outer;
            }
        }
        return true;
    }

    false
}
