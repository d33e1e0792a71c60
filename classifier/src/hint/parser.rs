//! The `maxscale` comment directive grammar. Hint errors are never fatal:
//! a comment that fails to parse simply produces no hint and the statement
//! falls through to the default routing rules.

use std::collections::HashMap;

use crate::hint::comment::get_all_comments;
use crate::hint::Hint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    Maxscale,
    Prepare,
    Start,
    Stop,
    Equal,
    Str,
    Route,
    To,
    Master,
    Slave,
    Server,
    Last,
    End,
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    tok_start: usize,
    tok_end: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a [u8]) -> Self {
        Lexer {
            input,
            pos: 0,
            tok_start: 0,
            tok_end: 0,
        }
    }

    fn next_token(&mut self) -> Tok {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }

        self.tok_start = self.pos;
        let mut tok = Tok::End;

        if self.pos < self.input.len() {
            if self.input[self.pos] == b'=' {
                self.pos += 1;
                tok = Tok::Equal;
            } else {
                while self.pos < self.input.len()
                    && !self.input[self.pos].is_ascii_whitespace()
                    && self.input[self.pos] != b'='
                {
                    self.pos += 1;
                }

                tok = match &self.input[self.tok_start..self.pos] {
                    b"begin" | b"start" => Tok::Start,
                    b"end" | b"stop" => Tok::Stop,
                    b"last" => Tok::Last,
                    b"master" => Tok::Master,
                    b"maxscale" => Tok::Maxscale,
                    b"prepare" => Tok::Prepare,
                    b"route" => Tok::Route,
                    b"server" => Tok::Server,
                    b"slave" => Tok::Slave,
                    b"to" => Tok::To,
                    _ => Tok::End,
                };
            }

            if tok == Tok::End && self.tok_start != self.pos {
                // We read a string identifier.
                tok = Tok::Str;
            }
        }

        self.tok_end = self.pos;
        tok
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.input[self.tok_start..self.tok_end]).into_owned()
    }
}

/// Parser for the hint grammar, holding the per-session hint stack and the
/// named hints registered with `prepare`.
#[derive(Debug, Default)]
pub struct HintParser {
    stack: Vec<Hint>,
    named_hints: HashMap<String, Hint>,
}

impl HintParser {
    pub fn new() -> Self {
        HintParser::default()
    }

    /// Extract the hints of one statement. When the statement has no hint
    /// of its own, the top of the hint stack applies.
    pub fn parse(&mut self, sql: &[u8]) -> Vec<Hint> {
        let mut rval = Vec::new();

        for (begin, end) in get_all_comments(sql) {
            if let Some(hint) = self.parse_one(&sql[begin..end]) {
                rval.push(hint);
            }
        }

        if rval.is_empty() {
            if let Some(top) = self.stack.last() {
                rval.push(top.clone());
            }
        }

        rval
    }

    /// Parse one comment body. Deterministic for a given comment and
    /// parser state; whitespace around tokens never matters.
    pub fn parse_one(&mut self, comment: &[u8]) -> Option<Hint> {
        let mut lexer = Lexer::new(comment);

        if lexer.next_token() != Tok::Maxscale {
            return None;
        }

        // Peek at the next token; a plain definition is re-parsed from
        // here.
        let prev_pos = lexer.pos;

        match lexer.next_token() {
            Tok::Start => match process_definition(&mut lexer) {
                Some(hint) => {
                    self.stack.push(hint.clone());
                    Some(hint)
                }
                None => None,
            },
            Tok::Stop => {
                self.stack.pop();
                None
            }
            Tok::Str => {
                let key = lexer.text();

                match lexer.next_token() {
                    Tok::Equal => {
                        if lexer.next_token() == Tok::Str {
                            // A key=value hint.
                            Some(Hint::parameter(key, lexer.text()))
                        } else {
                            None
                        }
                    }
                    Tok::Prepare => {
                        if let Some(hint) = process_definition(&mut lexer) {
                            // Preparation of a named hint.
                            self.named_hints.insert(key, hint);
                        }
                        None
                    }
                    Tok::Start => {
                        if let Some(hint) = process_definition(&mut lexer) {
                            if !self.named_hints.contains_key(&key) {
                                // New hint defined, push it on to the stack.
                                self.named_hints.insert(key, hint.clone());
                                self.stack.push(hint.clone());
                            }
                            Some(hint)
                        } else if lexer.next_token() == Tok::End {
                            // Starting an already defined named hint.
                            match self.named_hints.get(&key) {
                                Some(hint) => {
                                    self.stack.push(hint.clone());
                                    Some(hint.clone())
                                }
                                None => None,
                            }
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            }
            _ => {
                // Only a hint definition in the comment; rewind to process
                // it again.
                lexer.pos = prev_pos;
                process_definition(&mut lexer)
            }
        }
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }
}

/// Process the `route to ...` / `key=value` definition body. Unexpected
/// trailing input voids the hint.
fn process_definition(lexer: &mut Lexer<'_>) -> Option<Hint> {
    let rval = match lexer.next_token() {
        Tok::Route => {
            if lexer.next_token() != Tok::To {
                return None;
            }

            match lexer.next_token() {
                Tok::Master => Some(Hint::RouteToMaster),
                Tok::Slave => Some(Hint::RouteToSlave),
                Tok::Last => Some(Hint::RouteToLastUsed),
                Tok::Server => {
                    if lexer.next_token() == Tok::Str {
                        Some(Hint::named_server(lexer.text()))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
        Tok::Str => {
            let key = lexer.text();
            let eq = lexer.next_token();
            let val = lexer.next_token();

            if eq == Tok::Equal && val == Tok::Str {
                Some(Hint::parameter(key, lexer.text()))
            } else {
                None
            }
        }
        _ => None,
    };

    if rval.is_some() && lexer.next_token() != Tok::End {
        // Unexpected input after the definition; treat it as an error and
        // drop the hint.
        return None;
    }

    rval
}
