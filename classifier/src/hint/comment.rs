//! Extraction of SQL comments from statement text. Quoted literals and
//! identifiers hide comment markers, a backslash escapes the following
//! byte, and a malformed quoted value silently terminates the scan.

/// Advance from `i` until an unescaped `c` is found or the end is reached.
fn skip_until(input: &[u8], mut i: usize, c: u8) -> usize {
    let end = input.len();
    while i < end {
        if input[i] == b'\\' {
            i += 1;
            if i == end {
                break;
            }
        } else if input[i] == c {
            break;
        }
        i += 1;
    }
    i
}

/// Find the next comment starting at `it`. Returns the byte range of the
/// comment body, without the comment markers; an empty range at the end
/// of input means no comment was found.
fn get_comment(input: &[u8], mut it: usize) -> (usize, usize) {
    let end = input.len();

    while it < end {
        match input[it] {
            b'\\' => {
                it += 1;
                if it == end {
                    continue;
                }
            }
            b'"' | b'\'' | b'`' => {
                // Quoted literal string or identifier.
                it = skip_until(input, it + 1, input[it]);
                if it == end {
                    // Malformed quoted value.
                    continue;
                }
            }
            b'#' => {
                // A comment that spans the rest of the line.
                it += 1;
                return (it, skip_until(input, it, b'\n'));
            }
            b'-' => {
                // Dash-dash requires the space.
                it += 1;
                if it != end && input[it] == b'-' {
                    it += 1;
                    if it != end && input[it] == b' ' {
                        it += 1;
                        return (it, skip_until(input, it, b'\n'));
                    }
                }
                continue;
            }
            b'/' => {
                it += 1;
                if it != end && input[it] == b'*' {
                    it += 1;
                    if it != end {
                        let start = it;

                        while it < end {
                            let comment_end = skip_until(input, it, b'*');
                            it = comment_end;

                            if it != end {
                                it += 1;
                                if it != end && input[it] == b'/' {
                                    return (start, comment_end);
                                }
                            }
                        }
                    }
                }
                continue;
            }
            _ => {}
        }

        it += 1;
    }

    (end, end)
}

/// All comment body ranges in a statement, in order of appearance.
pub fn get_all_comments(input: &[u8]) -> Vec<(usize, usize)> {
    let mut rval = Vec::new();
    let mut start = 0;

    loop {
        let (first, second) = get_comment(input, start);

        if first != second {
            rval.push((first, second));
        }

        start = second;
        if start >= input.len() {
            break;
        }
    }

    rval
}
