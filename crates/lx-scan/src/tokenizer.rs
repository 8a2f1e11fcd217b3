//! Preprocessing-token lexer.
//!
//! Operates on directive lines (comment-stripped, but line folding is still
//! honored inside tokens so the lexer also works on raw directive text).

use crate::stream::ByteStream;
use crate::token::{Number, Op, Token};
use crate::ScanError;
use memchr::memchr;

fn is_blank(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn is_ident_start(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphabetic()
}

fn is_ident_char(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphanumeric()
}

/// Recognized integer-constant suffixes, lowercased.
fn is_integer_suffix(suffix: &str) -> bool {
    matches!(suffix, "u" | "l" | "ll" | "ul" | "lu" | "ull" | "llu")
}

/// Skip blanks and escaped newlines.
fn skip_whitespace(stream: &mut ByteStream) {
    loop {
        match stream.peek() {
            Some(c) if is_blank(c) => stream.advance(1),
            Some(b'\\') => {
                let n = stream.escaped_newline_len();
                if n > 0 {
                    stream.advance(n);
                } else {
                    return;
                }
            }
            _ => return,
        }
    }
}

/// Lex the next token. `skip_space` collapses leading whitespace instead of
/// returning a `Space` token.
pub fn next_token(stream: &mut ByteStream, skip_space: bool) -> Result<Token, ScanError> {
    loop {
        let Some(c) = stream.get() else {
            return Ok(Token::End);
        };

        if c >= 128 {
            return Ok(Token::Punct(c));
        }

        if is_blank(c) {
            if skip_space {
                skip_whitespace(stream);
                continue;
            }
            return Ok(Token::Space);
        }

        let c1 = stream.peek();
        match c {
            b'/' => match c1 {
                Some(b'/') => {
                    skip_until_line_break(stream);
                    return Ok(Token::Newline);
                }
                Some(b'*') => {
                    stream.advance(1);
                    skip_block_comment(stream)?;
                    return Ok(Token::Space);
                }
                _ => return Ok(Token::Op(Op::Div)),
            },
            b'%' => {
                // %: and %:%: digraphs
                if c1 == Some(b':') {
                    stream.advance(1);
                    if stream.peek_at(0) == Some(b'%') && stream.peek_at(1) == Some(b':') {
                        stream.advance(2);
                        return Ok(Token::Op(Op::DoubleSharp));
                    }
                    return Ok(Token::Op(Op::Sharp));
                }
                return Ok(Token::Op(Op::Mod));
            }
            b'.' => {
                if c1.is_some_and(|c1| c1.is_ascii_digit()) {
                    return Ok(read_number(stream, c));
                }
                if c1 == Some(b'.') && stream.peek_at(1) == Some(b'.') {
                    stream.advance(2);
                    return Ok(Token::Op(Op::TripleDot));
                }
                return Ok(Token::Punct(b'.'));
            }
            b'\\' => {
                match stream.get() {
                    None => return Ok(Token::Escaped(0)),
                    Some(b'\n') => {}
                    Some(b'\r') if stream.peek() == Some(b'\n') => {
                        stream.advance(1);
                    }
                    Some(next) => return Ok(Token::Escaped(next)),
                }
                // escaped newline: fold and keep lexing
                continue;
            }
            b'"' => {
                let mut content = String::new();
                read_string_until_delimiter(stream, b'"', &mut content)?;
                return Ok(Token::Str(content));
            }
            b'\n' => return Ok(Token::Newline),
            b'\r' if c1 == Some(b'\n') => {
                stream.advance(1);
                return Ok(Token::Newline);
            }
            _ => {}
        }

        if is_ident_start(c) {
            return Ok(read_identifier(stream, c));
        }
        if c.is_ascii_digit() {
            return Ok(read_number(stream, c));
        }

        // two-character operators
        if let Some(c1) = c1 {
            let two = match (c, c1) {
                (b'=', b'=') => Some(Op::Eq),
                (b'!', b'=') => Some(Op::Ne),
                (b'>', b'=') => Some(Op::Ge),
                (b'<', b'=') => Some(Op::Le),
                (b'&', b'&') => Some(Op::LogAnd),
                (b'|', b'|') => Some(Op::LogOr),
                (b'>', b'>') => Some(Op::Shr),
                (b'<', b'<') => Some(Op::Shl),
                (b'#', b'#') => Some(Op::DoubleSharp),
                _ => None,
            };
            if let Some(op) = two {
                stream.advance(1);
                return Ok(Token::Op(op));
            }
        }

        let one = match c {
            b'*' => Some(Op::Mul),
            b'+' => Some(Op::Add),
            b'-' => Some(Op::Sub),
            b'>' => Some(Op::Gt),
            b'<' => Some(Op::Lt),
            b'&' => Some(Op::BitAnd),
            b'^' => Some(Op::BitXor),
            b'|' => Some(Op::BitOr),
            b'#' => Some(Op::Sharp),
            _ => None,
        };
        return Ok(match one {
            Some(op) => Token::Op(op),
            None => Token::Punct(c),
        });
    }
}

/// Consume an escaped newline if the cursor sits right past a `\`.
/// Returns true if one was folded away.
fn fold_after_backslash(stream: &mut ByteStream) -> bool {
    match stream.peek() {
        Some(b'\n') => {
            stream.advance(1);
            true
        }
        Some(b'\r') if stream.peek_at(1) == Some(b'\n') => {
            stream.advance(2);
            true
        }
        _ => false,
    }
}

fn read_identifier(stream: &mut ByteStream, first: u8) -> Token {
    let mut text = String::new();
    text.push(first as char);
    loop {
        match stream.get() {
            Some(c) if is_ident_char(c) => text.push(c as char),
            Some(b'\\') if fold_after_backslash(stream) => {}
            Some(_) => {
                stream.unget();
                break;
            }
            None => break,
        }
    }
    Token::Identifier(text)
}

/// Lex a preprocessing number (C pp-number grammar). The integer value is
/// recorded only while the token still looks like an integer constant with a
/// recognized suffix.
fn read_number(stream: &mut ByteStream, c0: u8) -> Token {
    let mut text = String::new();
    text.push(c0 as char);

    let mut maybe_int = c0 != b'.';
    let mut base: i64 = 10;
    let mut value: i64 = 0;

    if c0 == b'0' {
        base = 8;
        if let Some(c1) = stream.peek() {
            if c1 == b'x' || c1 == b'X' {
                stream.advance(1);
                text.push(c1 as char);
                base = 16;
            }
        }
    } else if c0.is_ascii_digit() {
        value = (c0 - b'0') as i64;
    }

    if maybe_int {
        // digits within the base
        while let Some(c) = stream.peek() {
            let lower = c.to_ascii_lowercase();
            let digit = match lower {
                b'0'..=b'9' => (lower - b'0') as i64,
                b'a'..=b'f' if base == 16 => (lower - b'a' + 10) as i64,
                _ => break,
            };
            if digit >= base {
                break;
            }
            value = value.wrapping_mul(base).wrapping_add(digit);
            text.push(c as char);
            stream.advance(1);
        }
    }

    // the rest of the pp-number: (digit | [a-zA-Z_] | . | [eEpP][+-])*
    let mut suffix = String::new();
    loop {
        let Some(c) = stream.get() else { break };
        if c == b'\\' && fold_after_backslash(stream) {
            continue;
        }
        if c.is_ascii_digit() || c == b'.' || c == b'_' {
            maybe_int = false;
            text.push(c as char);
            continue;
        }
        let lower = c.to_ascii_lowercase();
        if lower.is_ascii_lowercase() {
            if maybe_int {
                suffix.push(lower as char);
            }
            text.push(c as char);
            if lower == b'e' || lower == b'p' {
                if let Some(sign) = stream.peek() {
                    if sign == b'+' || sign == b'-' {
                        maybe_int = false;
                        text.push(sign as char);
                        stream.advance(1);
                    }
                }
            }
            continue;
        }
        stream.unget();
        break;
    }

    let value = (maybe_int && (suffix.is_empty() || is_integer_suffix(&suffix))).then_some(value);
    Token::Number(Number { text, value })
}

/// Read until an unescaped `delimiter`, appending content (with escaped
/// newlines folded) to `out`. The delimiter is consumed.
pub fn read_string_until_delimiter(
    stream: &mut ByteStream,
    delimiter: u8,
    out: &mut String,
) -> Result<(), ScanError> {
    loop {
        let Some(c) = stream.peek() else {
            return Err(ScanError::UnterminatedDelimiter(delimiter as char));
        };
        if c == delimiter {
            // backslash-escaped delimiters were consumed as pairs below, so
            // a delimiter seen here always closes
            stream.advance(1);
            return Ok(());
        }
        if c == b'\n' {
            return Err(ScanError::UnterminatedDelimiter(delimiter as char));
        }
        if c == b'\\' {
            let n = stream.escaped_newline_len();
            if n > 0 {
                stream.advance(n);
                continue;
            }
            if stream.peek_at(1) == Some(delimiter) {
                out.push('\\');
                out.push(delimiter as char);
                stream.advance(2);
                continue;
            }
        }
        out.push(c as char);
        stream.advance(1);
    }
}

/// Skip the remainder of a block comment (the `/*` is already consumed).
fn skip_block_comment(stream: &mut ByteStream) -> Result<(), ScanError> {
    let begin = stream.pos();
    let mut search = 0usize;
    loop {
        let rest = stream.rest();
        let Some(rel) = memchr(b'/', &rest[search..]) else {
            return Err(ScanError::UnterminatedComment);
        };
        let i = search + rel;
        let abs = stream.pos() + i;
        if abs > begin && rest[i - 1] == b'*' {
            stream.advance(i + 1);
            return Ok(());
        }
        search = i + 1;
    }
}

/// Skip to the start of the next line, honoring escaped newlines.
fn skip_until_line_break(stream: &mut ByteStream) {
    let mut search = 0usize;
    loop {
        let rest = stream.rest();
        let Some(rel) = memchr(b'\n', &rest[search..]) else {
            stream.advance(rest.len());
            return;
        };
        let i = search + rel;
        let escaped = (i >= 1 && rest[i - 1] == b'\\')
            || (i >= 2 && rest[i - 1] == b'\r' && rest[i - 2] == b'\\');
        if escaped {
            search = i + 1;
        } else {
            stream.advance(i + 1);
            return;
        }
    }
}
