//! Directive filter: reduces a source file to only the bytes that can
//! affect the include set.
//!
//! Pipeline: strip comments, keep only `#`-directive lines, fold escaped
//! newlines, prune directives with no effect on inclusion. The output is
//! what gets tokenized, and also what the dependency cache hashes to decide
//! whether an edit could have changed a file's dependencies.

use crate::stream::escaped_newline_len;
use crate::ScanError;
use memchr::{memchr, memchr2, memmem};

/// Runs the full filter pipeline.
pub fn filter_directives(content: &[u8]) -> Result<Vec<u8>, ScanError> {
    let no_comments = remove_comments(content)?;
    let only_directives = filter_only_directives(&no_comments);
    let folded = remove_escaped_newlines(&only_directives);
    Ok(prune_dead_directives(&folded))
}

/// Offset just past the end of the current line, treating escaped newlines
/// as line continuations.
fn next_line_head(bytes: &[u8], mut from: usize) -> usize {
    loop {
        match memchr(b'\n', &bytes[from..]) {
            None => return bytes.len(),
            Some(rel) => {
                let i = from + rel;
                let escaped = (i >= 1 && bytes[i - 1] == b'\\')
                    || (i >= 2 && bytes[i - 1] == b'\r' && bytes[i - 2] == b'\\');
                if escaped {
                    from = i + 1;
                } else {
                    return i + 1;
                }
            }
        }
    }
}

/// Skip blanks and escaped newlines.
fn skip_spaces(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() {
        let b = bytes[pos];
        if b == b' ' || b == b'\t' {
            pos += 1;
            continue;
        }
        let n = escaped_newline_len(&bytes[pos..]);
        if n > 0 {
            pos += n;
            continue;
        }
        break;
    }
    pos
}

/// Copy a string literal starting at `"`, returning the number of bytes
/// consumed. Escaped quotes do not terminate; an unterminated literal ends
/// at the next bare newline.
fn copy_string_literal(bytes: &[u8], out: &mut Vec<u8>) -> usize {
    debug_assert_eq!(bytes[0], b'"');
    let mut pos = 1;
    out.push(b'"');

    while pos < bytes.len() {
        let b = bytes[pos];
        if b == b'"' || b == b'\n' {
            // closing quote, or literal left unterminated on this line
            out.push(b);
            pos += 1;
            break;
        }
        let n = escaped_newline_len(&bytes[pos..]);
        if n > 0 {
            out.extend_from_slice(&bytes[pos..pos + n]);
            pos += n;
            continue;
        }
        if b == b'\\' && bytes.get(pos + 1) == Some(&b'"') {
            out.extend_from_slice(&bytes[pos..pos + 2]);
            pos += 2;
            continue;
        }
        out.push(b);
        pos += 1;
    }

    pos
}

/// Replace block comments with a single space and line comments with a
/// newline, preserving string-literal contents byte for byte.
pub fn remove_comments(src: &[u8]) -> Result<Vec<u8>, ScanError> {
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0;

    while pos < src.len() {
        // SIMD hop to the next byte that can start a literal or a comment
        let Some(rel) = memchr2(b'"', b'/', &src[pos..]) else {
            out.extend_from_slice(&src[pos..]);
            break;
        };
        out.extend_from_slice(&src[pos..pos + rel]);
        pos += rel;

        if src[pos] == b'"' {
            pos += copy_string_literal(&src[pos..], &mut out);
            continue;
        }

        match src.get(pos + 1) {
            Some(b'*') => {
                // block comment: find the terminating "*/"
                let mut search = pos + 2;
                let end = loop {
                    match memchr(b'/', &src[search..]) {
                        None => break None,
                        Some(rel) => {
                            let i = search + rel;
                            if i >= pos + 3 && src[i - 1] == b'*' {
                                break Some(i + 1);
                            }
                            search = i + 1;
                        }
                    }
                };
                let Some(end) = end else {
                    return Err(ScanError::UnterminatedComment);
                };
                out.push(b' ');
                pos = end;
            }
            Some(b'/') => {
                pos = next_line_head(src, pos + 2);
                out.push(b'\n');
            }
            _ => {
                out.push(b'/');
                pos += 1;
            }
        }
    }

    Ok(out)
}

/// Keep only lines whose first non-blank byte is `#`; spaces between `#`
/// and the directive name are omitted.
pub fn filter_only_directives(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < src.len() {
        pos = skip_spaces(src, pos);
        if pos < src.len() && src[pos] == b'#' {
            out.push(b'#');
            pos = skip_spaces(src, pos + 1);
            let nlh = next_line_head(src, pos);
            out.extend_from_slice(&src[pos..nlh]);
            pos = nlh;
        } else {
            pos = next_line_head(src, pos);
        }
    }

    out
}

/// Remove `\`-newline sequences.
pub fn remove_escaped_newlines(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0;

    while pos < src.len() {
        let Some(rel) = memchr(b'\\', &src[pos..]) else {
            out.extend_from_slice(&src[pos..]);
            break;
        };
        out.extend_from_slice(&src[pos..pos + rel]);
        pos += rel;

        let n = escaped_newline_len(&src[pos..]);
        if n > 0 {
            pos += n;
        } else {
            out.push(b'\\');
            pos += 1;
        }
    }

    out
}

/// Drop directives that cannot change the include set: `#error` lines,
/// pragmas other than `once`, empty conditional pairs, and trailing
/// `#else`/`#elif` arms cancelled by their `#endif`.
pub fn prune_dead_directives(src: &[u8]) -> Vec<u8> {
    let mut stack: Vec<&[u8]> = Vec::new();
    let mut pos = 0;

    while pos < src.len() {
        let nlh = next_line_head(src, pos);
        let line = &src[pos..nlh];
        pos = nlh;

        if line.starts_with(b"#error") {
            continue;
        }
        if line.starts_with(b"#pragma") && memmem::find(line, b"once").is_none() {
            continue;
        }

        if line.starts_with(b"#endif") {
            while stack
                .last()
                .is_some_and(|top| top.starts_with(b"#else") || top.starts_with(b"#elif"))
            {
                stack.pop();
            }
            if stack.last().is_some_and(|top| top.starts_with(b"#if")) {
                stack.pop();
            } else {
                stack.push(line);
            }
        } else {
            stack.push(line);
        }
    }

    let mut out = Vec::with_capacity(src.len());
    for line in stack {
        out.extend_from_slice(line);
    }
    out
}
