//! Directive parser: filtered bytes → [`DirectiveList`].

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::darray::{is_trie_char, DoubleArray};
use crate::directive::{Directive, DirectiveList, IncludePath, MacroParams};
use crate::filter::filter_directives;
use crate::stream::ByteStream;
use crate::token::Token;
use crate::tokenizer::{next_token, read_string_until_delimiter};
use crate::ScanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Include = 0,
    Import,
    IncludeNext,
    Define,
    Undef,
    Ifdef,
    Ifndef,
    If,
    Else,
    Endif,
    Elif,
    Pragma,
}

fn keyword_from_id(id: u16) -> Keyword {
    match id {
        0 => Keyword::Include,
        1 => Keyword::Import,
        2 => Keyword::IncludeNext,
        3 => Keyword::Define,
        4 => Keyword::Undef,
        5 => Keyword::Ifdef,
        6 => Keyword::Ifndef,
        7 => Keyword::If,
        8 => Keyword::Else,
        9 => Keyword::Endif,
        10 => Keyword::Elif,
        11 => Keyword::Pragma,
        _ => unreachable!("unknown directive keyword id {id}"),
    }
}

fn directive_trie() -> &'static DoubleArray {
    static TRIE: OnceLock<DoubleArray> = OnceLock::new();
    TRIE.get_or_init(|| {
        DoubleArray::build(&[
            ("include", Keyword::Include as u16),
            ("import", Keyword::Import as u16),
            ("include_next", Keyword::IncludeNext as u16),
            ("define", Keyword::Define as u16),
            ("undef", Keyword::Undef as u16),
            ("ifdef", Keyword::Ifdef as u16),
            ("ifndef", Keyword::Ifndef as u16),
            ("if", Keyword::If as u16),
            ("else", Keyword::Else as u16),
            ("endif", Keyword::Endif as u16),
            ("elif", Keyword::Elif as u16),
            ("pragma", Keyword::Pragma as u16),
        ])
    })
}

/// Scan raw source bytes into a directive list.
///
/// Directive-level parse failures become [`Directive::Error`] records and
/// scanning continues; only malformed raw bytes (unterminated block comment)
/// abort the scan.
pub fn scan_directives(content: &[u8]) -> Result<DirectiveList, ScanError> {
    let filtered = filter_directives(content)?;
    Ok(parse_filtered(&filtered))
}

/// Parse already-filtered directive bytes (output of
/// [`crate::filter::filter_directives`]).
pub fn parse_filtered(filtered: &[u8]) -> DirectiveList {
    let mut directives = Vec::new();

    let mut pos = 0;
    while pos < filtered.len() {
        let line_end = match memchr::memchr(b'\n', &filtered[pos..]) {
            Some(rel) => pos + rel,
            None => filtered.len(),
        };
        let line = &filtered[pos..line_end];
        pos = line_end + 1;

        if line.first() != Some(&b'#') {
            continue;
        }

        // classify the directive name through the trie
        let mut walker = directive_trie().walker();
        let mut name_end = 1;
        let mut known = true;
        while name_end < line.len() && is_trie_char(line[name_end]) {
            if !walker.step(line[name_end]) {
                known = false;
            }
            name_end += 1;
        }
        let Some(id) = (if known { walker.value() } else { None }) else {
            // not a directive we care about (#line, #warning, ...)
            continue;
        };

        let mut stream = ByteStream::new(&line[name_end..]);
        if let Some(directive) = parse_directive(keyword_from_id(id), &mut stream) {
            directives.push(directive);
        }
    }

    DirectiveList::new(directives)
}

fn parse_directive(keyword: Keyword, stream: &mut ByteStream) -> Option<Directive> {
    match keyword {
        Keyword::Include => Some(parse_include(stream, Directive::Include)),
        Keyword::Import => Some(parse_include(stream, Directive::Import)),
        Keyword::IncludeNext => Some(parse_include(stream, Directive::IncludeNext)),
        Keyword::Define => Some(parse_define(stream)),
        Keyword::Undef => Some(parse_one_ident(stream, "#undef", Directive::Undef)),
        Keyword::Ifdef => Some(parse_one_ident(stream, "#ifdef", Directive::Ifdef)),
        Keyword::Ifndef => Some(parse_one_ident(stream, "#ifndef", Directive::Ifndef)),
        Keyword::If => Some(parse_condition(stream, "#if", Directive::If)),
        Keyword::Elif => Some(parse_condition(stream, "#elif", Directive::Elif)),
        Keyword::Else => Some(Directive::Else),
        Keyword::Endif => Some(Directive::Endif),
        Keyword::Pragma => parse_pragma(stream),
    }
}

/// Reads remaining tokens on the line. The first leading space is always
/// skipped; later spaces are kept or skipped per `skip_spaces`.
fn read_tokens(stream: &mut ByteStream, skip_spaces: bool) -> Vec<Token> {
    let mut result = Vec::new();

    let Ok(mut token) = next_token(stream, true) else {
        return result;
    };
    while token != Token::End && token != Token::Newline {
        result.push(token);
        match next_token(stream, skip_spaces) {
            Ok(t) => token = t,
            Err(_) => break,
        }
    }

    result
}

fn next_token_lossy(stream: &mut ByteStream, skip_space: bool) -> Token {
    next_token(stream, skip_space).unwrap_or(Token::End)
}

fn parse_include(
    stream: &mut ByteStream,
    ctor: impl FnOnce(IncludePath) -> Directive,
) -> Directive {
    stream.skip_blanks();
    let Some(c) = stream.get() else {
        return Directive::Error("#include expects \"filename\" or <filename>".to_string());
    };

    let delimiter = match c {
        b'<' => Some(b'>'),
        b'"' => Some(b'"'),
        _ => None,
    };
    if let Some(delimiter) = delimiter {
        let mut path = String::new();
        if let Err(e) = read_string_until_delimiter(stream, delimiter, &mut path) {
            return Directive::Error(e.to_string());
        }
        return match c {
            b'<' => ctor(IncludePath::Angle(path)),
            _ => ctor(IncludePath::Quote(path)),
        };
    }

    // neither <...> nor "..."; keep the tokens for macro expansion
    stream.unget();
    ctor(IncludePath::Tokens(read_tokens(stream, false)))
}

fn parse_define(stream: &mut ByteStream) -> Directive {
    let name = match next_token_lossy(stream, true) {
        Token::Identifier(name) => name,
        other => {
            return Directive::Error(format!(
                "invalid preprocessing macro name token: {other:?}"
            ))
        }
    };

    match next_token_lossy(stream, false) {
        Token::Punct(b'(') => read_function_macro(name, stream),
        Token::Newline | Token::End => Directive::Define {
            name,
            params: None,
            replacement: Vec::new(),
        },
        Token::Space => read_object_macro(name, stream),
        other => Directive::Error(format!("missing whitespace after macro name: {other:?}")),
    }
}

/// Collapse space runs and drop spaces adjacent to `##`.
fn trim_token_space(replacement: &mut Vec<Token>) {
    while replacement.last() == Some(&Token::Space) {
        replacement.pop();
    }
}

fn read_replacement(stream: &mut ByteStream, mut map: impl FnMut(Token) -> Token) -> Vec<Token> {
    let mut replacement: Vec<Token> = Vec::new();

    let mut token = next_token_lossy(stream, true);
    while token != Token::Newline && token != Token::End {
        let token_mapped = map(token);

        if token_mapped == Token::Space || token_mapped == Token::Op(crate::token::Op::DoubleSharp)
        {
            trim_token_space(&mut replacement);
        }

        let after_double_sharp = token_mapped == Token::Op(crate::token::Op::DoubleSharp);
        replacement.push(token_mapped);
        token = next_token_lossy(stream, after_double_sharp);
    }

    trim_token_space(&mut replacement);
    replacement
}

fn read_object_macro(name: String, stream: &mut ByteStream) -> Directive {
    let replacement = read_replacement(stream, |t| t);
    Directive::Define {
        name,
        params: None,
        replacement,
    }
}

fn read_function_macro(name: String, stream: &mut ByteStream) -> Directive {
    let mut params: HashMap<String, usize> = HashMap::new();
    let mut param_index = 0usize;
    let mut variadic = false;

    loop {
        let token = next_token_lossy(stream, true);
        match token {
            Token::Newline | Token::End => {
                return Directive::Error("missing ')' in the macro parameter list".to_string());
            }
            Token::Identifier(ident) => {
                if params.insert(ident.clone(), param_index).is_some() {
                    return Directive::Error(format!("duplicate macro parameter {ident}"));
                }
                param_index += 1;
                let next = next_token_lossy(stream, true);
                if next.is_punct(b',') {
                    continue;
                }
                if next.is_punct(b')') {
                    break;
                }
                return Directive::Error(format!(
                    "invalid preprocessing macro arg token {next:?}"
                ));
            }
            Token::Op(crate::token::Op::TripleDot) => {
                variadic = true;
                let next = next_token_lossy(stream, true);
                if !next.is_punct(b')') {
                    return Directive::Error(
                        "vararg must be the last of the macro parameter list".to_string(),
                    );
                }
                break;
            }
            t if t.is_punct(b')') => break,
            other => {
                return Directive::Error(format!(
                    "invalid preprocessing macro arg token {other:?}"
                ));
            }
        }
    }

    let param_count = params.len();
    let replacement = read_replacement(stream, |t| match t {
        Token::Identifier(ident) => {
            if let Some(&idx) = params.get(&ident) {
                Token::MacroParam(idx)
            } else if variadic && ident == "__VA_ARGS__" {
                Token::MacroParamVaArgs(param_count)
            } else {
                Token::Identifier(ident)
            }
        }
        t => t,
    });

    Directive::Define {
        name,
        params: Some(MacroParams {
            count: param_count,
            variadic,
        }),
        replacement,
    }
}

fn parse_one_ident(
    stream: &mut ByteStream,
    what: &str,
    ctor: impl FnOnce(String) -> Directive,
) -> Directive {
    match next_token_lossy(stream, true) {
        Token::Identifier(ident) => ctor(ident),
        _ => Directive::Error(format!("failed to parse {what}: ident is expected, but not")),
    }
}

fn parse_condition(
    stream: &mut ByteStream,
    what: &str,
    ctor: impl FnOnce(Vec<Token>) -> Directive,
) -> Directive {
    // all spaces are skipped when these conditions are evaluated, so skip
    // them here too
    let tokens = read_tokens(stream, true);
    if tokens.is_empty() {
        return Directive::Error(format!("failed to parse {what}: no conditions"));
    }
    ctor(tokens)
}

fn parse_pragma(stream: &mut ByteStream) -> Option<Directive> {
    match next_token_lossy(stream, true) {
        Token::Identifier(ident) if ident == "once" => Some(Directive::PragmaOnce),
        // other pragmas were pruned by the filter, but stay silent either way
        _ => None,
    }
}
