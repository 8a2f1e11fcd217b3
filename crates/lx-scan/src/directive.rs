//! The canonical directive list.

use crate::token::{render_tokens, Token};

/// How an include names its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludePath {
    /// `<path>`
    Angle(String),
    /// `"path"`
    Quote(String),
    /// A macro-expandable token sequence, e.g. `#include MY_HEADER`
    Tokens(Vec<Token>),
}

/// Parameter shape of a function-like macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroParams {
    pub count: usize,
    pub variadic: bool,
}

/// One parsed directive. Parse failures become [`Directive::Error`] records
/// so a single bad line does not lose the rest of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Include(IncludePath),
    Import(IncludePath),
    IncludeNext(IncludePath),
    Define {
        name: String,
        /// `None` for object-like macros
        params: Option<MacroParams>,
        replacement: Vec<Token>,
    },
    Undef(String),
    If(Vec<Token>),
    Ifdef(String),
    Ifndef(String),
    Elif(Vec<Token>),
    Else,
    Endif,
    PragmaOnce,
    Error(String),
}

/// A directive plus its 1-based ordinal within the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveItem {
    pub position: usize,
    pub directive: Directive,
}

/// The ordered directives of one source file. Immutable once parsed; shared
/// by `Arc` between resolutions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectiveList {
    items: Vec<DirectiveItem>,
}

impl DirectiveList {
    pub fn new(directives: Vec<Directive>) -> Self {
        let items = directives
            .into_iter()
            .enumerate()
            .map(|(i, directive)| DirectiveItem {
                position: i + 1,
                directive,
            })
            .collect();
        Self { items }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectiveItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First parse error, if any. The resolver uses this to decide to fall
    /// back to the real compiler for canonical diagnostics.
    pub fn first_error(&self) -> Option<&str> {
        self.items.iter().find_map(|d| match &d.directive {
            Directive::Error(msg) => Some(msg.as_str()),
            _ => None,
        })
    }

    /// Renders the list back to directive lines. Scanning the rendered bytes
    /// yields an identical list (macro parameter names are synthesized, since
    /// the list never stored them).
    pub fn render(&self) -> Vec<u8> {
        let mut out = String::new();
        for item in &self.items {
            render_directive(&item.directive, &mut out);
        }
        out.into_bytes()
    }
}

fn render_include(keyword: &str, path: &IncludePath, out: &mut String) {
    out.push('#');
    out.push_str(keyword);
    out.push(' ');
    match path {
        IncludePath::Angle(p) => {
            out.push('<');
            out.push_str(p);
            out.push('>');
        }
        IncludePath::Quote(p) => {
            out.push('"');
            out.push_str(p);
            out.push('"');
        }
        IncludePath::Tokens(tokens) => out.push_str(&render_tokens(tokens)),
    }
    out.push('\n');
}

fn render_directive(directive: &Directive, out: &mut String) {
    match directive {
        Directive::Include(p) => render_include("include", p, out),
        Directive::Import(p) => render_include("import", p, out),
        Directive::IncludeNext(p) => render_include("include_next", p, out),
        Directive::Define {
            name,
            params,
            replacement,
        } => {
            out.push_str("#define ");
            out.push_str(name);
            if let Some(p) = params {
                out.push('(');
                for i in 0..p.count {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str("__p");
                    out.push_str(&i.to_string());
                }
                if p.variadic {
                    if p.count > 0 {
                        out.push_str(", ");
                    }
                    out.push_str("...");
                }
                out.push(')');
            }
            if !replacement.is_empty() {
                out.push(' ');
                out.push_str(&render_tokens(replacement));
            }
            out.push('\n');
        }
        Directive::Undef(name) => {
            out.push_str("#undef ");
            out.push_str(name);
            out.push('\n');
        }
        Directive::If(tokens) => {
            out.push_str("#if ");
            out.push_str(&render_tokens(tokens));
            out.push('\n');
        }
        Directive::Ifdef(name) => {
            out.push_str("#ifdef ");
            out.push_str(name);
            out.push('\n');
        }
        Directive::Ifndef(name) => {
            out.push_str("#ifndef ");
            out.push_str(name);
            out.push('\n');
        }
        Directive::Elif(tokens) => {
            out.push_str("#elif ");
            out.push_str(&render_tokens(tokens));
            out.push('\n');
        }
        Directive::Else => out.push_str("#else\n"),
        Directive::Endif => out.push_str("#endif\n"),
        Directive::PragmaOnce => out.push_str("#pragma once\n"),
        // parse errors have no source rendering
        Directive::Error(_) => {}
    }
}
