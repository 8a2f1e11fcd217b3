//! The include walk: directive lists + macro environment + search paths →
//! the transitive input set.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use lx_deps::FileStatCache;
use lx_scan::token::{render_tokens, Op, Token};
use lx_scan::{Directive, IncludePath};
use tracing::debug;

use crate::cache::{DirectiveCache, IncludeMemoCache, MemoEntry, TraceOp};
use crate::eval::eval_condition;
use crate::expand::expand_tokens;
use crate::macros::{MacroDef, MacroEnv, ReadTracker};
use crate::search::SearchPaths;
use crate::ResolveError;

/// Includes nested deeper than this are almost certainly a cycle that
/// escaped the pragma-once/import guards.
const MAX_INCLUDE_DEPTH: usize = 128;

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Fail the resolution on a missing include instead of recording a
    /// log-only warning. Off in production: the local compiler produces the
    /// canonical diagnostic on fallback.
    pub fatal_missing: bool,
}

/// Result of a successful resolution.
#[derive(Debug, Default)]
pub struct Resolved {
    /// Every file the compile reads, in visitation order, deduplicated by
    /// canonical path. The primary source is first.
    pub files: Vec<Utf8PathBuf>,
    /// Log-only warnings (missing includes, depth limit)
    pub warnings: Vec<String>,
}

/// Enumerate the transitive include set of `primary`.
#[allow(clippy::too_many_arguments)]
pub fn resolve(
    primary: &Utf8Path,
    initial_macros: Vec<MacroDef>,
    search: &SearchPaths,
    options: &ResolveOptions,
    stat_cache: &FileStatCache,
    directive_cache: &DirectiveCache,
    memo: &IncludeMemoCache,
) -> Result<Resolved, ResolveError> {
    let mut resolver = Resolver {
        env: MacroEnv::from_defs(initial_macros),
        search,
        config_hash: search.config_hash(),
        options,
        stat_cache,
        directive_cache,
        memo,
        files: Vec::new(),
        seen: HashSet::new(),
        once: HashSet::new(),
        warnings: Vec::new(),
    };

    resolver.process_file(primary, None, true, 0)?;

    Ok(Resolved {
        files: resolver.files,
        warnings: resolver.warnings,
    })
}

struct CondFrame {
    parent_active: bool,
    taking: bool,
    taken_any: bool,
}

struct Resolver<'a> {
    env: MacroEnv,
    search: &'a SearchPaths,
    config_hash: u64,
    options: &'a ResolveOptions,
    stat_cache: &'a FileStatCache,
    directive_cache: &'a DirectiveCache,
    memo: &'a IncludeMemoCache,
    files: Vec<Utf8PathBuf>,
    seen: HashSet<Utf8PathBuf>,
    /// Canonical paths guarded by `#pragma once` or `#import`
    once: HashSet<Utf8PathBuf>,
    warnings: Vec<String>,
}

impl Resolver<'_> {
    fn process_file(
        &mut self,
        path: &Utf8Path,
        found_at: Option<usize>,
        is_primary: bool,
        depth: usize,
    ) -> Result<(), ResolveError> {
        if depth > MAX_INCLUDE_DEPTH {
            self.warnings
                .push(format!("include depth limit reached at {path}"));
            return Ok(());
        }

        let canon = canonical(path);
        if self.once.contains(&canon) {
            return Ok(());
        }
        if self.seen.insert(canon.clone()) {
            self.files.push(path.to_owned());
        }

        let content = match std::fs::read(path) {
            Ok(c) => c,
            Err(source) if is_primary => {
                return Err(ResolveError::Io {
                    path: path.to_owned(),
                    source,
                })
            }
            Err(source) => {
                self.warnings.push(format!("cannot read {path}: {source}"));
                return Ok(());
            }
        };

        let (content_hash, list) = self
            .directive_cache
            .get_or_parse(&canon, &content)
            .map_err(|source| ResolveError::Scan {
                path: path.to_owned(),
                source,
            })?;

        if let Some(entry) = self.memo.lookup(&content_hash, self.config_hash, &self.env) {
            debug!(path = %path, "resolver memo hit");
            return self.replay(&canon, &entry, depth);
        }

        let dir = path.parent().map(|p| p.to_owned()).unwrap_or_default();

        let mut tracker = ReadTracker::new();
        let mut ops: Vec<TraceOp> = Vec::new();
        let mut marked_once = false;
        let mut stack: Vec<CondFrame> = Vec::new();

        for item in list.iter() {
            let active = stack.iter().all(|f| f.taking);

            match &item.directive {
                Directive::If(tokens) => {
                    let taking = active && {
                        let tokens = self.replace_has_include(tokens, &dir, found_at);
                        eval_condition(&tokens, &self.env, &mut tracker)
                    };
                    stack.push(CondFrame {
                        parent_active: active,
                        taking,
                        taken_any: taking,
                    });
                }
                Directive::Ifdef(name) => {
                    let taking = active && self.env.is_defined_tracked(name, &mut tracker);
                    stack.push(CondFrame {
                        parent_active: active,
                        taking,
                        taken_any: taking,
                    });
                }
                Directive::Ifndef(name) => {
                    let taking = active && !self.env.is_defined_tracked(name, &mut tracker);
                    stack.push(CondFrame {
                        parent_active: active,
                        taking,
                        taken_any: taking,
                    });
                }
                Directive::Elif(tokens) => {
                    if stack.is_empty() {
                        self.warnings.push(format!("#elif without #if in {path}"));
                        continue;
                    }
                    let top = stack.len() - 1;
                    let (parent_active, taken_any) =
                        (stack[top].parent_active, stack[top].taken_any);
                    let taking = parent_active && !taken_any && {
                        let tokens = self.replace_has_include(tokens, &dir, found_at);
                        eval_condition(&tokens, &self.env, &mut tracker)
                    };
                    stack[top].taking = taking;
                    stack[top].taken_any |= taking;
                }
                Directive::Else => {
                    if let Some(frame) = stack.last_mut() {
                        frame.taking = frame.parent_active && !frame.taken_any;
                        frame.taken_any = true;
                    } else {
                        self.warnings
                            .push(format!("#else without #if in {path}"));
                    }
                }
                Directive::Endif => {
                    if stack.pop().is_none() {
                        self.warnings
                            .push(format!("#endif without #if in {path}"));
                    }
                }

                _ if !active => {}

                Directive::Define {
                    name,
                    params,
                    replacement,
                } => {
                    let def = MacroDef {
                        name: name.clone(),
                        params: *params,
                        replacement: replacement.clone(),
                    };
                    tracker.note_modified(name);
                    self.env.define(def.clone());
                    ops.push(TraceOp::Define(def));
                }
                Directive::Undef(name) => {
                    tracker.note_modified(name);
                    self.env.undef(name);
                    ops.push(TraceOp::Undef(name.clone()));
                }
                Directive::PragmaOnce => {
                    marked_once = true;
                    self.once.insert(canon.clone());
                }
                Directive::Error(message) => {
                    return Err(ResolveError::ParseError(format!("{path}: {message}")));
                }

                Directive::Include(inc) => {
                    self.handle_include(inc, &dir, found_at, false, false, &mut tracker, &mut ops, depth)?;
                }
                Directive::Import(inc) => {
                    self.handle_include(inc, &dir, found_at, false, true, &mut tracker, &mut ops, depth)?;
                }
                Directive::IncludeNext(inc) => {
                    self.handle_include(inc, &dir, found_at, true, false, &mut tracker, &mut ops, depth)?;
                }
            }
        }

        self.memo.store(
            content_hash,
            self.config_hash,
            MemoEntry {
                tracked: tracker.into_reads(),
                ops,
                pragma_once: marked_once,
            },
        );

        Ok(())
    }

    fn replay(
        &mut self,
        canon: &Utf8PathBuf,
        entry: &MemoEntry,
        depth: usize,
    ) -> Result<(), ResolveError> {
        if entry.pragma_once {
            self.once.insert(canon.clone());
        }
        for op in &entry.ops {
            match op {
                TraceOp::Define(def) => self.env.define(def.clone()),
                TraceOp::Undef(name) => self.env.undef(name),
                TraceOp::Include {
                    path,
                    found_at,
                    import,
                } => {
                    self.process_file(path, *found_at, false, depth + 1)?;
                    if *import {
                        self.once.insert(canonical(path));
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_include(
        &mut self,
        inc: &IncludePath,
        current_dir: &Utf8Path,
        current_found_at: Option<usize>,
        is_next: bool,
        is_import: bool,
        tracker: &mut ReadTracker,
        ops: &mut Vec<TraceOp>,
        depth: usize,
    ) -> Result<(), ResolveError> {
        let (name, angle) = match self.include_target(inc, tracker) {
            Some(t) => t,
            None => return Ok(()),
        };

        let found = self.find_include(&name, angle, current_dir, current_found_at, is_next);

        let Some((resolved, found_at)) = found else {
            if self.options.fatal_missing {
                return Err(ResolveError::IncludeNotFound(name));
            }
            self.warnings.push(format!("include not found: {name}"));
            return Ok(());
        };

        ops.push(TraceOp::Include {
            path: resolved.clone(),
            found_at,
            import: is_import,
        });

        self.process_file(&resolved, found_at, false, depth + 1)?;
        if is_import {
            self.once.insert(canonical(&resolved));
        }
        Ok(())
    }

    /// Normalize an include target to (name, is-angle), expanding macros for
    /// computed includes.
    fn include_target(
        &mut self,
        inc: &IncludePath,
        tracker: &mut ReadTracker,
    ) -> Option<(String, bool)> {
        match inc {
            IncludePath::Angle(p) => Some((p.clone(), true)),
            IncludePath::Quote(p) => Some((p.clone(), false)),
            IncludePath::Tokens(tokens) => {
                // a mutable-env borrow is not needed: expansion only reads
                let expanded = expand_tokens(tokens, &self.env, tracker);
                let text = render_tokens(
                    &expanded
                        .into_iter()
                        .filter(|t| !matches!(t, lx_scan::Token::Space))
                        .collect::<Vec<_>>(),
                );
                let text = text.trim();
                if let Some(inner) = text.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
                    return Some((inner.to_string(), true));
                }
                if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
                    return Some((text[1..text.len() - 1].to_string(), false));
                }
                self.warnings
                    .push(format!("computed include did not resolve to a path: {text}"));
                None
            }
        }
    }

    /// Rewrite `__has_include(...)` / `__has_include_next(...)` into `1`
    /// or `0` before the expression is evaluated. The operand forms are the
    /// literal `<...>` and `"..."`; anything else evaluates to 0.
    fn replace_has_include(
        &self,
        tokens: &[Token],
        current_dir: &Utf8Path,
        current_found_at: Option<usize>,
    ) -> Vec<Token> {
        let involved = tokens.iter().any(|t| {
            matches!(t, Token::Identifier(n) if n == "__has_include" || n == "__has_include_next")
        });
        if !involved {
            return tokens.to_vec();
        }

        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            let is_next = match &tokens[i] {
                Token::Identifier(n) if n == "__has_include" => false,
                Token::Identifier(n) if n == "__has_include_next" => true,
                other => {
                    out.push(other.clone());
                    i += 1;
                    continue;
                }
            };

            let Some((target, after)) = parse_has_include_operand(tokens, i + 1) else {
                // malformed operand: evaluates to 0, skip just the keyword
                out.push(Token::int(0));
                i += 1;
                continue;
            };

            let found = match target {
                Some((name, angle)) => self
                    .find_include(&name, angle, current_dir, current_found_at, is_next)
                    .is_some(),
                None => false,
            };
            out.push(Token::int(found as i64));
            i = after;
        }
        out
    }

    fn find_include(
        &self,
        name: &str,
        angle: bool,
        current_dir: &Utf8Path,
        current_found_at: Option<usize>,
        is_next: bool,
    ) -> Option<(Utf8PathBuf, Option<usize>)> {
        let name_path = Utf8Path::new(name);

        if name_path.is_absolute() {
            if self.stat_cache.get(name_path).exists {
                return Some((name_path.to_owned(), None));
            }
            return None;
        }

        if is_next {
            let start = current_found_at.map(|i| i + 1).unwrap_or(0);
            return self
                .search
                .find_from(name_path, start, self.stat_cache)
                .map(|(p, i)| (p, Some(i)));
        }

        if !angle {
            // the including file's directory wins for quote includes
            let candidate = current_dir.join(name_path);
            if self.stat_cache.get(&candidate).exists {
                return Some((candidate, None));
            }
            return self
                .search
                .find_from(name_path, 0, self.stat_cache)
                .map(|(p, i)| (p, Some(i)));
        }

        self.search
            .find_from(name_path, self.search.angle_start(), self.stat_cache)
            .map(|(p, i)| (p, Some(i)))
    }
}

/// Parse the parenthesized operand of `__has_include` starting at `from`.
/// Returns (target, index-past-`)`) where target is (name, is-angle), or
/// `None` as the target for an operand that is present but unusable.
fn parse_has_include_operand(
    tokens: &[Token],
    from: usize,
) -> Option<(Option<(String, bool)>, usize)> {
    let mut i = from;
    while matches!(tokens.get(i), Some(Token::Space)) {
        i += 1;
    }
    if !tokens.get(i)?.is_punct(b'(') {
        return None;
    }
    i += 1;
    while matches!(tokens.get(i), Some(Token::Space)) {
        i += 1;
    }

    // "name" form
    if let Some(Token::Str(name)) = tokens.get(i) {
        let close = skip_to_close_paren(tokens, i + 1)?;
        return Some((Some((name.clone(), false)), close));
    }

    // <name> form: render everything up to the matching '>'
    if tokens.get(i) == Some(&Token::Op(Op::Lt)) {
        let mut j = i + 1;
        let mut name_tokens = Vec::new();
        loop {
            match tokens.get(j)? {
                Token::Op(Op::Gt) => break,
                t => name_tokens.push(t.clone()),
            }
            j += 1;
        }
        let close = skip_to_close_paren(tokens, j + 1)?;
        return Some((Some((render_tokens(&name_tokens), true)), close));
    }

    // some other token sequence (e.g. an unexpanded macro): unusable
    let close = skip_to_close_paren(tokens, i)?;
    Some((None, close))
}

/// Index just past the `)` that closes the operand list.
fn skip_to_close_paren(tokens: &[Token], mut i: usize) -> Option<usize> {
    let mut depth = 0usize;
    loop {
        let t = tokens.get(i)?;
        if t.is_punct(b'(') {
            depth += 1;
        } else if t.is_punct(b')') {
            if depth == 0 {
                return Some(i + 1);
            }
            depth -= 1;
        }
        i += 1;
    }
}

fn canonical(path: &Utf8Path) -> Utf8PathBuf {
    match path.canonicalize_utf8() {
        Ok(p) => p,
        Err(_) => path.to_owned(),
    }
}
