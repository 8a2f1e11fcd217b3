//! Macro expansion over token sequences.
//!
//! Object-like and function-like macros, `##` concatenation, `#`
//! stringization, `__VA_ARGS__`, and the blue-paint rule: a macro currently
//! being expanded is disabled inside its own replacement, which is what
//! keeps self-referential macros finite.

use std::collections::HashSet;

use lx_scan::stream::ByteStream;
use lx_scan::token::{render_tokens, Op, Token};
use lx_scan::tokenizer::next_token;

use crate::macros::{MacroEnv, ReadTracker};

/// Fully expand `tokens` under `env`. Reads are recorded in `tracker`.
pub fn expand_tokens(tokens: &[Token], env: &MacroEnv, tracker: &mut ReadTracker) -> Vec<Token> {
    let mut hide = HashSet::new();
    let mut out = Vec::with_capacity(tokens.len());
    expand_into(tokens, env, tracker, &mut hide, &mut out);
    out
}

fn expand_into(
    tokens: &[Token],
    env: &MacroEnv,
    tracker: &mut ReadTracker,
    hide: &mut HashSet<String>,
    out: &mut Vec<Token>,
) {
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        let Token::Identifier(name) = token else {
            out.push(token.clone());
            i += 1;
            continue;
        };

        if hide.contains(name) {
            out.push(token.clone());
            i += 1;
            continue;
        }

        let Some(def) = env.lookup_tracked(name, tracker) else {
            out.push(token.clone());
            i += 1;
            continue;
        };

        if !def.is_function() {
            hide.insert(name.clone());
            let substituted = paste_pass(&def.replacement);
            expand_into(&substituted, env, tracker, hide, out);
            hide.remove(name.as_str());
            i += 1;
            continue;
        }

        // function-like: only invoked when '(' follows
        let mut j = i + 1;
        while matches!(tokens.get(j), Some(Token::Space)) {
            j += 1;
        }
        if !matches!(tokens.get(j), Some(t) if t.is_punct(b'(')) {
            out.push(token.clone());
            i += 1;
            continue;
        }

        let Some((args, after)) = gather_args(tokens, j) else {
            // unbalanced parens; emit as-is and stop interpreting the call
            out.push(token.clone());
            i += 1;
            continue;
        };

        let params = def.params.expect("function macro has params");
        let substituted = substitute(
            &def.replacement,
            params.count,
            params.variadic,
            &args,
            env,
            tracker,
            hide,
        );
        let pasted = paste_pass(&substituted);

        hide.insert(name.clone());
        expand_into(&pasted, env, tracker, hide, out);
        hide.remove(name.as_str());

        i = after;
    }
}

/// Collect macro-call arguments starting at the `(` at `open`. Returns the
/// argument token lists and the index just past the closing `)`.
fn gather_args(tokens: &[Token], open: usize) -> Option<(Vec<Vec<Token>>, usize)> {
    debug_assert!(tokens[open].is_punct(b'('));
    let mut args: Vec<Vec<Token>> = vec![Vec::new()];
    let mut depth = 0usize;
    let mut i = open;

    loop {
        let token = tokens.get(i)?;
        if token.is_punct(b'(') {
            depth += 1;
            if depth > 1 {
                args.last_mut().unwrap().push(token.clone());
            }
        } else if token.is_punct(b')') {
            depth -= 1;
            if depth == 0 {
                i += 1;
                break;
            }
            args.last_mut().unwrap().push(token.clone());
        } else if token.is_punct(b',') && depth == 1 {
            args.push(Vec::new());
        } else if depth >= 1 {
            args.last_mut().unwrap().push(token.clone());
        }
        i += 1;
    }

    for arg in &mut args {
        trim_spaces(arg);
    }
    // `F()` is zero args, not one empty arg
    if args.len() == 1 && args[0].is_empty() {
        args.clear();
    }
    Some((args, i))
}

fn trim_spaces(tokens: &mut Vec<Token>) {
    while tokens.first() == Some(&Token::Space) {
        tokens.remove(0);
    }
    while tokens.last() == Some(&Token::Space) {
        tokens.pop();
    }
}

fn arg_or_empty(args: &[Vec<Token>], i: usize) -> &[Token] {
    args.get(i).map(|a| a.as_slice()).unwrap_or(&[])
}

/// All arguments from `from` on, re-joined with commas (the raw
/// `__VA_ARGS__` sequence).
fn va_args_tokens(args: &[Vec<Token>], from: usize) -> Vec<Token> {
    let mut out = Vec::new();
    for (n, arg) in args.iter().skip(from).enumerate() {
        if n > 0 {
            out.push(Token::Punct(b','));
            out.push(Token::Space);
        }
        out.extend(arg.iter().cloned());
    }
    out
}

/// Replace parameter references in a function-like macro body. Arguments
/// adjacent to `##` or named by `#` go in raw; everything else is fully
/// expanded first.
fn substitute(
    replacement: &[Token],
    param_count: usize,
    variadic: bool,
    args: &[Vec<Token>],
    env: &MacroEnv,
    tracker: &mut ReadTracker,
    hide: &mut HashSet<String>,
) -> Vec<Token> {
    let _ = variadic;
    let mut out: Vec<Token> = Vec::with_capacity(replacement.len());
    let mut i = 0;

    while i < replacement.len() {
        let token = &replacement[i];

        // stringization: '#' immediately before a parameter
        if *token == Token::Op(Op::Sharp) {
            match replacement.get(i + 1) {
                Some(Token::MacroParam(p)) => {
                    out.push(stringize(arg_or_empty(args, *p)));
                    i += 2;
                    continue;
                }
                Some(Token::MacroParamVaArgs(n)) => {
                    out.push(stringize(&va_args_tokens(args, *n)));
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }

        let next_is_paste = matches!(replacement.get(i + 1), Some(Token::Op(Op::DoubleSharp)));
        let prev_was_paste = matches!(out.last(), Some(Token::Op(Op::DoubleSharp)));

        match token {
            Token::MacroParam(p) => {
                let raw = arg_or_empty(args, *p);
                if next_is_paste || prev_was_paste {
                    out.extend(raw.iter().cloned());
                } else {
                    expand_into(raw, env, tracker, hide, &mut out);
                }
            }
            Token::MacroParamVaArgs(n) => {
                let raw = va_args_tokens(args, *n);
                if next_is_paste || prev_was_paste {
                    out.extend(raw);
                } else {
                    expand_into(&raw, env, tracker, hide, &mut out);
                }
            }
            t => out.push(t.clone()),
        }
        i += 1;
    }

    out
}

/// Resolve `##` pastes: render both neighbors to text, re-lex the result.
fn paste_pass(tokens: &[Token]) -> Vec<Token> {
    if !tokens.iter().any(|t| *t == Token::Op(Op::DoubleSharp)) {
        return tokens.to_vec();
    }

    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == Token::Op(Op::DoubleSharp) && !out.is_empty() {
            let left = out.pop().unwrap();
            i += 1;
            let right = tokens.get(i).cloned();
            let mut text = String::new();
            left.render_into(&mut text);
            if let Some(r) = &right {
                r.render_into(&mut text);
                i += 1;
            }
            out.extend(relex(&text));
            continue;
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    out
}

/// Lex a pasted spelling back into tokens. A paste that does not form a
/// single valid token just yields whatever it lexes to.
fn relex(text: &str) -> Vec<Token> {
    let mut stream = ByteStream::new(text.as_bytes());
    let mut out = Vec::new();
    while let Ok(token) = next_token(&mut stream, false) {
        if token == Token::End {
            break;
        }
        out.push(token);
    }
    out
}

fn stringize(tokens: &[Token]) -> Token {
    Token::Str(render_tokens(tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::MacroDef;
    use lx_scan::{Directive, MacroParams};

    /// Build an env from directive source text.
    fn env_of(src: &str) -> MacroEnv {
        let list = lx_scan::scan_directives(src.as_bytes()).unwrap();
        let mut env = MacroEnv::new();
        for item in list.iter() {
            if let Directive::Define {
                name,
                params,
                replacement,
            } = &item.directive
            {
                env.define(MacroDef {
                    name: name.clone(),
                    params: *params,
                    replacement: replacement.clone(),
                });
            }
        }
        env
    }

    fn expand_str(env: &MacroEnv, src: &str) -> String {
        let mut stream = ByteStream::new(src.as_bytes());
        let mut tokens = Vec::new();
        loop {
            let t = next_token(&mut stream, true).unwrap();
            if t == Token::End {
                break;
            }
            tokens.push(t);
        }
        let mut tracker = ReadTracker::new();
        render_tokens(&expand_tokens(&tokens, env, &mut tracker))
    }

    #[test]
    fn object_macro_chain() {
        let env = env_of("#define A B\n#define B 42\n");
        assert_eq!(expand_str(&env, "A"), "42");
    }

    #[test]
    fn function_macro_expands_args() {
        let env = env_of("#define ADD(x, y) ((x) + (y))\n#define ONE 1\n");
        assert_eq!(expand_str(&env, "ADD(ONE, 2)"), "((1) + (2))");
    }

    #[test]
    fn function_macro_without_parens_is_plain_ident() {
        let env = env_of("#define F(x) x\n");
        assert_eq!(expand_str(&env, "F"), "F");
    }

    #[test]
    fn paste_makes_one_token() {
        let env = env_of("#define CAT(a, b) a##b\n#define XY 7\n");
        assert_eq!(expand_str(&env, "CAT(X, Y)"), "XY");
        // and the pasted token is itself expandable
        let env2 = env_of("#define CAT2(a, b) G(a##b)\n#define G(v) v\n#define XY 7\n");
        assert_eq!(expand_str(&env2, "CAT2(X, Y)"), "7");
    }

    #[test]
    fn stringize_uses_raw_argument() {
        let env = env_of("#define STR(x) #x\n#define N 9\n");
        // '#x' takes the spelling, not the expansion
        assert_eq!(expand_str(&env, "STR(N)"), "\"N\"");
    }

    #[test]
    fn va_args_joined() {
        let env = env_of("#define CALL(f, ...) f(__VA_ARGS__)\n");
        assert_eq!(expand_str(&env, "CALL(g, 1, 2)"), "g(1, 2)");
    }

    #[test]
    fn blue_paint_stops_self_reference() {
        let env = env_of("#define X X + 1\n");
        assert_eq!(expand_str(&env, "X"), "X + 1");

        // mutual recursion also terminates
        let env2 = env_of("#define A B\n#define B A\n");
        assert_eq!(expand_str(&env2, "A"), "A");
    }

    #[test]
    fn nested_call_arguments() {
        let env = env_of("#define ID(x) x\n");
        assert_eq!(expand_str(&env, "ID(ID(5))"), "5");
        // the test harness lexes with space-skipping, so the rendered call
        // comes back without interior spaces
        assert_eq!(expand_str(&env, "ID((1, 2))"), "(1,2)");
    }

    #[test]
    fn empty_argument_list() {
        let mut env = MacroEnv::new();
        env.define(MacroDef::function(
            "Z",
            MacroParams {
                count: 0,
                variadic: false,
            },
            vec![Token::int(3)],
        ));
        assert_eq!(expand_str(&env, "Z()"), "3");
    }
}
