//! Preprocessor constant-expression evaluation for `#if` / `#elif`.
//!
//! `defined` is rewritten before macro expansion (its operand must not be
//! expanded), then the rest of the expression is expanded and evaluated in
//! the widest signed/unsigned integer type. Unknown identifiers evaluate to
//! 0, as the standard requires.

use lx_scan::token::{Number, Op, Token};

use crate::expand::expand_tokens;
use crate::macros::{MacroEnv, ReadTracker};

/// Evaluate a captured `#if`/`#elif` token list. Malformed expressions
/// evaluate to false rather than aborting the resolution.
pub fn eval_condition(tokens: &[Token], env: &MacroEnv, tracker: &mut ReadTracker) -> bool {
    let rewritten = replace_defined(tokens, env, tracker);
    let expanded = expand_tokens(&rewritten, env, tracker);
    let significant: Vec<&Token> = expanded
        .iter()
        .filter(|t| !matches!(t, Token::Space | Token::Newline))
        .collect();

    let mut parser = Parser {
        tokens: &significant,
        pos: 0,
    };
    match parser.expr() {
        Some(v) => v.value != 0,
        None => false,
    }
}

/// Rewrite `defined X` and `defined(X)` into `1` / `0`.
fn replace_defined(tokens: &[Token], env: &MacroEnv, tracker: &mut ReadTracker) -> Vec<Token> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;

    let significant = |from: usize| -> Option<usize> {
        (from..tokens.len()).find(|&k| !matches!(tokens[k], Token::Space))
    };

    while i < tokens.len() {
        let is_defined = matches!(&tokens[i], Token::Identifier(name) if name == "defined");
        if !is_defined {
            out.push(tokens[i].clone());
            i += 1;
            continue;
        }

        // defined IDENT
        if let Some(j) = significant(i + 1) {
            if let Token::Identifier(name) = &tokens[j] {
                let v = env.is_defined_tracked(name, tracker);
                out.push(Token::int(v as i64));
                i = j + 1;
                continue;
            }
            // defined ( IDENT )
            if tokens[j].is_punct(b'(') {
                if let Some(k) = significant(j + 1) {
                    if let Token::Identifier(name) = &tokens[k] {
                        if let Some(l) = significant(k + 1) {
                            if tokens[l].is_punct(b')') {
                                let v = env.is_defined_tracked(name, tracker);
                                out.push(Token::int(v as i64));
                                i = l + 1;
                                continue;
                            }
                        }
                    }
                }
            }
        }

        // malformed `defined`; keep the identifier, it will evaluate to 0
        out.push(tokens[i].clone());
        i += 1;
    }

    out
}

/// An integer with signedness, the way the preprocessor computes.
#[derive(Debug, Clone, Copy)]
struct Value {
    value: i64,
    unsigned: bool,
}

impl Value {
    fn signed(value: i64) -> Self {
        Self {
            value,
            unsigned: false,
        }
    }

    fn bool(b: bool) -> Self {
        Self::signed(b as i64)
    }
}

fn arith(lhs: Value, rhs: Value, f_s: impl Fn(i64, i64) -> i64, f_u: impl Fn(u64, u64) -> u64) -> Value {
    let unsigned = lhs.unsigned || rhs.unsigned;
    let value = if unsigned {
        f_u(lhs.value as u64, rhs.value as u64) as i64
    } else {
        f_s(lhs.value, rhs.value)
    };
    Value { value, unsigned }
}

fn compare(lhs: Value, rhs: Value, f_s: impl Fn(i64, i64) -> bool, f_u: impl Fn(u64, u64) -> bool) -> Value {
    if lhs.unsigned || rhs.unsigned {
        Value::bool(f_u(lhs.value as u64, rhs.value as u64))
    } else {
        Value::bool(f_s(lhs.value, rhs.value))
    }
}

struct Parser<'a> {
    tokens: &'a [&'a Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos).copied()?;
        self.pos += 1;
        Some(t)
    }

    fn eat_op(&mut self, op: Op) -> bool {
        if self.peek() == Some(&Token::Op(op)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn eat_punct(&mut self, c: u8) -> bool {
        if self.peek().is_some_and(|t| t.is_punct(c)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expr(&mut self) -> Option<Value> {
        self.ternary()
    }

    fn ternary(&mut self) -> Option<Value> {
        let cond = self.logical_or()?;
        if !self.eat_punct(b'?') {
            return Some(cond);
        }
        let then = self.expr()?;
        if !self.eat_punct(b':') {
            return None;
        }
        let otherwise = self.ternary()?;
        Some(if cond.value != 0 { then } else { otherwise })
    }

    fn logical_or(&mut self) -> Option<Value> {
        let mut lhs = self.logical_and()?;
        while self.eat_op(Op::LogOr) {
            let rhs = self.logical_and()?;
            lhs = Value::bool(lhs.value != 0 || rhs.value != 0);
        }
        Some(lhs)
    }

    fn logical_and(&mut self) -> Option<Value> {
        let mut lhs = self.bit_or()?;
        while self.eat_op(Op::LogAnd) {
            let rhs = self.bit_or()?;
            lhs = Value::bool(lhs.value != 0 && rhs.value != 0);
        }
        Some(lhs)
    }

    fn bit_or(&mut self) -> Option<Value> {
        let mut lhs = self.bit_xor()?;
        while self.eat_op(Op::BitOr) {
            let rhs = self.bit_xor()?;
            lhs = arith(lhs, rhs, |a, b| a | b, |a, b| a | b);
        }
        Some(lhs)
    }

    fn bit_xor(&mut self) -> Option<Value> {
        let mut lhs = self.bit_and()?;
        while self.eat_op(Op::BitXor) {
            let rhs = self.bit_and()?;
            lhs = arith(lhs, rhs, |a, b| a ^ b, |a, b| a ^ b);
        }
        Some(lhs)
    }

    fn bit_and(&mut self) -> Option<Value> {
        let mut lhs = self.equality()?;
        while self.eat_op(Op::BitAnd) {
            let rhs = self.equality()?;
            lhs = arith(lhs, rhs, |a, b| a & b, |a, b| a & b);
        }
        Some(lhs)
    }

    fn equality(&mut self) -> Option<Value> {
        let mut lhs = self.relational()?;
        loop {
            if self.eat_op(Op::Eq) {
                let rhs = self.relational()?;
                lhs = compare(lhs, rhs, |a, b| a == b, |a, b| a == b);
            } else if self.eat_op(Op::Ne) {
                let rhs = self.relational()?;
                lhs = compare(lhs, rhs, |a, b| a != b, |a, b| a != b);
            } else {
                return Some(lhs);
            }
        }
    }

    fn relational(&mut self) -> Option<Value> {
        let mut lhs = self.shift()?;
        loop {
            if self.eat_op(Op::Le) {
                let rhs = self.shift()?;
                lhs = compare(lhs, rhs, |a, b| a <= b, |a, b| a <= b);
            } else if self.eat_op(Op::Ge) {
                let rhs = self.shift()?;
                lhs = compare(lhs, rhs, |a, b| a >= b, |a, b| a >= b);
            } else if self.eat_op(Op::Lt) {
                let rhs = self.shift()?;
                lhs = compare(lhs, rhs, |a, b| a < b, |a, b| a < b);
            } else if self.eat_op(Op::Gt) {
                let rhs = self.shift()?;
                lhs = compare(lhs, rhs, |a, b| a > b, |a, b| a > b);
            } else {
                return Some(lhs);
            }
        }
    }

    fn shift(&mut self) -> Option<Value> {
        let mut lhs = self.additive()?;
        loop {
            if self.eat_op(Op::Shl) {
                let rhs = self.additive()?;
                lhs = arith(
                    lhs,
                    rhs,
                    |a, b| a.wrapping_shl(b as u32),
                    |a, b| a.wrapping_shl(b as u32),
                );
            } else if self.eat_op(Op::Shr) {
                let rhs = self.additive()?;
                lhs = arith(
                    lhs,
                    rhs,
                    |a, b| a.wrapping_shr(b as u32),
                    |a, b| a.wrapping_shr(b as u32),
                );
            } else {
                return Some(lhs);
            }
        }
    }

    fn additive(&mut self) -> Option<Value> {
        let mut lhs = self.multiplicative()?;
        loop {
            if self.eat_op(Op::Add) {
                let rhs = self.multiplicative()?;
                lhs = arith(lhs, rhs, i64::wrapping_add, u64::wrapping_add);
            } else if self.eat_op(Op::Sub) {
                let rhs = self.multiplicative()?;
                lhs = arith(lhs, rhs, i64::wrapping_sub, u64::wrapping_sub);
            } else {
                return Some(lhs);
            }
        }
    }

    fn multiplicative(&mut self) -> Option<Value> {
        let mut lhs = self.unary()?;
        loop {
            if self.eat_op(Op::Mul) {
                let rhs = self.unary()?;
                lhs = arith(lhs, rhs, i64::wrapping_mul, u64::wrapping_mul);
            } else if self.eat_op(Op::Div) {
                let rhs = self.unary()?;
                // division by zero is undefined in the source; evaluate to 0
                lhs = arith(
                    lhs,
                    rhs,
                    |a, b| if b == 0 { 0 } else { a.wrapping_div(b) },
                    |a, b| if b == 0 { 0 } else { a / b },
                );
            } else if self.eat_op(Op::Mod) {
                let rhs = self.unary()?;
                lhs = arith(
                    lhs,
                    rhs,
                    |a, b| if b == 0 { 0 } else { a.wrapping_rem(b) },
                    |a, b| if b == 0 { 0 } else { a % b },
                );
            } else {
                return Some(lhs);
            }
        }
    }

    fn unary(&mut self) -> Option<Value> {
        if self.eat_punct(b'!') {
            let v = self.unary()?;
            return Some(Value::bool(v.value == 0));
        }
        if self.eat_punct(b'~') {
            let v = self.unary()?;
            return Some(Value {
                value: !v.value,
                unsigned: v.unsigned,
            });
        }
        if self.eat_op(Op::Sub) {
            let v = self.unary()?;
            return Some(Value {
                value: v.value.wrapping_neg(),
                unsigned: v.unsigned,
            });
        }
        if self.eat_op(Op::Add) {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Option<Value> {
        match self.bump()? {
            Token::Number(n) => Some(number_value(n)),
            // unknown identifier (or one that expanded to nothing known)
            Token::Identifier(_) => Some(Value::signed(0)),
            Token::Punct(b'(') => {
                let v = self.expr()?;
                if !self.eat_punct(b')') {
                    return None;
                }
                Some(v)
            }
            _ => None,
        }
    }
}

fn number_value(n: &Number) -> Value {
    let Some(value) = n.value else {
        return Value::signed(0);
    };
    let unsigned = n
        .text
        .bytes()
        .rev()
        .take_while(|b| b.is_ascii_alphabetic())
        .any(|b| b == b'u' || b == b'U');
    Value { value, unsigned }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::MacroDef;
    use lx_scan::stream::ByteStream;
    use lx_scan::tokenizer::next_token;

    fn lex(src: &str) -> Vec<Token> {
        let mut stream = ByteStream::new(src.as_bytes());
        let mut out = Vec::new();
        loop {
            let t = next_token(&mut stream, true).unwrap();
            if t == Token::End {
                break;
            }
            out.push(t);
        }
        out
    }

    fn eval(src: &str, env: &MacroEnv) -> bool {
        eval_condition(&lex(src), env, &mut ReadTracker::new())
    }

    #[test]
    fn arithmetic_and_precedence() {
        let env = MacroEnv::new();
        assert!(eval("1 + 2 * 3 == 7", &env));
        assert!(eval("(1 + 2) * 3 == 9", &env));
        // shift binds tighter than equality
        assert!(eval("1 << 4 == 16", &env));
        assert!(eval("(1 << 4) == 16", &env));
        assert!(eval("10 % 3 == 1", &env));
    }

    #[test]
    fn unknown_identifiers_are_zero() {
        let env = MacroEnv::new();
        assert!(!eval("TOTALLY_UNKNOWN", &env));
        assert!(eval("TOTALLY_UNKNOWN == 0", &env));
    }

    #[test]
    fn defined_operator() {
        let mut env = MacroEnv::new();
        env.define(MacroDef::object("FOO", vec![Token::int(0)]));
        assert!(eval("defined(FOO)", &env));
        assert!(eval("defined FOO", &env));
        assert!(!eval("defined(BAR)", &env));
        // FOO is defined but expands to 0
        assert!(!eval("FOO", &env));
        assert!(eval("defined(FOO) && !FOO", &env));
    }

    #[test]
    fn defined_operand_is_not_expanded() {
        let mut env = MacroEnv::new();
        env.define(MacroDef::object("A", vec![Token::ident("B")]));
        // defined(A) asks about A, not about B
        assert!(eval("defined(A)", &env));
        assert!(!eval("defined(B)", &env));
    }

    #[test]
    fn macro_expansion_before_eval() {
        let mut env = MacroEnv::new();
        env.define(MacroDef::object("VERSION", vec![Token::int(40200)]));
        assert!(eval("VERSION >= 40000", &env));
        assert!(!eval("VERSION >= 50000", &env));
    }

    #[test]
    fn unsigned_promotes_comparison() {
        let env = MacroEnv::new();
        // -1 compared against unsigned wraps to a huge value
        assert!(eval("-1 > 0u", &env));
        assert!(!eval("-1 > 0", &env));
    }

    #[test]
    fn ternary_and_logic() {
        let env = MacroEnv::new();
        assert!(eval("1 ? 2 : 0", &env));
        assert!(!eval("0 ? 2 : 0", &env));
        assert!(eval("0 || 1", &env));
        assert!(!eval("0 && 1", &env));
        // short-circuit keeps divide-by-zero harmless
        assert!(!eval("0 && (1 / 0)", &env));
    }

    #[test]
    fn division_by_zero_is_zero() {
        let env = MacroEnv::new();
        assert!(!eval("1 / 0", &env));
        assert!(!eval("1 % 0", &env));
    }

    #[test]
    fn malformed_expression_is_false() {
        let env = MacroEnv::new();
        assert!(!eval("1 +", &env));
        assert!(!eval("(1", &env));
    }
}
