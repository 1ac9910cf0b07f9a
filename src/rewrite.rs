//! Purpose: Turn user-supplied expressions into fully-qualified, allow-listed interpreter calls.
//! Exports: `ExpressionRewriter`, `MethodTable`, `MethodRewriter`.
//! Role: Boundary step run before anything is submitted to the engine.
//! Invariants: Every called function must resolve through the method table; unknown calls are parse errors.
//! Invariants: Failures are `ErrorKind::Parse` carrying the diagnostic only (callers add any prefix).
//! Notes: The accepted grammar is a small R subset: calls, named args, `$`/`@` access, `[`/`[[` indexing,
//! literals, unary `-`/`!` and the usual binary operators including `~` formulas.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::Deserialize;

use crate::core::error::{Error, ErrorKind};

pub trait ExpressionRewriter: Send + Sync {
    fn rewrite_aggregate(&self, expression: &str) -> Result<String, Error>;
    fn rewrite_assign(&self, expression: &str) -> Result<String, Error>;
}

/// Allowed methods per call type, mapping a bare name to its qualified target.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct MethodTable {
    #[serde(default)]
    pub aggregate: BTreeMap<String, String>,
    #[serde(default)]
    pub assign: BTreeMap<String, String>,
}

impl MethodTable {
    pub fn builtin() -> Self {
        let shared = [("c", "base::c"), ("list", "base::list")];
        let aggregate = [
            ("meanDS", "dsBase::meanDS"),
            ("lengthDS", "dsBase::lengthDS"),
            ("classDS", "dsBase::classDS"),
            ("dimDS", "dsBase::dimDS"),
            ("namesDS", "dsBase::namesDS"),
            ("isNaDS", "dsBase::isNaDS"),
            ("levelsDS", "dsBase::levelsDS"),
            ("quantileMeanDS", "dsBase::quantileMeanDS"),
            ("varDS", "dsBase::varDS"),
            ("tableDS", "dsBase::tableDS"),
        ];
        let assign = [
            ("asNumericDS", "dsBase::asNumericDS"),
            ("asFactorDS", "dsBase::asFactorDS"),
            ("asCharacterDS", "dsBase::asCharacterDS"),
            ("dataFrameDS", "dsBase::dataFrameDS"),
            ("dataFrameSubsetDS2", "dsBase::dataFrameSubsetDS2"),
            ("cbindDS", "dsBase::cbindDS"),
            ("rbindDS", "dsBase::rbindDS"),
            ("repDS", "dsBase::repDS"),
            ("log", "base::log"),
            ("exp", "base::exp"),
            ("sqrt", "base::sqrt"),
        ];
        let to_map = |items: &[(&str, &str)]| {
            items
                .iter()
                .chain(shared.iter())
                .map(|(name, target)| (name.to_string(), target.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            aggregate: to_map(&aggregate[..]),
            assign: to_map(&assign[..]),
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read methods file")
                .with_path(path)
                .with_source(err)
        })?;
        let table: MethodTable = serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid methods file")
                .with_path(path)
                .with_hint(r#"Expected {"aggregate": {"meanDS": "dsBase::meanDS"}, "assign": {...}}."#)
                .with_source(err)
        })?;
        for (name, target) in table.aggregate.iter().chain(table.assign.iter()) {
            if !is_name(name) || !is_qualified_target(target) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid method mapping '{name}' -> '{target}'"))
                    .with_path(path));
            }
        }
        Ok(table)
    }
}

#[derive(Clone, Debug)]
pub struct MethodRewriter {
    methods: MethodTable,
}

impl MethodRewriter {
    pub fn new(methods: MethodTable) -> Self {
        Self { methods }
    }

    fn rewrite(&self, expression: &str, methods: &BTreeMap<String, String>, label: &str) -> Result<String, Error> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_expression(0)?;
        if let Some(token) = parser.peek() {
            return Err(parse_error(format!(
                "unexpected {} at position {}",
                token.kind.describe(),
                token.offset
            )));
        }
        let mut out = String::with_capacity(expression.len() + 16);
        render(&expr, methods, label, &mut out)?;
        Ok(out)
    }
}

impl ExpressionRewriter for MethodRewriter {
    fn rewrite_aggregate(&self, expression: &str) -> Result<String, Error> {
        self.rewrite(expression, &self.methods.aggregate, "aggregate")
    }

    fn rewrite_assign(&self, expression: &str) -> Result<String, Error> {
        self.rewrite(expression, &self.methods.assign, "assign")
    }
}

fn parse_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Parse).with_message(message)
}

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Name(String),
    Number(String),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    LDoubleBracket,
    RBracket,
    Comma,
    Assign,
    Dollar,
    At,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Name(name) => format!("symbol '{name}'"),
            TokenKind::Number(text) => format!("number '{text}'"),
            TokenKind::Str(_) => "string".to_string(),
            TokenKind::Op(op) => format!("'{op}'"),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::LDoubleBracket => "'[['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Assign => "'='".to_string(),
            TokenKind::Dollar => "'$'".to_string(),
            TokenKind::At => "'@'".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let kind = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b'[' if bytes.get(i + 1) == Some(&b'[') => {
                i += 2;
                TokenKind::LDoubleBracket
            }
            b'[' => {
                i += 1;
                TokenKind::LBracket
            }
            b']' => {
                i += 1;
                TokenKind::RBracket
            }
            b',' => {
                i += 1;
                TokenKind::Comma
            }
            b'$' => {
                i += 1;
                TokenKind::Dollar
            }
            b'@' => {
                i += 1;
                TokenKind::At
            }
            b'"' | b'\'' => {
                let (text, end) = lex_string(input, i)?;
                i = end;
                TokenKind::Str(text)
            }
            b'0'..=b'9' => {
                let end = lex_number(bytes, i);
                let text = input[i..end].to_string();
                i = end;
                TokenKind::Number(text)
            }
            b'.' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                let end = lex_number(bytes, i);
                let text = input[i..end].to_string();
                i = end;
                TokenKind::Number(text)
            }
            c if c.is_ascii_alphabetic() || c == b'.' => {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'.' || bytes[end] == b'_')
                {
                    end += 1;
                }
                let text = input[i..end].to_string();
                i = end;
                TokenKind::Name(text)
            }
            b':' if bytes.get(i + 1) == Some(&b':') => {
                return Err(parse_error(format!(
                    "namespace operator '::' is not allowed at position {start}"
                )));
            }
            _ => {
                let two = input.get(i..i + 2).unwrap_or("");
                let op = match two {
                    "==" | "!=" | "<=" | ">=" | "&&" | "||" => Some(two),
                    "<-" | "->" => {
                        return Err(parse_error(format!(
                            "assignment operator '{two}' is not allowed at position {start}"
                        )));
                    }
                    _ => None,
                };
                if let Some(op) = op {
                    i += 2;
                    TokenKind::Op(static_op(op))
                } else {
                    i += 1;
                    match c {
                        b'=' => TokenKind::Assign,
                        b'+' => TokenKind::Op("+"),
                        b'-' => TokenKind::Op("-"),
                        b'*' => TokenKind::Op("*"),
                        b'/' => TokenKind::Op("/"),
                        b'^' => TokenKind::Op("^"),
                        b'~' => TokenKind::Op("~"),
                        b':' => TokenKind::Op(":"),
                        b'<' => TokenKind::Op("<"),
                        b'>' => TokenKind::Op(">"),
                        b'!' => TokenKind::Op("!"),
                        b'&' => TokenKind::Op("&"),
                        b'|' => TokenKind::Op("|"),
                        _ => {
                            let shown = input[start..].chars().next().unwrap_or('?');
                            return Err(parse_error(format!(
                                "unexpected character '{shown}' at position {start}"
                            )));
                        }
                    }
                }
            }
        };
        tokens.push(Token {
            kind,
            offset: start,
        });
    }
    Ok(tokens)
}

fn static_op(op: &str) -> &'static str {
    match op {
        "==" => "==",
        "!=" => "!=",
        "<=" => "<=",
        ">=" => ">=",
        "&&" => "&&",
        _ => "||",
    }
}

fn lex_number(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            end = exp;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
    }
    if end < bytes.len() && bytes[end] == b'L' {
        end += 1;
    }
    end
}

/// Returns the literal exactly as written (quotes and escapes kept) and the end offset.
fn lex_string(input: &str, start: usize) -> Result<(String, usize), Error> {
    let bytes = input.as_bytes();
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            c if c == quote => return Ok((input[start..=i].to_string(), i + 1)),
            _ => i += 1,
        }
    }
    Err(parse_error(format!(
        "unterminated string starting at position {start}"
    )))
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Symbol(String),
    Literal(String),
    Call {
        name: String,
        args: Vec<Arg>,
    },
    Access {
        target: Box<Expr>,
        op: char,
        field: String,
    },
    Index {
        target: Box<Expr>,
        double: bool,
        args: Vec<Arg>,
    },
    Unary {
        op: &'static str,
        operand: Box<Expr>,
    },
    Binary {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Paren(Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
struct Arg {
    name: Option<String>,
    value: Option<Expr>,
}

/// Nesting levels plus operator and postfix chain links; bounds the parse and render recursion.
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

fn binary_precedence(op: &str) -> Option<(u8, bool)> {
    let entry = match op {
        "~" => (1, false),
        "|" | "||" => (2, false),
        "&" | "&&" => (3, false),
        "==" | "!=" | "<" | "<=" | ">" | ">=" => (4, false),
        "+" | "-" => (5, false),
        "*" | "/" => (6, false),
        ":" => (7, false),
        "^" => (9, true),
        _ => return None,
    };
    Some(entry)
}

const UNARY_PRECEDENCE: u8 = 8;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|token| &token.kind)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn end_offset(&self) -> usize {
        self.tokens
            .last()
            .map(|token| token.offset + 1)
            .unwrap_or(0)
    }

    fn descend(&mut self) -> Result<(), Error> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            let offset = self
                .peek()
                .map(|token| token.offset)
                .unwrap_or_else(|| self.end_offset());
            return Err(parse_error(format!(
                "expression nested too deeply at position {offset}"
            )));
        }
        Ok(())
    }

    fn parse_expression(&mut self, min_prec: u8) -> Result<Expr, Error> {
        let entry = self.depth;
        self.descend()?;
        let mut left = self.parse_unary()?;
        loop {
            let Some(TokenKind::Op(op)) = self.peek_kind() else {
                break;
            };
            let op = *op;
            let Some((prec, right_assoc)) = binary_precedence(op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.next();
            self.descend()?;
            let next_min = if right_assoc { prec } else { prec + 1 };
            let right = self.parse_expression(next_min)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = entry;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        if let Some(TokenKind::Op(op @ ("-" | "+" | "!"))) = self.peek_kind() {
            let op = *op;
            self.next();
            let operand = self.parse_expression(UNARY_PRECEDENCE)?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, Error> {
        let entry = self.depth;
        let mut expr = self.parse_primary()?;
        loop {
            let Some((kind, offset)) = self.peek().map(|token| (token.kind.clone(), token.offset)) else {
                break;
            };
            if matches!(
                kind,
                TokenKind::LParen | TokenKind::Dollar | TokenKind::At | TokenKind::LBracket | TokenKind::LDoubleBracket
            ) {
                self.descend()?;
            }
            match (kind, offset) {
                (TokenKind::LParen, offset) => {
                    let Expr::Symbol(name) = expr else {
                        return Err(parse_error(format!(
                            "only named functions can be called (position {offset})"
                        )));
                    };
                    self.next();
                    let args = self.parse_args(TokenKind::RParen, offset, "')'")?;
                    expr = Expr::Call { name, args };
                }
                (TokenKind::Dollar, offset) | (TokenKind::At, offset) => {
                    let op = if matches!(self.next().map(|t| t.kind), Some(TokenKind::Dollar)) {
                        '$'
                    } else {
                        '@'
                    };
                    let field = match self.next() {
                        Some(Token {
                            kind: TokenKind::Name(name),
                            ..
                        }) => name,
                        Some(Token {
                            kind: TokenKind::Str(text),
                            ..
                        }) => text,
                        _ => {
                            return Err(parse_error(format!(
                                "expected a field name after '{op}' at position {offset}"
                            )));
                        }
                    };
                    expr = Expr::Access {
                        target: Box::new(expr),
                        op,
                        field,
                    };
                }
                (TokenKind::LBracket, offset) => {
                    self.next();
                    let args = self.parse_args(TokenKind::RBracket, offset, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        double: false,
                        args,
                    };
                }
                (TokenKind::LDoubleBracket, offset) => {
                    self.next();
                    let args = self.parse_args(TokenKind::RBracket, offset, "']]'")?;
                    match self.next() {
                        Some(Token {
                            kind: TokenKind::RBracket,
                            ..
                        }) => {}
                        _ => {
                            return Err(parse_error(format!(
                                "missing closing ']]' for '[[' at position {offset}"
                            )));
                        }
                    }
                    expr = Expr::Index {
                        target: Box::new(expr),
                        double: true,
                        args,
                    };
                }
                _ => break,
            }
        }
        self.depth = entry;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        let end = self.end_offset();
        let Some(token) = self.next() else {
            return Err(parse_error(format!("unexpected end of expression at position {end}")));
        };
        match token.kind {
            TokenKind::Name(name) => Ok(Expr::Symbol(name)),
            TokenKind::Number(text) | TokenKind::Str(text) => Ok(Expr::Literal(text)),
            TokenKind::LParen => {
                let inner = self.parse_expression(0)?;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(Expr::Paren(Box::new(inner))),
                    _ => Err(parse_error(format!(
                        "missing closing ')' for '(' at position {}",
                        token.offset
                    ))),
                }
            }
            other => Err(parse_error(format!(
                "unexpected {} at position {}",
                other.describe(),
                token.offset
            ))),
        }
    }

    /// Parses a comma separated argument list up to `close`; empty slots are kept (`x[, "a"]`).
    fn parse_args(&mut self, close: TokenKind, open_offset: usize, close_label: &str) -> Result<Vec<Arg>, Error> {
        let mut args = Vec::new();
        if self.peek_kind() == Some(&close) {
            self.next();
            return Ok(args);
        }
        loop {
            let arg = match self.peek_kind() {
                Some(TokenKind::Comma) => Arg {
                    name: None,
                    value: None,
                },
                Some(kind) if *kind == close => Arg {
                    name: None,
                    value: None,
                },
                None => {
                    return Err(parse_error(format!(
                        "missing closing {close_label} for bracket opened at position {open_offset}"
                    )));
                }
                _ => self.parse_arg()?,
            };
            args.push(arg);
            match self.next() {
                Some(Token {
                    kind: TokenKind::Comma,
                    ..
                }) => continue,
                Some(token) if token.kind == close => return Ok(args),
                Some(token) => {
                    return Err(parse_error(format!(
                        "unexpected {} at position {}; expected ',' or {close_label}",
                        token.kind.describe(),
                        token.offset
                    )));
                }
                None => {
                    return Err(parse_error(format!(
                        "missing closing {close_label} for bracket opened at position {open_offset}"
                    )));
                }
            }
        }
    }

    fn parse_arg(&mut self) -> Result<Arg, Error> {
        let is_named = matches!(
            (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)),
            (
                Some(Token {
                    kind: TokenKind::Name(_) | TokenKind::Str(_),
                    ..
                }),
                Some(Token {
                    kind: TokenKind::Assign,
                    ..
                })
            )
        );
        if is_named {
            let Some(TokenKind::Name(name) | TokenKind::Str(name)) = self.next().map(|t| t.kind) else {
                return Err(parse_error("expected an argument name"));
            };
            self.next();
            let value = self.parse_expression(0)?;
            return Ok(Arg {
                name: Some(name),
                value: Some(value),
            });
        }
        if let Some(Token {
            kind: TokenKind::Assign,
            offset,
        }) = self.peek()
        {
            return Err(parse_error(format!("unexpected '=' at position {offset}")));
        }
        Ok(Arg {
            name: None,
            value: Some(self.parse_expression(0)?),
        })
    }
}

fn render(expr: &Expr, methods: &BTreeMap<String, String>, label: &str, out: &mut String) -> Result<(), Error> {
    match expr {
        Expr::Symbol(name) | Expr::Literal(name) => out.push_str(name),
        Expr::Call { name, args } => {
            let Some(target) = methods.get(name) else {
                return Err(parse_error(format!("'{name}' is not an allowed {label} method")));
            };
            out.push_str(target);
            out.push('(');
            render_args(args, methods, label, out)?;
            out.push(')');
        }
        Expr::Access { target, op, field } => {
            render(target, methods, label, out)?;
            out.push(*op);
            out.push_str(field);
        }
        Expr::Index {
            target,
            double,
            args,
        } => {
            render(target, methods, label, out)?;
            out.push_str(if *double { "[[" } else { "[" });
            render_args(args, methods, label, out)?;
            out.push_str(if *double { "]]" } else { "]" });
        }
        Expr::Unary { op, operand } => {
            out.push_str(op);
            render(operand, methods, label, out)?;
        }
        Expr::Binary { op, left, right } => {
            render(left, methods, label, out)?;
            let _ = write!(out, " {op} ");
            render(right, methods, label, out)?;
        }
        Expr::Paren(inner) => {
            out.push('(');
            render(inner, methods, label, out)?;
            out.push(')');
        }
    }
    Ok(())
}

fn render_args(args: &[Arg], methods: &BTreeMap<String, String>, label: &str, out: &mut String) -> Result<(), Error> {
    for (idx, arg) in args.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        if let Some(name) = &arg.name {
            out.push_str(name);
            out.push_str(" = ");
        }
        if let Some(value) = &arg.value {
            render(value, methods, label, out)?;
        }
    }
    Ok(())
}

fn is_name(name: &str) -> bool {
    crate::core::validate::is_symbol(name)
}

fn is_qualified_target(target: &str) -> bool {
    match target.split_once("::") {
        Some((package, function)) => is_name(package) && is_name(function),
        None => is_name(target),
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpressionRewriter, MethodRewriter, MethodTable};
    use crate::core::error::ErrorKind;

    fn rewriter() -> MethodRewriter {
        MethodRewriter::new(MethodTable::builtin())
    }

    #[test]
    fn qualifies_aggregate_calls() {
        let call = rewriter().rewrite_aggregate("meanDS(D$age)").expect("rewrite");
        assert_eq!(call, "dsBase::meanDS(D$age)");
    }

    #[test]
    fn qualifies_nested_assign_calls_and_keeps_literals() {
        let call = rewriter()
            .rewrite_assign("dataFrameDS(list(D$age, D$sex), keep.cnames = TRUE, strings = 'a\\'b')")
            .expect("rewrite");
        assert_eq!(
            call,
            "dsBase::dataFrameDS(base::list(D$age, D$sex), keep.cnames = TRUE, strings = 'a\\'b')"
        );
    }

    #[test]
    fn keeps_operators_indexing_and_formulas() {
        let call = rewriter()
            .rewrite_aggregate("tableDS(D[, c(\"age\", \"sex\")], -1.5e3 * (x + 2)^2, y ~ a + b)")
            .expect("rewrite");
        assert_eq!(
            call,
            "dsBase::tableDS(D[, base::c(\"age\", \"sex\")], -1.5e3 * (x + 2) ^ 2, y ~ a + b)"
        );
    }

    #[test]
    fn unbalanced_parentheses_are_parse_errors() {
        let err = rewriter().rewrite_assign("meanDS(D$age").expect_err("unbalanced");
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert_eq!(
            err.message(),
            Some("missing closing ')' for bracket opened at position 6")
        );
        let err = rewriter().rewrite_aggregate("meanDS(D$age))").expect_err("extra");
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn method_lists_are_separate() {
        let err = rewriter().rewrite_aggregate("asNumericDS(D$age)").expect_err("assign only");
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert_eq!(
            err.message(),
            Some("'asNumericDS' is not an allowed aggregate method")
        );
        rewriter().rewrite_assign("asNumericDS(D$age)").expect("assign ok");
    }

    #[test]
    fn rejects_namespaces_and_arrows() {
        for input in ["base::system('ls')", "x <- 1", "f()(1)", "", "meanDS(D$age,,", "`x`"] {
            let err = rewriter().rewrite_aggregate(input).expect_err(input);
            assert_eq!(err.kind(), ErrorKind::Parse, "{input}");
        }
    }

    #[test]
    fn deep_nesting_is_a_parse_error() {
        let inputs = [
            "(".repeat(100_000),
            format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000)),
            format!("{}1", "-".repeat(100_000)),
            format!("1{}", "+1".repeat(100_000)),
            format!("D{}", "$a".repeat(100_000)),
            format!("{}D{}", "meanDS(".repeat(100_000), ")".repeat(100_000)),
        ];
        for input in &inputs {
            let err = rewriter().rewrite_aggregate(input).expect_err("too deep");
            assert_eq!(err.kind(), ErrorKind::Parse);
            let message = err.message().expect("message");
            assert!(
                message.starts_with("expression nested too deeply at position "),
                "{message}"
            );
        }
    }

    #[test]
    fn moderate_nesting_still_parses() {
        let input = format!("meanDS({}x{})", "(".repeat(100), ")".repeat(100));
        let call = rewriter().rewrite_aggregate(&input).expect("rewrite");
        assert_eq!(call, format!("dsBase::meanDS({}x{})", "(".repeat(100), ")".repeat(100)));
        let sum = format!("meanDS(x{})", " + 1".repeat(100));
        assert_eq!(
            rewriter().rewrite_aggregate(&sum).expect("rewrite"),
            format!("dsBase::meanDS(x{})", " + 1".repeat(100))
        );
    }

    #[test]
    fn loads_method_table_from_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("methods.json");
        std::fs::write(
            &path,
            r#"{"aggregate": {"meanDS": "dsBase::meanDS"}, "assign": {"bad name": "x"}}"#,
        )
        .expect("write");
        let err = MethodTable::load(&path).expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Usage);

        std::fs::write(&path, r#"{"aggregate": {"meanDS": "dsBase::meanDS"}}"#).expect("write");
        let table = MethodTable::load(&path).expect("load");
        assert_eq!(table.aggregate.len(), 1);
        assert!(table.assign.is_empty());
    }
}
