//! Sandboxed expression language for schema names and conditions
//!
//! Expressions are parsed once when a schema is loaded and interpreted at
//! render time against a read-only namespace of entities. A snippet is
//! either a single expression or several statements separated by `;` or
//! newlines:
//!
//! ```text
//! let step = self.step.code
//! if step == "comp" then upper(step) else step
//! ```
//!
//! The value of a snippet is its `return` value, or else the value of its
//! last expression statement. Only the functions listed in [`FUNCTIONS`]
//! can be called; there is no way to mutate the namespace.

use std::collections::BTreeMap;
use std::fmt;

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::core::entity::Value;
use crate::core::session::Session;

/// Functions callable from expressions
pub const FUNCTIONS: [&str; 11] = [
    "lower", "upper", "str", "int", "float", "len", "replace", "pad", "default", "join", "contains",
];

/// Category of an expression failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprErrorKind {
    Syntax,
    UnknownName,
    UnknownFunction,
    Type,
    Arity,
    DivisionByZero,
    Index,
}

/// A parse or evaluation error pointing into the expression source
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(tfs::schema::expr))]
pub struct ExprError {
    kind: ExprErrorKind,
    message: String,
    #[source_code]
    src: String,
    #[label("here")]
    span: SourceSpan,
}

impl ExprError {
    fn new(kind: ExprErrorKind, message: impl Into<String>, src: &str, span: Span) -> Self {
        let start = span.0.min(src.len());
        let len = span.1.saturating_sub(span.0).max(1);
        Self {
            kind,
            message: message.into(),
            src: src.to_string(),
            span: SourceSpan::from((start, len)),
        }
    }

    pub fn kind(&self) -> ExprErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Byte range `[start, end)` in the source
type Span = (usize, usize);

// =========================================================================
// Lexer
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    Sep,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    span: Span,
}

const OPERATORS: [&str; 18] = [
    "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "(", ")", "[", "]", ",", ".", "=",
];

fn lex(src: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        match c {
            b' ' | b'\t' | b'\r' => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'\n' | b';' => {
                i += 1;
                if depth == 0 {
                    tokens.push(Token {
                        tok: Tok::Sep,
                        span: (start, i),
                    });
                }
            }
            b'0'..=b'9' => {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        is_float = true;
                        i = j;
                        while i < bytes.len() && bytes[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text = &src[start..i];
                let tok = if is_float {
                    Tok::Float(text.parse().map_err(|_| {
                        ExprError::new(ExprErrorKind::Syntax, format!("invalid number '{}'", text), src, (start, i))
                    })?)
                } else {
                    Tok::Int(text.parse().map_err(|_| {
                        ExprError::new(ExprErrorKind::Syntax, format!("integer '{}' is too large", text), src, (start, i))
                    })?)
                };
                tokens.push(Token { tok, span: (start, i) });
            }
            b'"' | b'\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    let Some(ch) = src[i..].chars().next() else {
                        return Err(ExprError::new(
                            ExprErrorKind::Syntax,
                            "unterminated string",
                            src,
                            (start, src.len()),
                        ));
                    };
                    i += ch.len_utf8();
                    if ch as u32 == quote as u32 {
                        break;
                    }
                    if ch == '\\' {
                        let Some(escaped) = src[i..].chars().next() else {
                            continue;
                        };
                        i += escaped.len_utf8();
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    } else {
                        value.push(ch);
                    }
                }
                tokens.push(Token {
                    tok: Tok::Str(value),
                    span: (start, i),
                });
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Ident(src[start..i].to_string()),
                    span: (start, i),
                });
            }
            _ => {
                let op = OPERATORS
                    .iter()
                    .find(|op| src[i..].starts_with(*op))
                    .ok_or_else(|| {
                        let ch = src[i..].chars().next().unwrap_or('?');
                        ExprError::new(
                            ExprErrorKind::Syntax,
                            format!("unexpected character '{}'", ch),
                            src,
                            (start, start + ch.len_utf8()),
                        )
                    })?;
                i += op.len();
                match *op {
                    "(" | "[" => depth += 1,
                    ")" | "]" => depth = depth.saturating_sub(1),
                    _ => {}
                }
                tokens.push(Token {
                    tok: Tok::Op(*op),
                    span: (start, i),
                });
            }
        }
    }

    tokens.push(Token {
        tok: Tok::Eof,
        span: (src.len(), src.len()),
    });
    Ok(tokens)
}

// =========================================================================
// AST
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum ExprKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Expr>),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
struct Expr {
    kind: ExprKind,
    span: Span,
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Let(String, Expr),
    Return(Expr),
    Expr(Expr),
}

const KEYWORDS: [&str; 11] = [
    "let", "return", "if", "then", "else", "and", "or", "not", "true", "false", "null",
];

// =========================================================================
// Parser
// =========================================================================

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::new(ExprErrorKind::Syntax, message, self.src, self.span())
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Tok::Ident(w) if w == word)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn expect_op(&mut self, op: &str) -> Result<Token, ExprError> {
        if self.is_op(op) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), ExprError> {
        if self.is_keyword(word) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", word)))
        }
    }

    fn skip_separators(&mut self) {
        while *self.peek() == Tok::Sep {
            self.advance();
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ExprError> {
        let mut stmts = Vec::new();
        self.skip_separators();
        while *self.peek() != Tok::Eof {
            stmts.push(self.statement()?);
            match self.peek() {
                Tok::Sep => self.skip_separators(),
                Tok::Eof => {}
                _ => return Err(self.error("expected end of statement")),
            }
        }
        if stmts.is_empty() {
            return Err(self.error("empty expression"));
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, ExprError> {
        if self.is_keyword("let") {
            self.advance();
            let name = match self.advance() {
                Token {
                    tok: Tok::Ident(name),
                    ..
                } if !KEYWORDS.contains(&name.as_str()) => name,
                token => {
                    return Err(ExprError::new(
                        ExprErrorKind::Syntax,
                        "expected a name after 'let'",
                        self.src,
                        token.span,
                    ))
                }
            };
            self.expect_op("=")?;
            return Ok(Stmt::Let(name, self.expression()?));
        }
        if self.is_keyword("return") {
            self.advance();
            return Ok(Stmt::Return(self.expression()?));
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        if self.is_keyword("if") {
            let start = self.advance().span.0;
            let cond = self.expression()?;
            self.expect_keyword("then")?;
            let then = self.expression()?;
            self.expect_keyword("else")?;
            let otherwise = self.expression()?;
            let end = otherwise.span.1;
            return Ok(Expr {
                kind: ExprKind::If(Box::new(cond), Box::new(then), Box::new(otherwise)),
                span: (start, end),
            });
        }
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and_expr()?;
        while self.is_keyword("or") {
            self.advance();
            let right = self.and_expr()?;
            let span = (left.span.0, right.span.1);
            left = Expr {
                kind: ExprKind::Or(Box::new(left), Box::new(right)),
                span,
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.not_expr()?;
        while self.is_keyword("and") {
            self.advance();
            let right = self.not_expr()?;
            let span = (left.span.0, right.span.1);
            left = Expr {
                kind: ExprKind::And(Box::new(left), Box::new(right)),
                span,
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ExprError> {
        if self.is_keyword("not") {
            let start = self.advance().span.0;
            let inner = self.not_expr()?;
            let span = (start, inner.span.1);
            return Ok(Expr {
                kind: ExprKind::Not(Box::new(inner)),
                span,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Tok::Op("==") => BinOp::Eq,
            Tok::Op("!=") => BinOp::Ne,
            Tok::Op("<") => BinOp::Lt,
            Tok::Op("<=") => BinOp::Le,
            Tok::Op(">") => BinOp::Gt,
            Tok::Op(">=") => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        let span = (left.span.0, right.span.1);
        Ok(Expr {
            kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
            span,
        })
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            let span = (left.span.0, right.span.1);
            left = Expr {
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
                span,
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("%") => BinOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            let span = (left.span.0, right.span.1);
            left = Expr {
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
                span,
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.is_op("-") {
            let start = self.advance().span.0;
            let inner = self.unary()?;
            let span = (start, inner.span.1);
            return Ok(Expr {
                kind: ExprKind::Neg(Box::new(inner)),
                span,
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.is_op(".") {
                self.advance();
                let token = self.advance();
                let Tok::Ident(name) = token.tok else {
                    return Err(ExprError::new(
                        ExprErrorKind::Syntax,
                        "expected an attribute name after '.'",
                        self.src,
                        token.span,
                    ));
                };
                let span = (expr.span.0, token.span.1);
                expr = Expr {
                    kind: ExprKind::Attr(Box::new(expr), name),
                    span,
                };
            } else if self.is_op("[") {
                self.advance();
                let index = self.expression()?;
                let end = self.expect_op("]")?.span.1;
                let span = (expr.span.0, end);
                expr = Expr {
                    kind: ExprKind::Index(Box::new(expr), Box::new(index)),
                    span,
                };
            } else if self.is_op("(") {
                let ExprKind::Name(name) = &expr.kind else {
                    return Err(self.error("only named functions can be called"));
                };
                let name = name.clone();
                self.advance();
                let args = self.arguments(")")?;
                let end = self.expect_op(")")?.span.1;
                expr = Expr {
                    kind: ExprKind::Call(name, args),
                    span: (expr.span.0, end),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self, close: &str) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        while !self.is_op(close) {
            args.push(self.expression()?);
            if self.is_op(",") {
                self.advance();
            } else if !self.is_op(close) {
                return Err(self.error(format!("expected ',' or '{}'", close)));
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let token = self.advance();
        let kind = match token.tok {
            Tok::Int(i) => ExprKind::Int(i),
            Tok::Float(f) => ExprKind::Float(f),
            Tok::Str(s) => ExprKind::Str(s),
            Tok::Ident(word) => match word.as_str() {
                "true" => ExprKind::Bool(true),
                "false" => ExprKind::Bool(false),
                "null" => ExprKind::Null,
                w if KEYWORDS.contains(&w) => {
                    return Err(ExprError::new(
                        ExprErrorKind::Syntax,
                        format!("unexpected keyword '{}'", w),
                        self.src,
                        token.span,
                    ))
                }
                _ => ExprKind::Name(word),
            },
            Tok::Op("(") => {
                let inner = self.expression()?;
                let end = self.expect_op(")")?.span.1;
                return Ok(Expr {
                    kind: inner.kind,
                    span: (token.span.0, end),
                });
            }
            Tok::Op("[") => {
                let items = self.arguments("]")?;
                let end = self.expect_op("]")?.span.1;
                return Ok(Expr {
                    kind: ExprKind::List(items),
                    span: (token.span.0, end),
                });
            }
            Tok::Eof => {
                return Err(ExprError::new(
                    ExprErrorKind::Syntax,
                    "unexpected end of expression",
                    self.src,
                    token.span,
                ))
            }
            _ => {
                return Err(ExprError::new(
                    ExprErrorKind::Syntax,
                    "unexpected token",
                    self.src,
                    token.span,
                ))
            }
        };
        Ok(Expr {
            kind,
            span: token.span,
        })
    }
}

// =========================================================================
// Program
// =========================================================================

/// A parsed expression snippet
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    source: String,
    stmts: Vec<Stmt>,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Program {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            src: source,
            tokens,
            pos: 0,
        };
        let stmts = parser.program()?;
        Ok(Self {
            source: source.to_string(),
            stmts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a read-only namespace
    pub fn eval(&self, session: &Session, names: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
        let mut eval = Evaluator {
            src: &self.source,
            session,
            names,
            locals: BTreeMap::new(),
        };
        let mut last = Value::Null;
        for stmt in &self.stmts {
            match stmt {
                Stmt::Let(name, expr) => {
                    let value = eval.eval(expr)?;
                    eval.locals.insert(name.clone(), value);
                    last = Value::Null;
                }
                Stmt::Return(expr) => return eval.eval(expr),
                Stmt::Expr(expr) => last = eval.eval(expr)?,
            }
        }
        Ok(last)
    }
}

struct Evaluator<'a> {
    src: &'a str,
    session: &'a Session,
    names: &'a BTreeMap<String, Value>,
    locals: BTreeMap<String, Value>,
}

impl<'a> Evaluator<'a> {
    fn error(&self, kind: ExprErrorKind, message: impl Into<String>, span: Span) -> ExprError {
        ExprError::new(kind, message, self.src, span)
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        Ok(match &expr.kind {
            ExprKind::Null => Value::Null,
            ExprKind::Bool(b) => Value::Bool(*b),
            ExprKind::Int(i) => Value::Int(*i),
            ExprKind::Float(f) => Value::Float(*f),
            ExprKind::Str(s) => Value::Str(s.clone()),
            ExprKind::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<_, _>>()?,
            ),
            ExprKind::Name(name) => self
                .locals
                .get(name)
                .or_else(|| self.names.get(name))
                .cloned()
                .ok_or_else(|| {
                    self.error(ExprErrorKind::UnknownName, format!("unknown name '{}'", name), expr.span)
                })?,
            ExprKind::Attr(target, attr) => {
                let target = self.eval(target)?;
                self.attribute(&target, attr, expr.span)?
            }
            ExprKind::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                self.index(&target, &index, expr.span)?
            }
            ExprKind::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, args, expr.span)?
            }
            ExprKind::Neg(inner) => match self.eval(inner)? {
                Value::Int(i) => Value::Int(i.checked_neg().ok_or_else(|| {
                    self.error(ExprErrorKind::Type, "integer overflow", expr.span)
                })?),
                Value::Float(f) => Value::Float(-f),
                other => {
                    return Err(self.error(
                        ExprErrorKind::Type,
                        format!("cannot negate {}", other.kind()),
                        expr.span,
                    ))
                }
            },
            ExprKind::Not(inner) => Value::Bool(!self.eval(inner)?.truthy()),
            ExprKind::And(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() {
                    self.eval(right)?
                } else {
                    left
                }
            }
            ExprKind::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() {
                    left
                } else {
                    self.eval(right)?
                }
            }
            ExprKind::If(cond, then, otherwise) => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            ExprKind::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right, expr.span)?
            }
        })
    }

    fn attribute(&self, target: &Value, attr: &str, span: Span) -> Result<Value, ExprError> {
        match target {
            // Missing links resolve to null all the way down
            Value::Null => Ok(Value::Null),
            Value::Entity(entity) => {
                let data = self.session.get(*entity).ok_or_else(|| {
                    self.error(ExprErrorKind::Type, "entity is not part of this session", span)
                })?;
                Ok(match attr {
                    "type" => Value::Str(data.entity_type().to_string()),
                    "id" => data.id().map(Value::Int).unwrap_or(Value::Null),
                    _ => data.get(attr).cloned().unwrap_or(Value::Null),
                })
            }
            Value::Map(map) => Ok(map.get(attr).cloned().unwrap_or(Value::Null)),
            other => Err(self.error(
                ExprErrorKind::Type,
                format!("{} has no attribute '{}'", other.kind(), attr),
                span,
            )),
        }
    }

    fn index(&self, target: &Value, index: &Value, span: Span) -> Result<Value, ExprError> {
        let position = |len: usize, i: i64| -> Result<usize, ExprError> {
            let resolved = if i < 0 { len as i64 + i } else { i };
            if resolved < 0 || resolved >= len as i64 {
                Err(self.error(
                    ExprErrorKind::Index,
                    format!("index {} out of range for length {}", i, len),
                    span,
                ))
            } else {
                Ok(resolved as usize)
            }
        };

        match (target, index) {
            (Value::List(items), Value::Int(i)) => Ok(items[position(items.len(), *i)?].clone()),
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::Str(chars[position(chars.len(), *i)?].to_string()))
            }
            (Value::Map(_) | Value::Entity(_) | Value::Null, Value::Str(key)) => {
                self.attribute(target, key, span)
            }
            (target, index) => Err(self.error(
                ExprErrorKind::Type,
                format!("cannot index {} with {}", target.kind(), index.kind()),
                span,
            )),
        }
    }

    fn binary(&self, op: BinOp, left: Value, right: Value, span: Span) -> Result<Value, ExprError> {
        use Value::*;

        let type_error = |left: &Value, right: &Value| {
            self.error(
                ExprErrorKind::Type,
                format!("unsupported operands {} and {}", left.kind(), right.kind()),
                span,
            )
        };
        let overflow = || self.error(ExprErrorKind::Type, "integer overflow", span);

        match op {
            BinOp::Eq => return Ok(Bool(values_equal(&left, &right))),
            BinOp::Ne => return Ok(Bool(!values_equal(&left, &right))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ordering = match (&left, &right) {
                    (Str(a), Str(b)) => a.partial_cmp(b),
                    _ => match (as_f64(&left), as_f64(&right)) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => return Err(type_error(&left, &right)),
                    },
                };
                let Some(ordering) = ordering else {
                    return Ok(Bool(false));
                };
                return Ok(Bool(match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }));
            }
            _ => {}
        }

        match (op, &left, &right) {
            (BinOp::Add, Str(a), Str(b)) => Ok(Str(format!("{}{}", a, b))),
            (BinOp::Add, List(a), List(b)) => Ok(List(a.iter().chain(b).cloned().collect())),
            (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
                Ok(Str(s.repeat((*n).max(0) as usize)))
            }
            (_, Int(a), Int(b)) => {
                let (a, b) = (*a, *b);
                match op {
                    BinOp::Add => a.checked_add(b).map(Int).ok_or_else(overflow),
                    BinOp::Sub => a.checked_sub(b).map(Int).ok_or_else(overflow),
                    BinOp::Mul => a.checked_mul(b).map(Int).ok_or_else(overflow),
                    BinOp::Div | BinOp::Rem if b == 0 => Err(self.error(
                        ExprErrorKind::DivisionByZero,
                        "division by zero",
                        span,
                    )),
                    // Integer division floors, like frame and padding arithmetic expects
                    BinOp::Div => {
                        let q = a.checked_div(b).ok_or_else(overflow)?;
                        Ok(Int(if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }))
                    }
                    _ => {
                        let r = a.checked_rem(b).ok_or_else(overflow)?;
                        Ok(Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }))
                    }
                }
            }
            _ => {
                let (Some(a), Some(b)) = (as_f64(&left), as_f64(&right)) else {
                    return Err(type_error(&left, &right));
                };
                match op {
                    BinOp::Add => Ok(Float(a + b)),
                    BinOp::Sub => Ok(Float(a - b)),
                    BinOp::Mul => Ok(Float(a * b)),
                    BinOp::Div | BinOp::Rem if b == 0.0 => Err(self.error(
                        ExprErrorKind::DivisionByZero,
                        "division by zero",
                        span,
                    )),
                    BinOp::Div => Ok(Float(a / b)),
                    _ => Ok(Float(a - b * (a / b).floor())),
                }
            }
        }
    }

    fn call(&self, name: &str, args: Vec<Value>, span: Span) -> Result<Value, ExprError> {
        let arity = |min: usize, max: usize| -> Result<(), ExprError> {
            if args.len() < min || args.len() > max {
                let expected = if min == max {
                    min.to_string()
                } else {
                    format!("{} to {}", min, max)
                };
                Err(self.error(
                    ExprErrorKind::Arity,
                    format!("{}() takes {} arguments, got {}", name, expected, args.len()),
                    span,
                ))
            } else {
                Ok(())
            }
        };
        let type_error = |what: &str| {
            self.error(
                ExprErrorKind::Type,
                format!("{}() expects {}", name, what),
                span,
            )
        };

        match name {
            "lower" | "upper" => {
                arity(1, 1)?;
                let s = self.to_text(&args[0]);
                Ok(Value::Str(if name == "lower" {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                }))
            }
            "str" => {
                arity(1, 1)?;
                Ok(Value::Str(self.to_text(&args[0])))
            }
            "int" => {
                arity(1, 1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Int(*i)),
                    Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
                    Value::Bool(b) => Ok(Value::Int(*b as i64)),
                    Value::Str(s) => s
                        .trim()
                        .parse()
                        .map(Value::Int)
                        .map_err(|_| type_error("an integer string")),
                    _ => Err(type_error("a number or numeric string")),
                }
            }
            "float" => {
                arity(1, 1)?;
                match &args[0] {
                    Value::Str(s) => s
                        .trim()
                        .parse()
                        .map(Value::Float)
                        .map_err(|_| type_error("a numeric string")),
                    other => as_f64(other)
                        .map(Value::Float)
                        .ok_or_else(|| type_error("a number or numeric string")),
                }
            }
            "len" => {
                arity(1, 1)?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    Value::Map(map) => map.len(),
                    _ => return Err(type_error("a string, list or map")),
                };
                Ok(Value::Int(len as i64))
            }
            "replace" => {
                arity(3, 3)?;
                let s = self.to_text(&args[0]);
                let from = self.to_text(&args[1]);
                let to = self.to_text(&args[2]);
                Ok(Value::Str(s.replace(&from, &to)))
            }
            "pad" => {
                arity(2, 3)?;
                let s = self.to_text(&args[0]);
                let Value::Int(width) = args[1] else {
                    return Err(type_error("an integer width"));
                };
                let fill = match args.get(2) {
                    Some(fill) => self.to_text(fill).chars().next().unwrap_or('0'),
                    None => '0',
                };
                let missing = (width.max(0) as usize).saturating_sub(s.chars().count());
                Ok(Value::Str(format!(
                    "{}{}",
                    fill.to_string().repeat(missing),
                    s
                )))
            }
            "default" => {
                arity(2, 2)?;
                let mut args = args;
                let fallback = args.pop().unwrap_or(Value::Null);
                let value = args.pop().unwrap_or(Value::Null);
                Ok(match &value {
                    Value::Null => fallback,
                    Value::Str(s) if s.is_empty() => fallback,
                    _ => value,
                })
            }
            "join" => {
                arity(1, 2)?;
                let Value::List(items) = &args[0] else {
                    return Err(type_error("a list"));
                };
                let sep = args.get(1).map(|s| self.to_text(s)).unwrap_or_default();
                Ok(Value::Str(
                    items
                        .iter()
                        .map(|item| self.to_text(item))
                        .collect::<Vec<_>>()
                        .join(&sep),
                ))
            }
            "contains" => {
                arity(2, 2)?;
                let found = match (&args[0], &args[1]) {
                    (Value::List(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                    (Value::Str(s), needle) => s.contains(&self.to_text(needle)),
                    (Value::Map(map), Value::Str(key)) => map.contains_key(key),
                    (Value::Null, _) => false,
                    _ => return Err(type_error("a list, string or map")),
                };
                Ok(Value::Bool(found))
            }
            _ => Err(self.error(
                ExprErrorKind::UnknownFunction,
                format!("unknown function '{}' (available: {})", name, FUNCTIONS.join(", ")),
                span,
            )),
        }
    }

    fn to_text(&self, value: &Value) -> String {
        to_text(self.session, value)
    }
}

/// Text form of a value, as used for names
///
/// Entities use their default name; null is empty.
pub fn to_text(session: &Session, value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() => format!("{:.1}", f),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
        Value::Entity(e) => session.default_name(*e),
        Value::List(items) => items
            .iter()
            .map(|item| to_text(session, item))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, to_text(session, v)))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Record;
    use serde_json::json;

    fn fixture() -> (Session, BTreeMap<String, Value>) {
        let mut session = Session::new();
        let task = session
            .merge(
                json!({
                    "type": "Task", "id": 7, "content": "Animation",
                    "step": {"type": "Step", "id": 2, "code": "anim"},
                    "entity": {"type": "Shot", "id": 3, "code": "AA_010", "cut_in": 1001},
                    "tags": ["hero", "fx"],
                    "meta": {"frames": 48}
                })
                .as_object()
                .unwrap()
                .clone(),
            )
            .unwrap();
        let shot = session.field(task, "entity").unwrap().clone();
        let mut names = BTreeMap::new();
        names.insert("self".to_string(), Value::Entity(task));
        names.insert("Task".to_string(), Value::Entity(task));
        names.insert("Shot".to_string(), shot);
        (session, names)
    }

    fn eval(src: &str) -> Result<Value, ExprError> {
        let (session, names) = fixture();
        Program::parse(src)?.eval(&session, &names)
    }

    fn text(src: &str) -> String {
        match eval(src).unwrap() {
            Value::Str(s) => s,
            other => panic!("expected a string from {src}, got {other:?}"),
        }
    }

    #[test]
    fn test_attribute_access() {
        assert_eq!(text("self.step.code"), "anim");
        assert_eq!(text("Shot.code"), "AA_010");
        assert_eq!(eval("self.id").unwrap(), Value::Int(7));
        assert_eq!(text("self.type"), "Task");
        assert_eq!(eval("self['content']").unwrap(), Value::Str("Animation".into()));
    }

    #[test]
    fn test_missing_fields_are_null() {
        assert_eq!(eval("self.nope").unwrap(), Value::Null);
        assert_eq!(eval("self.nope.deeper").unwrap(), Value::Null);
        assert_eq!(text("default(self.nope, 'x')"), "x");
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let err = eval("Sequence.code").unwrap_err();
        assert_eq!(err.kind(), ExprErrorKind::UnknownName);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Value::Int(9));
        assert_eq!(eval("7 / 2").unwrap(), Value::Int(3));
        assert_eq!(eval("-7 / 2").unwrap(), Value::Int(-4));
        assert_eq!(eval("-7 % 3").unwrap(), Value::Int(2));
        assert_eq!(eval("7.0 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval("Shot.cut_in + 10").unwrap(), Value::Int(1011));
        assert_eq!(text("'a' + 'b'"), "ab");
        assert_eq!(eval("1 / 0").unwrap_err().kind(), ExprErrorKind::DivisionByZero);
        assert_eq!(eval("'a' - 1").unwrap_err().kind(), ExprErrorKind::Type);
    }

    #[test]
    fn test_boolean_logic_and_comparisons() {
        assert_eq!(eval("self.step.code == 'anim'").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 < 2 and 'b' > 'a'").unwrap(), Value::Bool(true));
        assert_eq!(eval("not self.nope").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 == 1.0").unwrap(), Value::Bool(true));
        assert_eq!(text("self.nope or 'fallback'"), "fallback");
        assert_eq!(eval("false and unknown_name").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_conditional() {
        assert_eq!(text("if self.step.code == 'anim' then 'A' else 'B'"), "A");
        assert_eq!(text("if contains(self.tags, 'fx') then 'fx' else 'plain'"), "fx");
    }

    #[test]
    fn test_functions() {
        assert_eq!(text("upper(self.step.code)"), "ANIM");
        assert_eq!(text("lower(self.content)"), "animation");
        assert_eq!(text("pad(self.id, 4)"), "0007");
        assert_eq!(text("pad(self.id, 3, '_')"), "__7");
        assert_eq!(text("replace(Shot.code, '_', '-')"), "AA-010");
        assert_eq!(text("join(self.tags, '+')"), "hero+fx");
        assert_eq!(text("str(self.entity)"), "AA_010");
        assert_eq!(eval("len(self.tags)").unwrap(), Value::Int(2));
        assert_eq!(eval("int('42')").unwrap(), Value::Int(42));
        assert_eq!(eval("float(1)").unwrap(), Value::Float(1.0));
        assert_eq!(eval("self.meta.frames").unwrap(), Value::Int(48));
        assert_eq!(eval("self.tags[-1]").unwrap(), Value::Str("fx".into()));
    }

    #[test]
    fn test_function_errors() {
        assert_eq!(eval("shell('rm')").unwrap_err().kind(), ExprErrorKind::UnknownFunction);
        assert_eq!(eval("upper()").unwrap_err().kind(), ExprErrorKind::Arity);
        assert_eq!(eval("self.tags[5]").unwrap_err().kind(), ExprErrorKind::Index);
    }

    #[test]
    fn test_multi_statement_snippets() {
        let src = "let step = self.step.code\nlet shot = Shot.code\nreturn shot + '_' + step";
        assert_eq!(text(src), "AA_010_anim");
        assert_eq!(text("let a = 'x'; a + a"), "xx");
        // Newlines inside brackets do not end a statement
        assert_eq!(text("join([\n  'a',\n  'b'\n], '')"), "ab");
        // A trailing let yields null
        assert_eq!(eval("let a = 1").unwrap(), Value::Null);
        // Comments are ignored
        assert_eq!(eval("1 # one\n").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_syntax_errors_carry_spans() {
        for bad in ["", "1 +", "if a then b", "let = 3", "(1", "a.", "'open", "1 $ 2", "f(1)(2)"] {
            match Program::parse(bad) {
                Err(e) => assert_eq!(e.kind(), ExprErrorKind::Syntax, "{bad}"),
                Ok(_) => panic!("{bad} should not parse"),
            }
        }
    }

    #[test]
    fn test_evaluation_does_not_touch_the_session() {
        let (session, names) = fixture();
        let before = session.len();
        Program::parse("self.entity.sequence.project.name")
            .unwrap()
            .eval(&session, &names)
            .unwrap();
        assert_eq!(session.len(), before);
        let record: Record = session.to_json(names["self"].as_entity().unwrap());
        assert_eq!(record["content"], "Animation");
    }
}
