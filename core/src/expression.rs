//! Expression language for watch expressions and breakpoint conditions.
//!
//! Expressions are evaluated against the [`ExecutionContext`] of a paused
//! step (or, for conditions, of the step being checked).
//!
//! # Supported syntax
//!
//! - **Literals**: numbers, double-quoted strings, `true`, `false`, `null`
//! - **Paths**: `request.url`, `items[0]`, `headers["content-type"]`
//! - **Comparisons**: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - **Logic**: `&&`, `||`, `!` (short-circuiting)
//! - **Arithmetic**: `+`, `-`, `*`, `/`, `%` (`+` concatenates strings)
//! - **Functions**: `len(x)`, `contains(haystack, needle)`,
//!   `starts_with(s, prefix)`, `ends_with(s, suffix)`
//!
//! # Example
//!
//! ```rust
//! use tracelens_core::expression::{Expression, Scope};
//! use tracelens_core::trace::ExecutionContext;
//! use serde_json::json;
//!
//! let ctx = ExecutionContext::new()
//!     .with_variable("url", json!("https://example.com"))
//!     .with_variable("retries", json!(3));
//!
//! let expr = Expression::parse("retries > 2 && starts_with(url, \"https\")").unwrap();
//! assert_eq!(expr.evaluate(&Scope::of(&ctx)).unwrap(), json!(true));
//! ```

use crate::errors::{EvalResult, EvaluationError};
use crate::trace::ExecutionContext;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

// ============================================================================
// SCOPE
// ============================================================================

/// Name resolution for evaluation: a stack of variable maps searched in
/// order, first hit wins.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    layers: Vec<&'a Map<String, Value>>,
}

impl<'a> Scope<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope over a single execution context
    pub fn of(context: &'a ExecutionContext) -> Self {
        Self {
            layers: vec![&context.variables],
        }
    }

    /// Add a lower-priority layer
    pub fn with_layer(mut self, layer: &'a Map<String, Value>) -> Self {
        self.layers.push(layer);
        self
    }

    fn lookup(&self, name: &str) -> Option<&'a Value> {
        self.layers.iter().find_map(|layer| layer.get(name))
    }
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Name(String),
    Field {
        target: Box<Expr>,
        field: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn binding_power(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
        }
    }
}

impl Expr {
    /// Render a path expression the way a user would write it, for error
    /// messages.
    fn describe(&self) -> String {
        match self {
            Expr::Name(name) => name.clone(),
            Expr::Field { target, field } => format!("{}.{}", target.describe(), field),
            Expr::Index { target, index } => match index.as_ref() {
                Expr::Literal(Value::String(s)) => format!("{}[\"{}\"]", target.describe(), s),
                Expr::Literal(v) => format!("{}[{}]", target.describe(), v),
                other => format!("{}[{}]", target.describe(), other.describe()),
            },
            Expr::Literal(v) => v.to_string(),
            Expr::Call { function, .. } => format!("{}(..)", function),
            Expr::Unary { .. } | Expr::Binary { .. } => "<expression>".to_string(),
        }
    }
}

// ============================================================================
// LEXER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Eof,
}

fn parse_error(position: usize, message: impl Into<String>) -> EvaluationError {
    EvaluationError::Parse {
        position,
        message: message.into(),
    }
}

fn eat(chars: &mut Peekable<CharIndices<'_>>, expected: char) -> bool {
    if chars.peek().map(|&(_, c)| c) == Some(expected) {
        chars.next();
        true
    } else {
        false
    }
}

fn tokenize(input: &str) -> EvalResult<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        chars.next();

        let token = match ch {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '=' if eat(&mut chars, '=') => Token::EqEq,
            '=' => return Err(parse_error(pos, "expected '==' for equality")),
            '!' if eat(&mut chars, '=') => Token::NotEq,
            '!' => Token::Bang,
            '<' if eat(&mut chars, '=') => Token::Le,
            '<' => Token::Lt,
            '>' if eat(&mut chars, '=') => Token::Ge,
            '>' => Token::Gt,
            '&' if eat(&mut chars, '&') => Token::AndAnd,
            '&' => return Err(parse_error(pos, "expected '&&'")),
            '|' if eat(&mut chars, '|') => Token::OrOr,
            '|' => return Err(parse_error(pos, "expected '||'")),
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, 'r')) => s.push('\r'),
                            Some((_, '\\')) => s.push('\\'),
                            Some((_, '"')) => s.push('"'),
                            Some((at, other)) => {
                                return Err(parse_error(at, format!("unknown escape '\\{}'", other)))
                            }
                            None => return Err(parse_error(input.len(), "unterminated string")),
                        },
                        Some((_, c)) => s.push(c),
                        None => return Err(parse_error(input.len(), "unterminated string")),
                    }
                }
                Token::Str(s)
            }
            '0'..='9' => {
                let mut end = pos + ch.len_utf8();
                while let Some(&(at, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        end = at + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &input[pos..end];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(pos, format!("invalid number '{}'", text)))?;
                Token::Number(n)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = pos + c.len_utf8();
                while let Some(&(at, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        end = at + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                match &input[pos..end] {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    ident => Token::Ident(ident.to_string()),
                }
            }
            other => return Err(parse_error(pos, format!("unexpected character '{}'", other))),
        };
        tokens.push((pos, token));
    }

    tokens.push((input.len(), Token::Eof));
    Ok(tokens)
}

// ============================================================================
// PARSER
// ============================================================================

/// Deepest nesting of sub-expressions, operator chains and accessors
/// accepted by the parser
pub const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> EvalResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(parse_error(self.position(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.cursor].1
    }

    fn position(&self) -> usize {
        self.tokens[self.cursor].0
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.cursor].1.clone();
        if self.cursor + 1 < self.tokens.len() {
            self.cursor += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> EvalResult<()> {
        if *self.peek() == expected {
            self.bump();
            Ok(())
        } else {
            Err(parse_error(self.position(), format!("expected {}", what)))
        }
    }

    fn binary_op(&self) -> Option<BinaryOp> {
        Some(match self.peek() {
            Token::OrOr => BinaryOp::Or,
            Token::AndAnd => BinaryOp::And,
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Rem,
            _ => return None,
        })
    }

    fn expression(&mut self, min_power: u8) -> EvalResult<Expr> {
        self.descend()?;
        let mut levels = 1;
        let mut left = self.unary()?;
        while let Some(op) = self.binary_op() {
            if op.binding_power() < min_power {
                break;
            }
            self.bump();
            // Each fold deepens the left operand
            self.descend()?;
            levels += 1;
            let right = self.expression(op.binding_power() + 1)?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        self.depth -= levels;
        Ok(left)
    }

    fn unary(&mut self) -> EvalResult<Expr> {
        let op = match self.peek() {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.bump();
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> EvalResult<Expr> {
        let mut expr = self.primary()?;
        let mut levels = 0;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.descend()?;
                    levels += 1;
                    self.bump();
                    match self.bump() {
                        Token::Ident(field) => {
                            expr = Expr::Field {
                                target: Box::new(expr),
                                field,
                            }
                        }
                        _ => {
                            return Err(parse_error(
                                self.position(),
                                "expected field name after '.'",
                            ))
                        }
                    }
                }
                Token::LBracket => {
                    self.descend()?;
                    levels += 1;
                    self.bump();
                    let index = self.expression(0)?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => {
                    self.depth -= levels;
                    return Ok(expr);
                }
            }
        }
    }

    fn primary(&mut self) -> EvalResult<Expr> {
        let position = self.position();
        match self.bump() {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) if *self.peek() == Token::LParen => {
                self.bump();
                let mut args = Vec::new();
                if *self.peek() != Token::RParen {
                    loop {
                        args.push(self.expression(0)?);
                        if *self.peek() == Token::Comma {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen, "')' to close argument list")?;
                Ok(Expr::Call {
                    function: name,
                    args,
                })
            }
            Token::Ident(name) => Ok(Expr::Name(name)),
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Eof => Err(parse_error(position, "unexpected end of expression")),
            other => Err(parse_error(position, format!("unexpected token {:?}", other))),
        }
    }
}

// ============================================================================
// EXPRESSION
// ============================================================================

/// A parsed expression, reusable across evaluations
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Expression {
    /// Parse an expression, rejecting empty or malformed input
    pub fn parse(source: &str) -> EvalResult<Self> {
        if source.trim().is_empty() {
            return Err(EvaluationError::EmptyExpression);
        }
        let mut parser = Parser {
            tokens: tokenize(source)?,
            cursor: 0,
            depth: 0,
        };
        let root = parser.expression(0)?;
        if *parser.peek() != Token::Eof {
            return Err(parse_error(parser.position(), "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &Scope<'_>) -> EvalResult<Value> {
        eval(&self.root, scope)
    }

    /// Evaluate and coerce the result to a boolean
    pub fn evaluate_bool(&self, scope: &Scope<'_>) -> EvalResult<bool> {
        self.evaluate(scope).map(|v| truthy(&v))
    }
}

/// Parse and evaluate in one go
pub fn evaluate(source: &str, context: &ExecutionContext) -> EvalResult<Value> {
    Expression::parse(source)?.evaluate(&Scope::of(context))
}

// ============================================================================
// EVALUATION
// ============================================================================

fn eval(expr: &Expr, scope: &Scope<'_>) -> EvalResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => scope
            .lookup(name)
            .cloned()
            .ok_or_else(|| EvaluationError::UndefinedName { name: name.clone() }),
        Expr::Field { target, field } => match eval(target, scope)? {
            Value::Object(mut map) => map.remove(field).ok_or_else(|| undefined(expr)),
            other => Err(type_mismatch(format!(
                "cannot read field '{}' of {}",
                field,
                type_name(&other)
            ))),
        },
        Expr::Index { target, index } => {
            let container = eval(target, scope)?;
            let key = eval(index, scope)?;
            match (container, key) {
                (Value::Array(mut items), Value::Number(n)) => {
                    let i = n
                        .as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                        .ok_or_else(|| type_mismatch(format!("invalid array index {}", n)))?
                        as usize;
                    if i < items.len() {
                        Ok(items.swap_remove(i))
                    } else {
                        Err(undefined(expr))
                    }
                }
                (Value::Object(mut map), Value::String(k)) => {
                    map.remove(&k).ok_or_else(|| undefined(expr))
                }
                (container, key) => Err(type_mismatch(format!(
                    "cannot index {} with {}",
                    type_name(&container),
                    type_name(&key)
                ))),
            }
        }
        Expr::Call { function, args } => {
            let values = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<EvalResult<Vec<_>>>()?;
            call(function, &values)
        }
        Expr::Unary { op, operand } => {
            let v = eval(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => Ok(number(-as_number(&v)?)),
            }
        }
        Expr::Binary { left, op, right } => {
            // Logical operators short-circuit so guards like
            // `contains(ctx, "x") && ctx.x > 1` work.
            match op {
                BinaryOp::And => {
                    let l = eval(left, scope)?;
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    return Ok(Value::Bool(truthy(&eval(right, scope)?)));
                }
                BinaryOp::Or => {
                    let l = eval(left, scope)?;
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    return Ok(Value::Bool(truthy(&eval(right, scope)?)));
                }
                _ => {}
            }
            let l = eval(left, scope)?;
            let r = eval(right, scope)?;
            binary(*op, &l, &r)
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> EvalResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!equal(l, r))),
        BinaryOp::Lt => compare(l, r).map(|o| Value::Bool(o.is_lt())),
        BinaryOp::Le => compare(l, r).map(|o| Value::Bool(o.is_le())),
        BinaryOp::Gt => compare(l, r).map(|o| Value::Bool(o.is_gt())),
        BinaryOp::Ge => compare(l, r).map(|o| Value::Bool(o.is_ge())),
        BinaryOp::Add => match (l, r) {
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, display(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", display(a), b))),
            _ => Ok(number(as_number(l)? + as_number(r)?)),
        },
        BinaryOp::Sub => Ok(number(as_number(l)? - as_number(r)?)),
        BinaryOp::Mul => Ok(number(as_number(l)? * as_number(r)?)),
        BinaryOp::Div | BinaryOp::Rem => {
            let divisor = as_number(r)?;
            if divisor == 0.0 {
                return Err(EvaluationError::DivisionByZero);
            }
            let dividend = as_number(l)?;
            Ok(number(if op == BinaryOp::Div {
                dividend / divisor
            } else {
                dividend % divisor
            }))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit in eval"),
    }
}

fn call(function: &str, args: &[Value]) -> EvalResult<Value> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(type_mismatch(format!(
                "{}() takes {} argument(s), got {}",
                function,
                n,
                args.len()
            )))
        }
    };

    match function {
        "len" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(type_mismatch(format!(
                        "len() is not defined for {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::Number(Number::from(n as u64)))
        }
        "contains" => {
            arity(2)?;
            let found = match (&args[0], &args[1]) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|i| equal(i, needle)),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                (haystack, _) => {
                    return Err(type_mismatch(format!(
                        "contains() is not defined for {}",
                        type_name(haystack)
                    )))
                }
            };
            Ok(Value::Bool(found))
        }
        "starts_with" | "ends_with" => {
            arity(2)?;
            match (&args[0], &args[1]) {
                (Value::String(s), Value::String(affix)) => Ok(Value::Bool(if function == "starts_with" {
                    s.starts_with(affix.as_str())
                } else {
                    s.ends_with(affix.as_str())
                })),
                _ => Err(type_mismatch(format!("{}() expects two strings", function))),
            }
        }
        _ => Err(EvaluationError::UnknownFunction {
            name: function.to_string(),
        }),
    }
}

fn undefined(expr: &Expr) -> EvaluationError {
    EvaluationError::UndefinedName {
        name: expr.describe(),
    }
}

fn type_mismatch(message: String) -> EvaluationError {
    EvaluationError::TypeMismatch { message }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Integral results are stored as integers so they compare equal to
/// integer JSON input.
fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_number(v: &Value) -> EvalResult<f64> {
    match v {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| type_mismatch(format!("cannot use string '{}' as a number", s))),
        other => Err(type_mismatch(format!(
            "cannot use {} as a number",
            type_name(other)
        ))),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> EvalResult<std::cmp::Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .ok_or_else(|| type_mismatch("numbers are not comparable".to_string())),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(type_mismatch(format!(
            "cannot compare {} with {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::from_json(json!({
            "url": "https://example.com/items",
            "retries": 3,
            "items": [10, 20, 30],
            "request": {
                "method": "GET",
                "headers": { "content-type": "application/json" }
            },
            "enabled": true
        }))
    }

    fn eval_str(source: &str) -> EvalResult<Value> {
        evaluate(source, &ctx())
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval_str("42").unwrap(), json!(42));
        assert_eq!(eval_str("1.5").unwrap(), json!(1.5));
        assert_eq!(eval_str("\"hi\\n\"").unwrap(), json!("hi\n"));
        assert_eq!(eval_str("null").unwrap(), json!(null));
    }

    #[test]
    fn test_paths_and_indexing() {
        assert_eq!(eval_str("request.method").unwrap(), json!("GET"));
        assert_eq!(eval_str("items[1]").unwrap(), json!(20));
        assert_eq!(
            eval_str("request.headers[\"content-type\"]").unwrap(),
            json!("application/json")
        );
        assert_eq!(eval_str("items[retries - 1]").unwrap(), json!(30));
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval_str("2 + 3 * 4").unwrap(), json!(14));
        assert_eq!(eval_str("(2 + 3) * 4").unwrap(), json!(20));
        assert_eq!(eval_str("retries % 2").unwrap(), json!(1));
        assert_eq!(eval_str("-retries").unwrap(), json!(-3));
        assert_eq!(eval_str("7 / 2").unwrap(), json!(3.5));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval_str("retries == 3").unwrap(), json!(true));
        assert_eq!(eval_str("retries >= 3 && enabled").unwrap(), json!(true));
        assert_eq!(eval_str("retries < 1 || !enabled").unwrap(), json!(false));
        assert_eq!(eval_str("request.method != \"POST\"").unwrap(), json!(true));
        assert_eq!(eval_str("\"abc\" < \"abd\"").unwrap(), json!(true));
    }

    #[test]
    fn test_short_circuit_skips_undefined_names() {
        assert_eq!(eval_str("false && missing > 1").unwrap(), json!(false));
        assert_eq!(eval_str("true || missing").unwrap(), json!(true));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval_str("len(items)").unwrap(), json!(3));
        assert_eq!(eval_str("len(url) > 10").unwrap(), json!(true));
        assert_eq!(eval_str("contains(url, \"example\")").unwrap(), json!(true));
        assert_eq!(eval_str("contains(items, 20)").unwrap(), json!(true));
        assert_eq!(eval_str("contains(request, \"method\")").unwrap(), json!(true));
        assert_eq!(eval_str("starts_with(url, \"https\")").unwrap(), json!(true));
        assert_eq!(eval_str("ends_with(url, \"/items\")").unwrap(), json!(true));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            eval_str("request.method + \" \" + retries").unwrap(),
            json!("GET 3")
        );
    }

    #[test]
    fn test_undefined_names() {
        assert_eq!(
            eval_str("missing").unwrap_err(),
            EvaluationError::UndefinedName {
                name: "missing".to_string()
            }
        );
        assert_eq!(
            eval_str("request.body").unwrap_err(),
            EvaluationError::UndefinedName {
                name: "request.body".to_string()
            }
        );
        assert!(matches!(
            eval_str("items[7]"),
            Err(EvaluationError::UndefinedName { .. })
        ));
    }

    #[test]
    fn test_malformed_expressions() {
        assert_eq!(
            Expression::parse("   ").unwrap_err(),
            EvaluationError::EmptyExpression
        );
        assert!(matches!(
            Expression::parse("retries ="),
            Err(EvaluationError::Parse { position: 8, .. })
        ));
        assert!(matches!(
            Expression::parse("(retries"),
            Err(EvaluationError::Parse { .. })
        ));
        assert!(matches!(
            Expression::parse("retries retries"),
            Err(EvaluationError::Parse { .. })
        ));
        assert!(matches!(
            Expression::parse("\"open"),
            Err(EvaluationError::Parse { .. })
        ));
    }

    #[test]
    fn test_runtime_errors() {
        assert_eq!(
            eval_str("retries / 0").unwrap_err(),
            EvaluationError::DivisionByZero
        );
        assert!(matches!(
            eval_str("nope(1)"),
            Err(EvaluationError::UnknownFunction { .. })
        ));
        assert!(matches!(
            eval_str("items < 3"),
            Err(EvaluationError::TypeMismatch { .. })
        ));
        assert!(matches!(
            eval_str("len(1, 2)"),
            Err(EvaluationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_scope_layers() {
        let context = ctx();
        let mut extra = Map::new();
        extra.insert("retries".to_string(), json!(99));
        extra.insert("step".to_string(), json!({"name": "fetch"}));

        let scope = Scope::of(&context).with_layer(&extra);
        let expr = Expression::parse("retries == 3 && step.name == \"fetch\"").unwrap();
        assert!(expr.evaluate_bool(&scope).unwrap());
    }

    fn nested_too_deeply(result: EvalResult<Expression>) -> bool {
        matches!(
            result,
            Err(EvaluationError::Parse { ref message, .. }) if message == "expression nested too deeply"
        )
    }

    #[test]
    fn test_nesting_limit() {
        let shallow = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(eval_str(&shallow).unwrap(), json!(1));

        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(nested_too_deeply(Expression::parse(&parens)));

        let negations = format!("{}true", "!".repeat(100_000));
        assert!(nested_too_deeply(Expression::parse(&negations)));
    }

    #[test]
    fn test_long_chains_are_bounded() {
        let sum = vec!["1"; 100].join(" + ");
        assert_eq!(eval_str(&sum).unwrap(), json!(100));

        let chain = vec!["retries"; 100_000].join(" + ");
        assert!(nested_too_deeply(Expression::parse(&chain)));

        let fields = format!("request{}", ".method".repeat(100_000));
        assert!(nested_too_deeply(Expression::parse(&fields)));

        let indexes = format!("items{}", "[0]".repeat(100_000));
        assert!(nested_too_deeply(Expression::parse(&indexes)));
    }
}
