//! Embedded expression language.
//!
//! Expressions are compiled once and evaluated many times against a [`Scope`],
//! usually an [`Extent`](crate::Extent). The language supports:
//!
//! - literals: `42`, `-1.5`, `"text"`, `'text'`, `true`, `false`, `null`,
//!   `[1, 2]`, `{"a": 1}`
//! - variable references with field access: `counter`, `order.customer.name`,
//!   `items.0`
//! - arithmetic: `+ - * / %` (`+` concatenates when either side is a string)
//! - comparison: `== != < <= > >=`
//! - logic: `&& || !` over truthiness
//! - unary minus and `(expr)` grouping
//!
//! Integer arithmetic stays integral whenever the result is exact, so a
//! counter incremented with `v + 1` remains an integer.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

/// Variable lookup used during evaluation.
pub trait Scope {
    /// Returns the value bound to `name`, if any.
    fn resolve(&self, name: &str) -> Option<Value>;
}

/// A scope without any variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn resolve(&self, _name: &str) -> Option<Value> {
        None
    }
}

impl Scope for Map<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// A compiled expression.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Compiles an expression from source.
    pub fn new(source: impl Into<String>) -> Result<Self, CoreError> {
        let source = source.into();
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(CoreError::Expression {
                source_text: source.clone(),
                reason: "empty expression".to_string(),
            });
        }

        let mut parser = Parser::new(trimmed);
        let ast = parser
            .parse_complete()
            .map_err(|reason| CoreError::Expression {
                source_text: source.clone(),
                reason,
            })?;

        Ok(Self { source, ast })
    }

    /// Creates an expression that always yields `value`.
    pub fn literal(value: Value) -> Self {
        Self {
            source: value.to_string(),
            ast: Expr::Literal(value),
        }
    }

    /// Returns the source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value, CoreError> {
        self.ast
            .evaluate(scope)
            .map_err(|reason| CoreError::Expression {
                source_text: self.source.clone(),
                reason,
            })
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl TryFrom<String> for Expression {
    type Error = CoreError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::new(source)
    }
}

impl From<Expression> for String {
    fn from(expression: Expression) -> Self {
        expression.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
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

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Variable(Vec<String>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn evaluate(&self, scope: &dyn Scope) -> Result<Value, String> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Variable(path) => {
                let (head, rest) = path
                    .split_first()
                    .ok_or_else(|| "empty variable path".to_string())?;
                let root = scope
                    .resolve(head)
                    .ok_or_else(|| format!("unknown variable '{}'", head))?;
                Ok(get_field(&root, rest))
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| item.evaluate(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.evaluate(scope)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(scope)?))),
            Expr::Neg(inner) => {
                let value = inner.evaluate(scope)?;
                arithmetic(BinaryOp::Sub, &Value::from(0), &value)
            }
            Expr::And(left, right) => {
                if !is_truthy(&left.evaluate(scope)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(scope)?)))
            }
            Expr::Or(left, right) => {
                if is_truthy(&left.evaluate(scope)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(scope)?)))
            }
            Expr::Binary(op, left, right) => {
                let left = left.evaluate(scope)?;
                let right = right.evaluate(scope)?;
                match op {
                    BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
                    BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
                    BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                        compare(*op, &left, &right).map(Value::Bool)
                    }
                    _ => arithmetic(*op, &left, &right),
                }
            }
        }
    }
}

fn get_field(value: &Value, path: &[String]) -> Value {
    let mut current = value;

    for part in path {
        current = match current {
            Value::Object(map) => map.get(part).unwrap_or(&Value::Null),
            Value::Array(items) => match part.parse::<usize>() {
                Ok(index) => items.get(index).unwrap_or(&Value::Null),
                Err(_) => return Value::Null,
            },
            _ => return Value::Null,
        };
    }

    current.clone()
}

/// Returns the truthiness of a value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Compares two values for equality, treating all numbers numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a
                .as_f64()
                .zip(b.as_f64())
                .map(|(a, b)| a == b)
                .unwrap_or(false),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, value)| b.get(key).is_some_and(|other| values_equal(value, other)))
        }
        _ => a == b,
    }
}

/// Returns a value as a float, if it is numeric.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn float_value(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("non-finite result: {}", f))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    if op == BinaryOp::Add && (left.is_string() || right.is_string()) {
        return Ok(Value::String(format!(
            "{}{}",
            display_value(left),
            display_value(right)
        )));
    }

    let (Value::Number(l), Value::Number(r)) = (left, right) else {
        return Err(format!(
            "arithmetic on non-numeric operands {} and {}",
            left, right
        ));
    };

    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err("division by zero".to_string()),
            BinaryOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinaryOp::Div => None,
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::from(result));
        }
    }

    let a = l.as_f64().ok_or_else(|| format!("invalid number {}", l))?;
    let b = r.as_f64().ok_or_else(|| format!("invalid number {}", r))?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err("division by zero".to_string()),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err("not an arithmetic operator".to_string()),
    };
    float_value(result)
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<bool, String> {
    let ordering = match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            let a = as_f64(left).unwrap_or(f64::NAN);
            let b = as_f64(right).unwrap_or(f64::NAN);
            a.partial_cmp(&b)
                .ok_or_else(|| format!("cannot compare {} and {}", left, right))?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => return Err(format!("cannot compare {} and {}", left, right)),
    };

    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => false,
    })
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_complete(&mut self) -> Result<Expr, String> {
        let expr = self.parse_or()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(format!(
                "unexpected input at position {}: '{}'",
                self.pos,
                &self.input[self.pos..]
            ));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;

        loop {
            self.skip_whitespace();
            let op = if self.peek_str("==") {
                BinaryOp::Eq
            } else if self.peek_str("!=") {
                BinaryOp::Ne
            } else {
                return Ok(left);
            };
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;

        loop {
            self.skip_whitespace();
            let (op, width) = if self.peek_str("<=") {
                (BinaryOp::Le, 2)
            } else if self.peek_str(">=") {
                (BinaryOp::Ge, 2)
            } else if self.peek_char() == Some('<') {
                (BinaryOp::Lt, 1)
            } else if self.peek_char() == Some('>') {
                (BinaryOp::Gt, 1)
            } else {
                return Ok(left);
            };
            self.pos += width;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('!') if !self.peek_str("!=") => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some('-') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(match inner {
                    Expr::Literal(Value::Number(n)) => {
                        match n.as_i64().and_then(|i| i.checked_neg()) {
                            Some(i) => Expr::Literal(Value::from(i)),
                            None => Expr::Literal(float_value(-n.as_f64().unwrap_or(0.0))?),
                        }
                    }
                    other => Expr::Neg(Box::new(other)),
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        match self.peek_char() {
            None => Err("unexpected end of expression".to_string()),
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_or()?;
                self.expect(')')?;
                Ok(expr)
            }
            Some('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                self.skip_whitespace();
                if self.peek_char() == Some(']') {
                    self.pos += 1;
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    self.skip_whitespace();
                    match self.peek_char() {
                        Some(',') => self.pos += 1,
                        Some(']') => {
                            self.pos += 1;
                            return Ok(Expr::Array(items));
                        }
                        _ => return Err("expected ',' or ']'".to_string()),
                    }
                }
            }
            Some('{') => {
                self.pos += 1;
                let mut entries = Vec::new();
                self.skip_whitespace();
                if self.peek_char() == Some('}') {
                    self.pos += 1;
                    return Ok(Expr::Object(entries));
                }
                loop {
                    self.skip_whitespace();
                    let key = match self.peek_char() {
                        Some('"') | Some('\'') => self.parse_string()?,
                        _ => self.parse_identifier()?,
                    };
                    self.skip_whitespace();
                    self.expect(':')?;
                    entries.push((key, self.parse_or()?));
                    self.skip_whitespace();
                    match self.peek_char() {
                        Some(',') => self.pos += 1,
                        Some('}') => {
                            self.pos += 1;
                            return Ok(Expr::Object(entries));
                        }
                        _ => return Err("expected ',' or '}'".to_string()),
                    }
                }
            }
            Some('"') | Some('\'') => Ok(Expr::Literal(Value::String(self.parse_string()?))),
            Some(c) if c.is_ascii_digit() => self.parse_number().map(Expr::Literal),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let name = self.parse_identifier()?;
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(Value::Bool(true))),
                    "false" => return Ok(Expr::Literal(Value::Bool(false))),
                    "null" => return Ok(Expr::Literal(Value::Null)),
                    _ => {}
                }

                let mut path = vec![name];
                while self.peek_char() == Some('.') {
                    self.pos += 1;
                    path.push(self.parse_segment()?);
                }
                Ok(Expr::Variable(path))
            }
            Some(c) => Err(format!("unexpected character '{}'", c)),
        }
    }

    fn parse_identifier(&mut self) -> Result<String, String> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let ident = &self.input[start..self.pos];
        if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(format!("invalid identifier at position {}", start));
        }
        Ok(ident.to_string())
    }

    fn parse_segment(&mut self) -> Result<String, String> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        if start == self.pos {
            return Err("empty field name".to_string());
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, String> {
        let quote = self
            .peek_char()
            .ok_or_else(|| "expected string".to_string())?;
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                let escaped = self
                    .peek_char()
                    .ok_or_else(|| "unterminated string".to_string())?;
                self.pos += escaped.len_utf8();
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }

        Err("unterminated string".to_string())
    }

    fn parse_number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        let mut is_float = false;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }

        let text = &self.input[start..self.pos];
        if is_float {
            let f = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number: '{}'", text))?;
            float_value(f)
        } else {
            match text.parse::<i64>() {
                Ok(i) => Ok(Value::from(i)),
                Err(_) => text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number: '{}'", text))
                    .and_then(float_value),
            }
        }
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        self.skip_whitespace();
        if self.peek_char() != Some(c) {
            return Err(format!("expected '{}'", c));
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
